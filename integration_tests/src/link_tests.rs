//! Two-device link integration tests.
//!
//! Configures one board as master and the other as slave through the
//! settings session, then checks the console output of both ends.
//! Requires two flashed boards connected to the host.

mod device;
mod protocol;

use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use device::{resolve_two_ports, DeviceClient};
use protocol::{CommandId, ResponseId, Role, Settings, TEST_PAYLOAD};

/// Master interval used by the test, short enough to see several cycles
const TEST_INTERVAL_MS: u32 = 2_000;

#[derive(Parser)]
#[command(name = "link-tests")]
#[command(about = "Two-device master/slave link tests")]
struct Args {
    /// Serial port for the master board (use "auto" to auto-detect)
    #[arg(long, default_value = "auto")]
    port_a: String,

    /// Serial port for the slave board (use "auto" to auto-detect)
    #[arg(long, default_value = "auto")]
    port_b: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (port_a, port_b) = resolve_two_ports(&args.port_a, &args.port_b, args.baud)?;

    println!("{}", "SX1262 Two-Device Link Tests".bold());
    println!("Master: {}", port_a);
    println!("Slave:  {}", port_b);
    println!("Baud: {}", args.baud);
    println!();

    let mut master = DeviceClient::new(&port_a, args.baud)?;
    let mut slave = DeviceClient::new(&port_b, args.baud)?;

    // Each board only listens during its own settle window, so configure
    // and start them one at a time
    println!("Starting master...");
    start_with_role(&mut master, Role::Master)?;
    println!("Starting slave...");
    start_with_role(&mut slave, Role::Slave)?;
    println!("{}", "Both boards running!".green());

    println!("\n{}", "Running link tests...".bold());
    println!();

    let mut passed = 0;
    let mut failed = 0;

    let tests: [(&str, fn(&mut DeviceClient, &mut DeviceClient) -> anyhow::Result<()>); 3] = [
        ("Boards print their role banner", test_banners),
        ("Slave receives the test payload", test_slave_receives),
        ("Counters advance every interval", test_counters_advance),
    ];

    for (i, (name, test)) in tests.iter().enumerate() {
        print!("  Test {}: {} ... ", i + 1, name);
        std::io::Write::flush(&mut std::io::stdout())?;
        match test(&mut master, &mut slave) {
            Ok(()) => {
                println!("{}", "PASS".green().bold());
                passed += 1;
            }
            Err(e) => {
                println!("{}", "FAIL".red().bold());
                println!("    {}", e.to_string().red());
                failed += 1;
            }
        }
    }

    println!();
    println!("{}", "=".repeat(50));
    println!(
        "Results: {} passed, {} failed",
        passed.to_string().green(),
        if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        }
    );

    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Reset a board, set its role and the test interval, then start the link.
fn start_with_role(device: &mut DeviceClient, role: Role) -> anyhow::Result<()> {
    device.enter_session()?;

    let response = device.send_command(CommandId::GetSettings, &[])?;
    if response.resp_id != ResponseId::Settings {
        anyhow::bail!("Expected Settings response, got {:?}", response.resp_id);
    }
    let settings = Settings {
        tx_interval_ms: TEST_INTERVAL_MS,
        ..Settings::from_bytes(&response.payload)?.with_role(role)
    };

    let ack = device.send_command(CommandId::SetSettings, &settings.to_bytes())?;
    if ack.resp_id != ResponseId::Ack {
        anyhow::bail!("SetSettings not acknowledged: {:?}", ack);
    }
    let ack = device.send_command(CommandId::Start, &[])?;
    if ack.resp_id != ResponseId::Ack {
        anyhow::bail!("Start not acknowledged: {:?}", ack);
    }

    device.wait_for_line("Init success!", Duration::from_secs(3))?;
    Ok(())
}

fn test_banners(master: &mut DeviceClient, slave: &mut DeviceClient) -> anyhow::Result<()> {
    master.wait_for_line("SX1262 demo master!", Duration::from_secs(2))?;
    let freq = master.wait_for_line("Frequency:", Duration::from_secs(2))?;
    if !freq.ends_with("Hz") {
        anyhow::bail!("Malformed frequency line: {:?}", freq);
    }
    master.wait_for_line("TX Power:", Duration::from_secs(2))?;
    slave.wait_for_line("SX1262 demo slave!", Duration::from_secs(2))?;
    Ok(())
}

fn test_slave_receives(_master: &mut DeviceClient, slave: &mut DeviceClient) -> anyhow::Result<()> {
    let timeout = Duration::from_millis(3 * TEST_INTERVAL_MS as u64);
    let line = slave.wait_for_line("rx_cnt = ", timeout)?;

    let expected_suffix = format!("data:{}", TEST_PAYLOAD);
    if !line.ends_with(&expected_suffix) {
        anyhow::bail!("Unexpected RX line: {:?}", line);
    }
    Ok(())
}

fn test_counters_advance(master: &mut DeviceClient, slave: &mut DeviceClient) -> anyhow::Result<()> {
    let timeout = Duration::from_millis(3 * TEST_INTERVAL_MS as u64);

    let first = counter(&master.wait_for_line("tx_cnt = ", timeout)?)?;
    let second = counter(&master.wait_for_line("tx_cnt = ", timeout)?)?;
    if second != first + 1 {
        anyhow::bail!("tx_cnt went from {} to {}", first, second);
    }

    let rx_first = counter(&slave.wait_for_line("rx_cnt = ", timeout)?)?;
    let rx_second = counter(&slave.wait_for_line("rx_cnt = ", timeout)?)?;
    if rx_second <= rx_first {
        anyhow::bail!("rx_cnt went from {} to {}", rx_first, rx_second);
    }
    Ok(())
}

/// Extract N from "tx_cnt = N" or "rx_cnt = N data:..."
fn counter(line: &str) -> anyhow::Result<u32> {
    line.split('=')
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("No counter in {:?}", line))
}
