//! Integration tests for the SX1262 link firmware.
//!
//! Run after flashing the firmware. Resets the board and exercises the
//! settings session inside its startup window.

mod device;
mod protocol;

use clap::Parser;
use colored::Colorize;

use device::{resolve_port, DeviceClient};
use tests::{print_results, run_all_tests};

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "Integration tests for the SX1262 link firmware")]
struct Args {
    /// Serial port for the device (use "auto" to auto-detect)
    #[arg(short, long, default_value = "auto")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let port = resolve_port(&args.port, args.baud)?;

    println!("{}", "SX1262 Link Integration Tests".bold());
    println!("Port: {}", port);
    println!("Baud: {}", args.baud);
    println!();

    println!("Resetting device into settings session...");
    let mut device = DeviceClient::new(&port, args.baud)?;
    device.enter_session()?;
    println!("{}", "Connected!".green());

    println!("\nRunning tests...\n");

    let results = run_all_tests(&mut device);
    print_results(&results);

    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
