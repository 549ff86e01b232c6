//! Device communication client.
//!
//! The firmware only speaks the binary protocol during the settle window
//! right after reset. Every session therefore starts by pulsing the reset
//! line (RTS on ESP32 dev boards) and polling GetVersion until it answers.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::Result;
use serialport::SerialPort;

use crate::protocol::{
    build_command, build_command_payload, cobs_decode, cobs_encode, parse_response, CommandId,
    Response, ResponseId,
};

/// How long to keep polling for the session after reset
const SESSION_ATTEMPT_WINDOW: Duration = Duration::from_millis(2500);

/// Interval between GetVersion probes while the board boots
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Find ports belonging to flashed boards by resetting each USB-UART bridge
/// and checking that the settings session answers.
pub fn find_data_ports(baud_rate: u32) -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    let mut data_ports = Vec::new();

    for port_info in ports {
        // CP210x / CH340 bridges show up as ttyUSB, native CDC as ttyACM
        if !port_info.port_name.contains("ttyUSB") && !port_info.port_name.contains("ttyACM") {
            continue;
        }

        if let Ok(mut client) = DeviceClient::new(&port_info.port_name, baud_rate) {
            if client.enter_session().is_ok() {
                data_ports.push(port_info.port_name.clone());
            }
        }
    }

    Ok(data_ports)
}

/// Resolve a port argument - returns the port path if not "auto", otherwise auto-detects.
pub fn resolve_port(port_arg: &str, baud_rate: u32) -> Result<String> {
    if port_arg != "auto" {
        return Ok(port_arg.to_string());
    }

    match find_data_ports(baud_rate)?.into_iter().next() {
        Some(port) => Ok(port),
        None => anyhow::bail!("No device found - ensure a flashed board is connected"),
    }
}

/// Resolve two port arguments for dual-device tests.
pub fn resolve_two_ports(port_a: &str, port_b: &str, baud_rate: u32) -> Result<(String, String)> {
    match (port_a, port_b) {
        ("auto", "auto") => {
            let ports = find_data_ports(baud_rate)?;
            if ports.len() < 2 {
                anyhow::bail!(
                    "Need at least 2 devices connected, found {}. Ports: {:?}",
                    ports.len(),
                    ports
                );
            }
            Ok((ports[0].clone(), ports[1].clone()))
        }
        ("auto", b) => Ok((resolve_port("auto", baud_rate)?, b.to_string())),
        (a, "auto") => Ok((a.to_string(), resolve_port("auto", baud_rate)?)),
        (a, b) => Ok((a.to_string(), b.to_string())),
    }
}

/// Client for communicating with the link firmware.
pub struct DeviceClient {
    port: Box<dyn SerialPort>,
    timeout: Duration,
    /// Console bytes not yet returned as a line
    pending: Vec<u8>,
}

impl DeviceClient {
    pub fn new(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()?;

        Ok(Self {
            port,
            timeout: Duration::from_secs(2),
            pending: Vec::new(),
        })
    }

    /// Pulse EN through RTS, keeping IO0 (DTR) released so the app boots.
    pub fn reset(&mut self) -> Result<()> {
        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(true)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.write_request_to_send(false)?;
        self.pending.clear();
        Ok(())
    }

    /// Reset the board and wait until the settings session answers.
    pub fn enter_session(&mut self) -> Result<()> {
        self.reset()?;

        let old_timeout = self.timeout;
        self.timeout = PROBE_INTERVAL;
        let start = Instant::now();

        let result = loop {
            if start.elapsed() > SESSION_ATTEMPT_WINDOW {
                break Err(anyhow::anyhow!("Device did not open a settings session"));
            }

            // Boot ROM chatter decodes as garbage; keep probing until a clean reply
            if let Ok(response) = self.send_command(CommandId::GetVersion, &[]) {
                if response.resp_id == ResponseId::Version {
                    break Ok(());
                }
            }
        };
        self.timeout = old_timeout;
        result?;

        // Probes queued during boot are answered late; discard those replies
        std::thread::sleep(PROBE_INTERVAL);
        self.clear_buffer()
    }

    /// Clear any pending data in the serial buffer.
    pub fn clear_buffer(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;
        self.pending.clear();
        Ok(())
    }

    /// Send a command and wait for response.
    pub fn send_command(&mut self, cmd_id: CommandId, payload: &[u8]) -> Result<Response> {
        self.send_frame(&build_command(cmd_id, payload))
    }

    /// Send a raw command with custom command ID (for testing invalid commands).
    pub fn send_raw_command(&mut self, cmd_id: u8, payload: &[u8]) -> Result<Response> {
        self.send_frame(&cobs_encode(&build_command_payload(cmd_id, payload)))
    }

    /// Send an arbitrary unencoded frame, e.g. with a corrupted CRC.
    pub fn send_unchecked(&mut self, raw: &[u8]) -> Result<Response> {
        self.send_frame(&cobs_encode(raw))
    }

    fn send_frame(&mut self, encoded: &[u8]) -> Result<Response> {
        self.port.write_all(encoded)?;
        self.port.flush()?;

        let frame = self.read_frame()?;
        let decoded = cobs_decode(&frame)?;
        parse_response(&decoded)
    }

    /// Read bytes up to and including the zero delimiter.
    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = [0u8; 1];
        let start = Instant::now();

        while start.elapsed() < self.timeout {
            match self.port.read(&mut buf) {
                Ok(1) => {
                    if buf[0] == 0x00 {
                        if !data.is_empty() {
                            data.push(0x00);
                            return Ok(data);
                        }
                    } else {
                        data.push(buf[0]);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }

        anyhow::bail!(
            "Timeout waiting for response, got {} bytes: {:02x?}",
            data.len(),
            data
        );
    }

    /// Read the next CRLF-terminated console line (without the terminator).
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let start = Instant::now();
        let mut buf = [0u8; 64];

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if start.elapsed() >= timeout {
                return Ok(None);
            }

            match self.port.read(&mut buf) {
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait for a console line starting with `prefix`, returning the whole line.
    pub fn wait_for_line(&mut self, prefix: &str, timeout: Duration) -> Result<String> {
        let start = Instant::now();

        while start.elapsed() < timeout {
            let remaining = timeout.saturating_sub(start.elapsed());
            if let Some(line) = self.read_line(remaining)? {
                if line.starts_with(prefix) {
                    return Ok(line);
                }
            }
        }

        anyhow::bail!("Timeout waiting for line starting with {:?}", prefix)
    }
}
