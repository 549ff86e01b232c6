//! Protocol definitions matching the firmware.

#![allow(dead_code)]

use crc::{Crc, CRC_16_XMODEM};

/// Protocol version (must match firmware)
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded size of a settings block
pub const SETTINGS_LEN: usize = 14;

/// Payload the master sends every cycle
pub const TEST_PAYLOAD: &str = "www.nicerf.com";

/// Command IDs matching the firmware protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    GetVersion = 0x01,
    GetSettings = 0x02,
    SetSettings = 0x20,
    Start = 0x21,
}

/// Response status codes matching the firmware protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    InvalidCommand = 0x01,
    InvalidLength = 0x02,
    CrcError = 0x03,
    InvalidVersion = 0x04,
    InvalidSettings = 0x05,
}

impl TryFrom<u8> for ResponseStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ResponseStatus::InvalidCommand),
            0x02 => Ok(ResponseStatus::InvalidLength),
            0x03 => Ok(ResponseStatus::CrcError),
            0x04 => Ok(ResponseStatus::InvalidVersion),
            0x05 => Ok(ResponseStatus::InvalidSettings),
            _ => Err(value),
        }
    }
}

/// Link role as encoded in the settings block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Master = 0,
    Slave = 1,
}

/// Settings block as exchanged with GetSettings / SetSettings.
///
/// Layout: [role][board][freq u32 LE][power i8][sf][bw index][cr denominator][interval u32 LE]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub role: u8,
    pub board: u8,
    pub frequency_hz: u32,
    pub tx_power_dbm: i8,
    pub spreading_factor: u8,
    pub bandwidth_index: u8,
    pub coding_rate: u8,
    pub tx_interval_ms: u32,
}

impl Settings {
    pub fn to_bytes(&self) -> [u8; SETTINGS_LEN] {
        let mut out = [0u8; SETTINGS_LEN];
        out[0] = self.role;
        out[1] = self.board;
        out[2..6].copy_from_slice(&self.frequency_hz.to_le_bytes());
        out[6] = self.tx_power_dbm as u8;
        out[7] = self.spreading_factor;
        out[8] = self.bandwidth_index;
        out[9] = self.coding_rate;
        out[10..14].copy_from_slice(&self.tx_interval_ms.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() != SETTINGS_LEN {
            anyhow::bail!("Settings block is {} bytes, expected {}", data.len(), SETTINGS_LEN);
        }

        Ok(Self {
            role: data[0],
            board: data[1],
            frequency_hz: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            tx_power_dbm: data[6] as i8,
            spreading_factor: data[7],
            bandwidth_index: data[8],
            coding_rate: data[9],
            tx_interval_ms: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
        })
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role as u8;
        self
    }
}

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Build a command frame (without COBS encoding).
/// Format: [version: u8][cmd_id: u8][length: u16 LE][payload][crc16: u16 LE]
pub fn build_command_payload(cmd_id: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u16;
    let mut data = Vec::with_capacity(6 + payload.len());

    data.push(PROTOCOL_VERSION);
    data.push(cmd_id);
    data.extend_from_slice(&length.to_le_bytes());
    data.extend_from_slice(payload);

    let checksum = CRC.checksum(&data);
    data.extend_from_slice(&checksum.to_le_bytes());

    data
}

/// COBS encode (corncobs includes zero delimiter).
pub fn cobs_encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = vec![0u8; corncobs::max_encoded_len(data.len())];
    let len = corncobs::encode_buf(data, &mut encoded);
    encoded.truncate(len);
    encoded
}

/// Build a complete COBS-encoded command frame.
pub fn build_command(cmd_id: CommandId, payload: &[u8]) -> Vec<u8> {
    let raw = build_command_payload(cmd_id as u8, payload);
    cobs_encode(&raw)
}

/// Response IDs matching the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseId {
    Version = 0x01,
    Settings = 0x02,
    Ack = 0x20,
    Error = 0xFF,
}

impl TryFrom<u8> for ResponseId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(ResponseId::Version),
            0x02 => Ok(ResponseId::Settings),
            0x20 => Ok(ResponseId::Ack),
            0xFF => Ok(ResponseId::Error),
            _ => Err(value),
        }
    }
}

/// Parsed response from the device.
#[derive(Debug)]
pub struct Response {
    pub version: u8,
    pub resp_id: ResponseId,
    pub payload: Vec<u8>,
}

impl Response {
    /// Status byte of an Error response
    pub fn error_status(&self) -> Option<u8> {
        match self.resp_id {
            ResponseId::Error => self.payload.first().copied(),
            _ => None,
        }
    }
}

/// Parse a COBS-decoded response.
/// Format: [version: u8][resp_id: u8][length: u16 LE][payload][crc: u16 LE]
pub fn parse_response(data: &[u8]) -> anyhow::Result<Response> {
    if data.len() < 6 {
        anyhow::bail!("Response too short: {} bytes", data.len());
    }

    let version = data[0];
    let resp_id_byte = data[1];
    let length = u16::from_le_bytes([data[2], data[3]]) as usize;

    if data.len() < 4 + length + 2 {
        anyhow::bail!(
            "Response payload incomplete: expected {}, got {}",
            4 + length + 2,
            data.len()
        );
    }

    let payload = data[4..4 + length].to_vec();
    let received_crc = u16::from_le_bytes([data[4 + length], data[4 + length + 1]]);

    let calculated_crc = CRC.checksum(&data[..4 + length]);
    if calculated_crc != received_crc {
        anyhow::bail!(
            "CRC mismatch: expected {:04x}, got {:04x}",
            calculated_crc,
            received_crc
        );
    }

    if version != PROTOCOL_VERSION {
        anyhow::bail!(
            "Protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION,
            version
        );
    }

    let resp_id = ResponseId::try_from(resp_id_byte)
        .map_err(|v| anyhow::anyhow!("Unknown response ID: {:#04x}", v))?;

    Ok(Response {
        version,
        resp_id,
        payload,
    })
}

/// COBS decode a delimiter-terminated frame.
pub fn cobs_decode(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoded = vec![0u8; data.len()];
    let len = corncobs::decode_buf(data, &mut decoded)
        .map_err(|e| anyhow::anyhow!("COBS decode error: {:?}", e))?;
    decoded.truncate(len);
    Ok(decoded)
}
