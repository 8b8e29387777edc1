//! XCP command encoding and response decoding.
//!
//! Multi-byte fields follow the byte order the target announces in its
//! CONNECT response.

use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::constants::*;

/// Byte order of multi-byte packet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Little endian.
    #[default]
    Intel,
    /// Big endian.
    Motorola,
}

impl Endianness {
    pub fn from_comm_mode(comm_mode_basic: u8) -> Self {
        if comm_mode_basic & COMM_MODE_BYTE_ORDER != 0 {
            Endianness::Motorola
        } else {
            Endianness::Intel
        }
    }

    pub fn write_u32(self, buf: &mut [u8], value: u32) {
        match self {
            Endianness::Intel => LittleEndian::write_u32(buf, value),
            Endianness::Motorola => BigEndian::write_u32(buf, value),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endianness::Intel => LittleEndian::read_u32(buf),
            Endianness::Motorola => BigEndian::read_u32(buf),
        }
    }

    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endianness::Intel => LittleEndian::read_u16(buf),
            Endianness::Motorola => BigEndian::read_u16(buf),
        }
    }
}

/// Error code carried by an `ERR` response.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    pub fn is_busy(self) -> bool {
        self.0 == ERR_CMD_BUSY
    }

    pub fn name(self) -> &'static str {
        error_name(self.0)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({:#04X} {})", self.0, self.name())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04X})", self.name(), self.0)
    }
}

/// Decoded response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `RES` packet; holds the bytes after the PID.
    Positive(Vec<u8>),
    /// `ERR` packet.
    Error(ErrorCode),
}

/// Classify a raw response packet. A packet that is neither `RES` nor a
/// complete `ERR` is reported as a reason string.
pub fn parse_response(packet: &[u8]) -> Result<Response, String> {
    match packet {
        [] => Err("empty response".into()),
        [PID_RES, rest @ ..] => Ok(Response::Positive(rest.to_vec())),
        [PID_ERR, code, ..] => Ok(Response::Error(ErrorCode(*code))),
        [PID_ERR] => Err("error packet without error code".into()),
        [pid, ..] => Err(format!("unexpected packet identifier {pid:#04X}")),
    }
}

/// Target properties from the CONNECT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub resource: u8,
    pub comm_mode_basic: u8,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_version: u8,
    pub transport_version: u8,
}

impl ConnectInfo {
    /// Parse the payload of a positive CONNECT response (PID stripped).
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        if payload.len() < CONNECT_RESPONSE_LEN - 1 {
            return Err(format!(
                "CONNECT response has {} bytes, expected {}",
                payload.len() + 1,
                CONNECT_RESPONSE_LEN
            ));
        }
        let comm_mode_basic = payload[1];
        let order = Endianness::from_comm_mode(comm_mode_basic);
        Ok(Self {
            resource: payload[0],
            comm_mode_basic,
            max_cto: payload[2],
            max_dto: order.read_u16(&payload[3..5]),
            protocol_version: payload[5],
            transport_version: payload[6],
        })
    }

    pub fn byte_order(&self) -> Endianness {
        Endianness::from_comm_mode(self.comm_mode_basic)
    }

    pub fn supports_programming(&self) -> bool {
        self.resource & RESOURCE_PGM != 0
    }
}

/// Programming properties from the PROGRAM_START response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStartInfo {
    pub comm_mode_pgm: u8,
    pub max_cto_pgm: u8,
    pub max_bs_pgm: u8,
    pub min_st_pgm: u8,
    pub queue_size_pgm: u8,
}

impl ProgramStartInfo {
    /// Parse the payload of a positive PROGRAM_START response (PID stripped).
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        if payload.len() < PROGRAM_START_RESPONSE_LEN - 1 {
            return Err(format!(
                "PROGRAM_START response has {} bytes, expected {}",
                payload.len() + 1,
                PROGRAM_START_RESPONSE_LEN
            ));
        }
        Ok(Self {
            comm_mode_pgm: payload[1],
            max_cto_pgm: payload[2],
            max_bs_pgm: payload[3],
            min_st_pgm: payload[4],
            queue_size_pgm: payload[5],
        })
    }
}

pub fn connect(mode: u8) -> Vec<u8> {
    vec![CMD_CONNECT, mode]
}

pub fn disconnect() -> Vec<u8> {
    vec![CMD_DISCONNECT]
}

pub fn program_start() -> Vec<u8> {
    vec![CMD_PROGRAM_START]
}

pub fn program_reset() -> Vec<u8> {
    vec![CMD_PROGRAM_RESET]
}

/// `SET_MTA`: reserved, reserved, address extension, 32-bit address.
pub fn set_mta(address: u32, order: Endianness) -> Vec<u8> {
    let mut packet = vec![CMD_SET_MTA, 0, 0, 0, 0, 0, 0, 0];
    order.write_u32(&mut packet[4..8], address);
    packet
}

/// `PROGRAM_CLEAR` in absolute access mode for `len` bytes from the MTA.
pub fn program_clear(len: u32, order: Endianness) -> Vec<u8> {
    let mut packet = vec![CMD_PROGRAM_CLEAR, 0, 0, 0, 0, 0, 0, 0];
    order.write_u32(&mut packet[4..8], len);
    packet
}

/// `PROGRAM` with at most 255 data bytes. An empty `data` marks the end of
/// the programming sequence.
pub fn program(data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= u8::MAX as usize);
    let mut packet = Vec::with_capacity(data.len() + 2);
    packet.push(CMD_PROGRAM);
    packet.push(data.len() as u8);
    packet.extend_from_slice(data);
    packet
}

pub fn upload(len: u8) -> Vec<u8> {
    vec![CMD_UPLOAD, len]
}
