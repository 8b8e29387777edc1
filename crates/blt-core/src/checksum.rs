//! CRC utilities.
//!
//! Two canonical definitions are provided, both table driven with the tables
//! built at compile time:
//!
//! | Width | Name              | Poly         | Init         | Reflect in/out | XorOut       | Check (`"123456789"`) |
//! |-------|-------------------|--------------|--------------|----------------|--------------|-----------------------|
//! | 16    | CRC-16/CCITT-FALSE| `0x1021`     | `0xFFFF`     | no / no        | `0x0000`     | `0x29B1`              |
//! | 32    | CRC-32/ISO-HDLC   | `0x04C11DB7` | `0xFFFFFFFF` | yes / yes      | `0xFFFFFFFF` | `0xCBF43926`          |

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("Checksum requested over an empty byte sequence")]
    EmptyInput,
}

/// Streaming CRC-16/CCITT-FALSE digest.
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Crc16 {
    pub const POLYNOMIAL: u16 = 0x1021;
    pub const INIT: u16 = 0xFFFF;

    const TABLE: [u16; 256] = {
        let mut table = [0u16; 256];
        let mut pos = 0;
        while pos < 256 {
            let mut crc = (pos as u16) << 8;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ Self::POLYNOMIAL
                } else {
                    crc << 1
                };
                bit += 1;
            }
            table[pos] = crc;
            pos += 1;
        }
        table
    };

    pub fn new() -> Self {
        Self(Self::INIT)
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let idx = ((self.0 >> 8) as u8 ^ byte) as usize;
            self.0 = (self.0 << 8) ^ Self::TABLE[idx];
        }
    }

    pub fn finalize(&self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming CRC-32/ISO-HDLC digest (the zlib / Ethernet CRC).
#[derive(Debug, Clone, Copy)]
pub struct Crc32(u32);

impl Crc32 {
    /// Reflected form of `0x04C11DB7`.
    pub const POLYNOMIAL_REFLECTED: u32 = 0xEDB8_8320;
    pub const INIT: u32 = 0xFFFF_FFFF;
    pub const XOR_OUT: u32 = 0xFFFF_FFFF;

    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut pos = 0;
        while pos < 256 {
            let mut crc = pos as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ Self::POLYNOMIAL_REFLECTED
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[pos] = crc;
            pos += 1;
        }
        table
    };

    pub fn new() -> Self {
        Self(Self::INIT)
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let idx = (self.0 as u8 ^ byte) as usize;
            self.0 = (self.0 >> 8) ^ Self::TABLE[idx];
        }
    }

    pub fn finalize(&self) -> u32 {
        self.0 ^ Self::XOR_OUT
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16/CCITT-FALSE over `data`.
pub fn crc16_calculate(data: &[u8]) -> Result<u16, ChecksumError> {
    if data.is_empty() {
        return Err(ChecksumError::EmptyInput);
    }
    let mut crc = Crc16::new();
    crc.update(data);
    Ok(crc.finalize())
}

/// CRC-32/ISO-HDLC over `data`.
pub fn crc32_calculate(data: &[u8]) -> Result<u32, ChecksumError> {
    if data.is_empty() {
        return Err(ChecksumError::EmptyInput);
    }
    let mut crc = Crc32::new();
    crc.update(data);
    Ok(crc.finalize())
}
