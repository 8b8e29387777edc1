// XCP v1.0 command codes (subset used for programming)
pub const CMD_CONNECT: u8 = 0xFF;
pub const CMD_DISCONNECT: u8 = 0xFE;
pub const CMD_SET_MTA: u8 = 0xF6;
pub const CMD_UPLOAD: u8 = 0xF5;
pub const CMD_PROGRAM_START: u8 = 0xD2;
pub const CMD_PROGRAM_CLEAR: u8 = 0xD1;
pub const CMD_PROGRAM: u8 = 0xD0;
pub const CMD_PROGRAM_RESET: u8 = 0xCF;

// Packet identifiers of responses
pub const PID_RES: u8 = 0xFF;
pub const PID_ERR: u8 = 0xFE;

// Error codes
pub const ERR_CMD_SYNCH: u8 = 0x00;
pub const ERR_CMD_BUSY: u8 = 0x10;
pub const ERR_DAQ_ACTIVE: u8 = 0x11;
pub const ERR_PGM_ACTIVE: u8 = 0x12;
pub const ERR_CMD_UNKNOWN: u8 = 0x20;
pub const ERR_CMD_SYNTAX: u8 = 0x21;
pub const ERR_OUT_OF_RANGE: u8 = 0x22;
pub const ERR_WRITE_PROTECTED: u8 = 0x23;
pub const ERR_ACCESS_DENIED: u8 = 0x24;
pub const ERR_ACCESS_LOCKED: u8 = 0x25;
pub const ERR_PAGE_NOT_VALID: u8 = 0x26;
pub const ERR_MODE_NOT_VALID: u8 = 0x27;
pub const ERR_SEGMENT_NOT_VALID: u8 = 0x28;
pub const ERR_SEQUENCE: u8 = 0x29;
pub const ERR_DAQ_CONFIG: u8 = 0x2A;
pub const ERR_MEMORY_OVERFLOW: u8 = 0x30;
pub const ERR_GENERIC: u8 = 0x31;
pub const ERR_VERIFY: u8 = 0x32;

// CONNECT response bits
pub const RESOURCE_CAL_PAG: u8 = 0x01;
pub const RESOURCE_DAQ: u8 = 0x04;
pub const RESOURCE_STIM: u8 = 0x08;
pub const RESOURCE_PGM: u8 = 0x10;
/// COMM_MODE_BASIC bit 0: multi-byte fields are big endian (Motorola).
pub const COMM_MODE_BYTE_ORDER: u8 = 0x01;

// Packet lengths
pub const CONNECT_RESPONSE_LEN: usize = 8;
pub const PROGRAM_START_RESPONSE_LEN: usize = 7;
/// Smallest MAX_CTO the protocol allows.
pub const MIN_CTO: usize = 8;

// Default timing, in milliseconds
pub const DEFAULT_TIMEOUT_T1_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_T3_MS: u64 = 2000;
pub const DEFAULT_TIMEOUT_T4_MS: u64 = 10000;
pub const DEFAULT_TIMEOUT_T5_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_T6_MS: u64 = 50;
pub const DEFAULT_TIMEOUT_T7_MS: u64 = 2000;

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 20;

/// Symbolic name of an XCP error code.
pub fn error_name(code: u8) -> &'static str {
    match code {
        ERR_CMD_SYNCH => "ERR_CMD_SYNCH",
        ERR_CMD_BUSY => "ERR_CMD_BUSY",
        ERR_DAQ_ACTIVE => "ERR_DAQ_ACTIVE",
        ERR_PGM_ACTIVE => "ERR_PGM_ACTIVE",
        ERR_CMD_UNKNOWN => "ERR_CMD_UNKNOWN",
        ERR_CMD_SYNTAX => "ERR_CMD_SYNTAX",
        ERR_OUT_OF_RANGE => "ERR_OUT_OF_RANGE",
        ERR_WRITE_PROTECTED => "ERR_WRITE_PROTECTED",
        ERR_ACCESS_DENIED => "ERR_ACCESS_DENIED",
        ERR_ACCESS_LOCKED => "ERR_ACCESS_LOCKED",
        ERR_PAGE_NOT_VALID => "ERR_PAGE_NOT_VALID",
        ERR_MODE_NOT_VALID => "ERR_MODE_NOT_VALID",
        ERR_SEGMENT_NOT_VALID => "ERR_SEGMENT_NOT_VALID",
        ERR_SEQUENCE => "ERR_SEQUENCE",
        ERR_DAQ_CONFIG => "ERR_DAQ_CONFIG",
        ERR_MEMORY_OVERFLOW => "ERR_MEMORY_OVERFLOW",
        ERR_GENERIC => "ERR_GENERIC",
        ERR_VERIFY => "ERR_VERIFY",
        _ => "ERR_UNKNOWN",
    }
}

/// Symbolic name of a command code.
pub fn command_name(code: u8) -> &'static str {
    match code {
        CMD_CONNECT => "CONNECT",
        CMD_DISCONNECT => "DISCONNECT",
        CMD_SET_MTA => "SET_MTA",
        CMD_UPLOAD => "UPLOAD",
        CMD_PROGRAM_START => "PROGRAM_START",
        CMD_PROGRAM_CLEAR => "PROGRAM_CLEAR",
        CMD_PROGRAM => "PROGRAM",
        CMD_PROGRAM_RESET => "PROGRAM_RESET",
        _ => "UNKNOWN",
    }
}
