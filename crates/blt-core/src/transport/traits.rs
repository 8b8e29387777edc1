//! Transport layer abstraction.
//!
//! Defines the `Transport` trait for request/response packet exchange,
//! allowing different channels (serial, CAN, USB, mock, etc.).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open {channel}: {message}")]
    OpenFailed { channel: String, message: String },

    #[error("Transport is not open")]
    NotOpen,

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Communication channel identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// XCP on a point-to-point serial link.
    XcpV10Rs232,
    /// XCP on CAN.
    XcpV10Can,
    /// XCP on USB bulk endpoints.
    XcpV10Usb,
    /// In-process channel that echoes each request.
    Loopback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::XcpV10Rs232 => write!(f, "XCP v1.0 on RS232"),
            TransportKind::XcpV10Can => write!(f, "XCP v1.0 on CAN"),
            TransportKind::XcpV10Usb => write!(f, "XCP v1.0 on USB"),
            TransportKind::Loopback => write!(f, "loopback"),
        }
    }
}

/// Abstract packet transport.
///
/// One `transact` call sends one request packet and blocks until one response
/// packet arrives or the timeout elapses. Framing is private to each channel.
pub trait Transport: Send {
    /// Channel identifier, checked against the protocol at session init.
    fn kind(&self) -> TransportKind;

    /// Acquire the underlying link.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Release the link. Safe to call when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Send `request` and wait up to `timeout` for the response packet.
    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Largest packet, in bytes, the channel can carry in either direction.
    fn max_packet_len(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).transact(request, timeout)
    }

    fn max_packet_len(&self) -> usize {
        (**self).max_packet_len()
    }
}
