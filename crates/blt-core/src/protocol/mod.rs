//! Protocol layer: the communication protocol spoken with the bootloader.
//!
//! A [`ProtocolBackend`] owns exactly one transport and implements the
//! target operations on top of its request/response exchanges.

pub mod xcp;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{Transport, TransportError, TransportKind};

pub use xcp::{XcpBackend, XcpSettings};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{command}: no valid response after {attempts} attempt(s)")]
    Timeout { command: &'static str, attempts: u32 },

    #[error("{command} rejected by target: {reason}")]
    Rejected {
        command: &'static str,
        code: u8,
        reason: String,
    },

    #[error("{command}: malformed response: {reason}")]
    Malformed { command: &'static str, reason: String },

    #[error("Target not usable: {0}")]
    Unsupported(String),

    #[error("Not connected to target")]
    NotConnected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// Whether the target never gave a usable answer.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProtocolError::Timeout { .. } => true,
            ProtocolError::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Communication protocol identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// XCP version 1.0.
    #[default]
    XcpV10,
}

impl SessionKind {
    /// Transport kinds this protocol can run on.
    pub fn supported_transports(self) -> &'static [TransportKind] {
        match self {
            SessionKind::XcpV10 => &[
                TransportKind::XcpV10Rs232,
                TransportKind::XcpV10Can,
                TransportKind::XcpV10Usb,
            ],
        }
    }

    pub fn supports(self, transport: TransportKind) -> bool {
        self.supported_transports().contains(&transport)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::XcpV10 => write!(f, "XCP v1.0"),
        }
    }
}

/// Per-protocol settings, one variant per [`SessionKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionSettings {
    XcpV10(XcpSettings),
}

impl SessionSettings {
    pub fn kind(&self) -> SessionKind {
        match self {
            SessionSettings::XcpV10(_) => SessionKind::XcpV10,
        }
    }
}

/// Target operations of a bootloader protocol.
///
/// Addresses are in the target's address space. `erase`, `program` and
/// `upload` require a prior successful `connect`.
pub trait ProtocolBackend: Send {
    fn kind(&self) -> SessionKind;

    /// Kind of the owned transport.
    fn transport_kind(&self) -> TransportKind;

    /// Open the owned transport.
    fn open_channel(&mut self) -> Result<(), TransportError>;

    /// Close the owned transport and forget any link state.
    fn close_channel(&mut self);

    /// Establish the logical connection with the target.
    fn connect(&mut self) -> Result<(), ProtocolError>;

    /// End the logical connection. Link state is dropped even on error.
    fn disconnect(&mut self) -> Result<(), ProtocolError>;

    fn is_connected(&self) -> bool;

    /// Erase at least `[address, address + len)`.
    fn erase(&mut self, address: u32, len: u32) -> Result<(), ProtocolError>;

    /// Program `data` at `address`, split into packets as needed.
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), ProtocolError>;

    /// Fill `buf` with target memory starting at `address`.
    fn upload(&mut self, address: u32, buf: &mut [u8]) -> Result<(), ProtocolError>;

    /// Data bytes carried by one program packet; 0 when not connected.
    fn max_program_chunk(&self) -> usize;

    /// Data bytes carried by one upload response; 0 when not connected.
    fn max_upload_chunk(&self) -> usize;
}

/// Construct the backend for `kind` around `transport`.
pub(crate) fn build(
    settings: SessionSettings,
    transport: Box<dyn Transport>,
) -> Box<dyn ProtocolBackend> {
    match settings {
        SessionSettings::XcpV10(s) => Box::new(XcpBackend::new(s, transport)),
    }
}

/// Validate a `[address, address + len)` range against the 32-bit space.
pub(crate) fn check_range(address: u32, len: usize) -> Result<(), ProtocolError> {
    if len == 0 {
        return Err(ProtocolError::InvalidArgument("length must be non-zero"));
    }
    if address as u64 + len as u64 > 1u64 << 32 {
        return Err(ProtocolError::InvalidArgument(
            "range exceeds the 32-bit address space",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xcp_transports() {
        let kind = SessionKind::XcpV10;
        assert!(kind.supports(TransportKind::XcpV10Rs232));
        assert!(kind.supports(TransportKind::XcpV10Can));
        assert!(kind.supports(TransportKind::XcpV10Usb));
        assert!(!kind.supports(TransportKind::Loopback));
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 1).is_ok());
        assert!(check_range(0xFFFF_FFFF, 1).is_ok());
        assert!(check_range(0xFFFF_FFFF, 2).is_err());
        assert!(check_range(0x1000, 0).is_err());
    }

    #[test]
    fn test_settings_kind() {
        let settings = SessionSettings::XcpV10(XcpSettings::default());
        assert_eq!(settings.kind(), SessionKind::XcpV10);
    }
}
