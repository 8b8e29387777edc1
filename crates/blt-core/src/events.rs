//! Event system for UI decoupling.
//!
//! Front ends subscribe to session progress through [`BltObserver`] instead
//! of parsing log output.

use std::fmt;

use crate::state::SessionState;

/// Target operation a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Erase,
    Program,
    Read,
    Verify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Erase => write!(f, "Erase"),
            Operation::Program => write!(f, "Program"),
            Operation::Read => write!(f, "Read"),
            Operation::Verify => write!(f, "Verify"),
        }
    }
}

/// Events emitted by a session.
#[derive(Debug, Clone)]
pub enum BltEvent {
    /// Session state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Progress of a multi-step operation, in bytes.
    Progress {
        operation: Operation,
        current: u64,
        total: u64,
    },
    /// Packet exchanged with the target.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Vec<u8>,
    },
    /// An operation failed and the session gave up on it.
    Error { message: String },
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> target
    Rx, // Target -> host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Packet bytes kept in [`BltEvent::Packet`].
pub const PACKET_PREVIEW_LEN: usize = 32;

/// Observer trait for receiving session events.
pub trait BltObserver: Send + Sync {
    fn on_event(&self, event: &BltEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BltObserver for NullObserver {
    fn on_event(&self, _event: &BltEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BltObserver for TracingObserver {
    fn on_event(&self, event: &BltEvent) {
        match event {
            BltEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Session state changed");
            }
            BltEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            BltEvent::Packet {
                direction,
                length,
                data,
            } => {
                tracing::trace!(dir = %direction, len = length, data = ?data, "Packet");
            }
            BltEvent::Error { message } => {
                tracing::error!("{}", message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PacketDirection::Tx.to_string(), "TX");
        assert_eq!(Operation::Verify.to_string(), "Verify");
    }

    #[test]
    fn test_observers_accept_all_events() {
        let events = [
            BltEvent::StateChanged {
                from: SessionState::Initialized,
                to: SessionState::Connected,
            },
            BltEvent::Progress {
                operation: Operation::Program,
                current: 0,
                total: 0,
            },
            BltEvent::Packet {
                direction: PacketDirection::Rx,
                length: 1,
                data: vec![0xFF],
            },
            BltEvent::Error {
                message: "boom".into(),
            },
        ];
        for event in &events {
            NullObserver.on_event(event);
            TracingObserver.on_event(event);
        }
    }
}
