//! BLT-Core: host side of a bootloader firmware update.
//!
//! This crate connects to the bootloader of an embedded target over a
//! swappable channel, erases and programs its memory, and keeps firmware
//! images as sorted, non-overlapping address ranges.
//!
//! # Architecture
//!
//! - **Transport**: packet channels (serial, CAN, USB, loopback, mock)
//! - **Protocol**: bootloader protocol backends (XCP v1.0) with retries
//! - **State / Session**: connection state machine and orchestrator
//! - **Events**: Observer pattern for UI decoupling
//! - **Firmware**: segment store and S-record parser
//! - **Checksum**: CRC-16 and CRC-32
//!
//! # Example
//!
//! ```no_run
//! use blt_core::firmware::{Firmware, ParserKind};
//! use blt_core::session::{BltSession, SessionConfig};
//!
//! let config = SessionConfig::load_from_file("blt.toml").expect("config");
//! let mut firmware = Firmware::new(ParserKind::SRecord);
//! firmware.load_from_file("app.srec").expect("firmware");
//!
//! let mut session = BltSession::new();
//! session.init_from_config(&config).expect("init");
//! session.start().expect("connect");
//! session.program_image(firmware.store()).expect("program");
//! session.terminate();
//! ```

pub mod checksum;
pub mod events;
pub mod firmware;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod version;

// Re-exports for convenience
pub use checksum::{ChecksumError, crc16_calculate, crc32_calculate};
pub use events::{BltEvent, BltObserver, NullObserver, TracingObserver};
pub use firmware::{Firmware, FirmwareError, ParserKind, Segment, SegmentStore};
pub use protocol::{ProtocolError, SessionKind, SessionSettings, XcpSettings};
pub use session::{BltSession, SessionConfig, SessionError};
pub use state::SessionState;
pub use transport::{
    MockTransport, Transport, TransportError, TransportKind, TransportSettings,
};
