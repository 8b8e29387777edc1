//! CAN transport.
//!
//! Each packet is one classic CAN frame (up to 8 data bytes). Requests go out
//! on `transmit_id`, responses are taken from `receive_id`; all other traffic
//! on the bus is skipped. The bus itself is reached through a [`CanDriver`],
//! so adapters other than SocketCAN can be plugged in.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace};

use super::traits::{Transport, TransportError, TransportKind};

pub const CAN_MAX_PACKET: usize = 8;

/// CAN link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanSettings {
    /// Interface name, e.g. `can0`.
    pub device: String,
    /// Channel index for adapters with several channels.
    pub channel: u32,
    /// Bus bitrate in bit/s. SocketCAN interfaces are configured by the OS,
    /// so there it only documents the expected rate.
    pub baudrate: u32,
    /// Identifier of host to target frames.
    pub transmit_id: u32,
    /// Identifier of target to host frames.
    pub receive_id: u32,
    /// Use 29-bit identifiers.
    pub use_extended: bool,
}

impl Default for CanSettings {
    fn default() -> Self {
        Self {
            device: "can0".into(),
            channel: 0,
            baudrate: 500_000,
            transmit_id: 0x667,
            receive_id: 0x7E1,
            use_extended: false,
        }
    }
}

/// One classic CAN data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanMessage {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl fmt::Display for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}#", self.id)?;
        } else {
            write!(f, "{:03X}#", self.id)?;
        }
        for b in &self.data {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Access to a CAN bus adapter.
pub trait CanDriver: Send {
    fn open(&mut self, settings: &CanSettings) -> Result<(), TransportError>;

    fn close(&mut self);

    fn send(&mut self, message: &CanMessage) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next frame. `Ok(None)` on timeout.
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanMessage>, TransportError>;
}

pub struct CanTransport {
    settings: CanSettings,
    driver: Box<dyn CanDriver>,
    open: bool,
}

impl CanTransport {
    /// CAN transport on the platform's default adapter driver.
    pub fn new(settings: CanSettings) -> Self {
        Self::with_driver(settings, default_driver())
    }

    pub fn with_driver(settings: CanSettings, driver: Box<dyn CanDriver>) -> Self {
        Self {
            settings,
            driver,
            open: false,
        }
    }

    pub fn settings(&self) -> &CanSettings {
        &self.settings
    }

    fn is_response(&self, message: &CanMessage) -> bool {
        message.id == self.settings.receive_id && message.extended == self.settings.use_extended
    }
}

impl Transport for CanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::XcpV10Can
    }

    #[instrument(level = "info", skip(self), fields(device = %self.settings.device, channel = self.settings.channel))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.open {
            return Ok(());
        }
        self.driver.open(&self.settings)?;
        self.open = true;
        info!(
            tx_id = %format!("0x{:X}", self.settings.transmit_id),
            rx_id = %format!("0x{:X}", self.settings.receive_id),
            bitrate = self.settings.baudrate,
            "CAN channel opened"
        );
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.driver.close();
            self.open = false;
            info!(device = %self.settings.device, "CAN channel closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if request.is_empty() || request.len() > CAN_MAX_PACKET {
            return Err(TransportError::FrameTooLong {
                len: request.len(),
                max: CAN_MAX_PACKET,
            });
        }

        let message = CanMessage {
            id: self.settings.transmit_id,
            extended: self.settings.use_extended,
            data: request.to_vec(),
        };
        self.driver.send(&message)?;
        trace!(frame = %message, "CAN TX");

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(timeout));
            }
            match self.driver.receive(remaining)? {
                Some(frame) if self.is_response(&frame) => {
                    debug!(frame = %frame, "CAN RX");
                    return Ok(frame.data);
                }
                Some(frame) => trace!(frame = %frame, "Skipping unrelated CAN frame"),
                None => return Err(TransportError::timeout(timeout)),
            }
        }
    }

    fn max_packet_len(&self) -> usize {
        CAN_MAX_PACKET
    }
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn default_driver() -> Box<dyn CanDriver> {
    Box::new(socket::SocketCanDriver::default())
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn default_driver() -> Box<dyn CanDriver> {
    Box::new(UnavailableDriver)
}

/// Placeholder used when no CAN adapter support is compiled in.
#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
struct UnavailableDriver;

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
impl CanDriver for UnavailableDriver {
    fn open(&mut self, settings: &CanSettings) -> Result<(), TransportError> {
        Err(TransportError::OpenFailed {
            channel: settings.device.clone(),
            message: "no CAN adapter driver built in (enable the `socketcan` feature on Linux)"
                .into(),
        })
    }

    fn close(&mut self) {}

    fn send(&mut self, _message: &CanMessage) -> Result<(), TransportError> {
        Err(TransportError::NotOpen)
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<CanMessage>, TransportError> {
        Err(TransportError::NotOpen)
    }
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socket {
    //! SocketCAN adapter driver.

    use std::time::Duration;

    use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};

    use super::{CanDriver, CanMessage, CanSettings};
    use crate::transport::TransportError;

    #[derive(Default)]
    pub struct SocketCanDriver {
        socket: Option<CanSocket>,
    }

    impl CanDriver for SocketCanDriver {
        fn open(&mut self, settings: &CanSettings) -> Result<(), TransportError> {
            let socket =
                CanSocket::open(&settings.device).map_err(|e| TransportError::OpenFailed {
                    channel: settings.device.clone(),
                    message: e.to_string(),
                })?;
            self.socket = Some(socket);
            Ok(())
        }

        fn close(&mut self) {
            self.socket = None;
        }

        fn send(&mut self, message: &CanMessage) -> Result<(), TransportError> {
            let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
            let id: Id = if message.extended {
                ExtendedId::new(message.id)
                    .ok_or_else(|| TransportError::WriteFailed(format!("invalid id {:X}", message.id)))?
                    .into()
            } else {
                u16::try_from(message.id)
                    .ok()
                    .and_then(StandardId::new)
                    .ok_or_else(|| TransportError::WriteFailed(format!("invalid id {:X}", message.id)))?
                    .into()
            };
            let frame = <CanFrame as EmbeddedFrame>::new(id, &message.data)
                .ok_or_else(|| TransportError::WriteFailed("payload exceeds 8 bytes".into()))?;
            socket
                .write_frame(&frame)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))
        }

        fn receive(&mut self, timeout: Duration) -> Result<Option<CanMessage>, TransportError> {
            let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
            match socket.read_frame_timeout(timeout) {
                Ok(frame) => {
                    let (id, extended) = match EmbeddedFrame::id(&frame) {
                        Id::Standard(id) => (id.as_raw() as u32, false),
                        Id::Extended(id) => (id.as_raw(), true),
                    };
                    Ok(Some(CanMessage {
                        id,
                        extended,
                        data: EmbeddedFrame::data(&frame).to_vec(),
                    }))
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    Ok(None)
                }
                Err(e) => Err(TransportError::ReadFailed(e.to_string())),
            }
        }
    }
}
