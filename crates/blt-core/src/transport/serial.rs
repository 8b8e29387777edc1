//! Serial port transport (RS232/UART).
//!
//! Each packet travels as `[len][packet bytes]`, so the largest packet is
//! 255 bytes. The receive side waits for the length byte and then for exactly
//! that many bytes, all within the exchange timeout.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, instrument, warn};

use super::traits::{Transport, TransportError, TransportKind};

pub const SERIAL_MAX_PACKET: usize = 255;

/// Serial link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baudrate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baudrate: 57600,
        }
    }
}

pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::XcpV10Rs232
    }

    #[instrument(level = "info", skip(self), fields(port = %self.settings.port, baud = self.settings.baudrate))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.settings.port, self.settings.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                channel: self.settings.port.clone(),
                message: e.to_string(),
            })?;

        info!("Serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.settings.port, "Serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        if request.is_empty() || request.len() > SERIAL_MAX_PACKET {
            return Err(TransportError::FrameTooLong {
                len: request.len(),
                max: SERIAL_MAX_PACKET,
            });
        }

        // Drop stale bytes from an earlier, timed-out exchange.
        if let Err(e) = port.clear(ClearBuffer::Input) {
            warn!(error = %e, "Failed to flush serial input");
        }

        let mut frame = Vec::with_capacity(request.len() + 1);
        frame.push(request.len() as u8);
        frame.extend_from_slice(request);
        port.write_all(&frame)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()?;

        let deadline = Instant::now() + timeout;
        let mut len = [0u8; 1];
        read_until(port.as_mut(), &mut len, deadline, timeout)?;
        let mut packet = vec![0u8; len[0] as usize];
        read_until(port.as_mut(), &mut packet, deadline, timeout)?;

        debug!(tx = request.len(), rx = packet.len(), "Serial exchange complete");
        Ok(packet)
    }

    fn max_packet_len(&self) -> usize {
        SERIAL_MAX_PACKET
    }
}

/// Fill `buf` completely before `deadline`.
fn read_until(
    port: &mut dyn SerialPort,
    buf: &mut [u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::timeout(timeout));
        }
        port.set_timeout(remaining)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        match port.read(&mut buf[filled..]) {
            Ok(0) => {}
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(TransportError::timeout(timeout));
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_port_rejects_exchange() {
        let mut serial = SerialTransport::new(SerialSettings {
            port: "/dev/blt-missing".into(),
            ..Default::default()
        });
        assert!(!serial.is_open());
        assert!(matches!(
            serial.transact(&[0xFF, 0x00], Duration::from_millis(5)),
            Err(TransportError::NotOpen)
        ));
        serial.close();
    }

    #[test]
    fn test_open_missing_port_fails() {
        let mut serial = SerialTransport::new(SerialSettings {
            port: "/dev/blt-port-that-does-not-exist".into(),
            baudrate: 115200,
        });
        assert!(matches!(
            serial.open(),
            Err(TransportError::OpenFailed { .. })
        ));
        assert!(!serial.is_open());
    }

    #[test]
    fn test_default_settings() {
        let settings = SerialSettings::default();
        assert_eq!(settings.baudrate, 57600);
        assert!(settings.port.is_empty());
    }
}
