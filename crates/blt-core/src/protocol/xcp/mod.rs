//! XCP v1.0 protocol backend.
//!
//! Implements the programming subset of XCP: CONNECT and PROGRAM_START on
//! connect, SET_MTA plus PROGRAM / PROGRAM_CLEAR / UPLOAD for memory access,
//! and PROGRAM_RESET or DISCONNECT on disconnect.

pub mod constants;
pub mod packet;
pub mod sim;

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use self::constants::*;
use self::packet::{ConnectInfo, Endianness, ProgramStartInfo, Response};
use super::{ProtocolBackend, ProtocolError, SessionKind, check_range};
use crate::transport::{Transport, TransportError, TransportKind};

pub use self::packet::ErrorCode;
pub use self::sim::{SimConfig, SimTarget};

/// XCP timing and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XcpSettings {
    /// Standard command timeout.
    pub timeout_t1_ms: u64,
    /// PROGRAM_START timeout.
    pub timeout_t3_ms: u64,
    /// PROGRAM_CLEAR timeout.
    pub timeout_t4_ms: u64,
    /// PROGRAM timeout.
    pub timeout_t5_ms: u64,
    /// Timeout of one CONNECT attempt.
    pub timeout_t6_ms: u64,
    /// Timeout used after the target reported busy.
    pub timeout_t7_ms: u64,
    /// Mode byte of the CONNECT command.
    pub connect_mode: u8,
    pub connect_attempts: u32,
    /// Attempts per command before giving up.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// End with PROGRAM_RESET instead of DISCONNECT, which starts the
    /// freshly programmed firmware.
    pub reset_on_disconnect: bool,
}

impl Default for XcpSettings {
    fn default() -> Self {
        Self {
            timeout_t1_ms: DEFAULT_TIMEOUT_T1_MS,
            timeout_t3_ms: DEFAULT_TIMEOUT_T3_MS,
            timeout_t4_ms: DEFAULT_TIMEOUT_T4_MS,
            timeout_t5_ms: DEFAULT_TIMEOUT_T5_MS,
            timeout_t6_ms: DEFAULT_TIMEOUT_T6_MS,
            timeout_t7_ms: DEFAULT_TIMEOUT_T7_MS,
            connect_mode: 0,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            reset_on_disconnect: true,
        }
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Parameters negotiated during connect.
#[derive(Debug, Clone, Copy)]
struct Link {
    order: Endianness,
    max_cto: usize,
    max_cto_pgm: usize,
    /// Memory was erased or programmed in this connection.
    programmed: bool,
    /// Target MTA as far as the host knows. `None` after any failed
    /// exchange, forcing a fresh SET_MTA.
    mta: Option<u32>,
}

/// Outcome of one failed attempt.
enum Attempt {
    /// No response or a malformed one.
    Retry(String),
    /// `ERR_CMD_BUSY`.
    Busy,
    /// Not worth repeating.
    Fail(ProtocolError),
}

impl From<ProtocolError> for Attempt {
    fn from(e: ProtocolError) -> Self {
        Attempt::Fail(e)
    }
}

pub struct XcpBackend {
    settings: XcpSettings,
    transport: Box<dyn Transport>,
    link: Option<Link>,
}

impl XcpBackend {
    pub fn new(settings: XcpSettings, transport: Box<dyn Transport>) -> Self {
        Self {
            settings,
            transport,
            link: None,
        }
    }

    pub fn settings(&self) -> &XcpSettings {
        &self.settings
    }

    fn link(&self) -> Result<Link, ProtocolError> {
        self.link.ok_or(ProtocolError::NotConnected)
    }

    fn set_mta(&mut self, mta: Option<u32>) {
        if let Some(link) = self.link.as_mut() {
            link.mta = mta;
        }
    }

    /// One request/response exchange, classified for the retry loop.
    fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, Attempt> {
        let command = command_name(request[0]);
        let response = match self.transport.transact(request, timeout) {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(Attempt::Retry(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                )));
            }
            Err(TransportError::Malformed(reason)) => return Err(Attempt::Retry(reason)),
            Err(e) => return Err(Attempt::Fail(e.into())),
        };
        match packet::parse_response(&response) {
            Ok(Response::Positive(payload)) => Ok(payload),
            Ok(Response::Error(code)) if code.is_busy() => Err(Attempt::Busy),
            Ok(Response::Error(code)) => Err(Attempt::Fail(ProtocolError::Rejected {
                command,
                code: code.0,
                reason: code.to_string(),
            })),
            Err(reason) => Err(Attempt::Retry(reason)),
        }
    }

    /// Run `step` until it succeeds, fails for good, or the attempts run out.
    fn with_retries<T>(
        &mut self,
        command: &'static str,
        timeout: Duration,
        mut step: impl FnMut(&mut Self, Duration) -> Result<T, Attempt>,
    ) -> Result<T, ProtocolError> {
        let attempts = self.settings.max_attempts.max(1);
        let mut wait = timeout;
        for attempt in 1..=attempts {
            let reason = match step(self, wait) {
                Ok(value) => return Ok(value),
                Err(Attempt::Fail(e)) => {
                    self.set_mta(None);
                    return Err(e);
                }
                Err(Attempt::Busy) => {
                    wait = ms(self.settings.timeout_t7_ms);
                    "target busy".to_string()
                }
                Err(Attempt::Retry(reason)) => {
                    wait = timeout;
                    reason
                }
            };
            self.set_mta(None);
            warn!(command, attempt, attempts, reason = %reason, "XCP exchange failed");
            if attempt < attempts {
                thread::sleep(ms(self.settings.retry_backoff_ms));
            }
        }
        Err(ProtocolError::Timeout { command, attempts })
    }

    /// Point the target MTA at `address` unless it is known to be there.
    fn ensure_mta(&mut self, address: u32) -> Result<(), Attempt> {
        let link = self.link()?;
        if link.mta == Some(address) {
            return Ok(());
        }
        self.exchange(
            &packet::set_mta(address, link.order),
            ms(self.settings.timeout_t1_ms),
        )?;
        self.set_mta(Some(address));
        Ok(())
    }

    fn negotiate(&mut self, info: ConnectInfo) -> Result<Link, ProtocolError> {
        if !info.supports_programming() {
            return Err(ProtocolError::Unsupported(
                "target does not offer the programming resource".into(),
            ));
        }
        let transport_max = self.transport.max_packet_len();
        let max_cto = (info.max_cto as usize).min(transport_max);
        if max_cto < MIN_CTO {
            return Err(ProtocolError::Malformed {
                command: "CONNECT",
                reason: format!("MAX_CTO of {max_cto} bytes is below {MIN_CTO}"),
            });
        }
        Ok(Link {
            order: info.byte_order(),
            max_cto,
            max_cto_pgm: max_cto,
            programmed: false,
            mta: None,
        })
    }

    fn start_programming(&mut self) -> Result<(), ProtocolError> {
        let payload = self.with_retries("PROGRAM_START", ms(self.settings.timeout_t3_ms), |b, wait| {
            b.exchange(&packet::program_start(), wait)
        })?;
        let pgm = ProgramStartInfo::parse(&payload).map_err(|reason| ProtocolError::Malformed {
            command: "PROGRAM_START",
            reason,
        })?;
        if pgm.max_cto_pgm != 0 {
            let max_cto_pgm = (pgm.max_cto_pgm as usize).min(self.transport.max_packet_len());
            if max_cto_pgm < MIN_CTO {
                return Err(ProtocolError::Malformed {
                    command: "PROGRAM_START",
                    reason: format!("MAX_CTO_PGM of {max_cto_pgm} bytes is below {MIN_CTO}"),
                });
            }
            if let Some(link) = self.link.as_mut() {
                link.max_cto_pgm = max_cto_pgm;
            }
        }
        Ok(())
    }

    fn finish_programming(&mut self, link: Link) -> Result<(), ProtocolError> {
        if link.programmed {
            self.with_retries("PROGRAM", ms(self.settings.timeout_t5_ms), |b, wait| {
                b.exchange(&packet::program(&[]), wait)
            })?;
        }
        // The target may restart before answering.
        match self.exchange(&packet::program_reset(), ms(self.settings.timeout_t5_ms)) {
            Ok(_) | Err(Attempt::Retry(_)) | Err(Attempt::Busy) => Ok(()),
            Err(Attempt::Fail(e)) => Err(e),
        }
    }
}

impl ProtocolBackend for XcpBackend {
    fn kind(&self) -> SessionKind {
        SessionKind::XcpV10
    }

    fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    fn open_channel(&mut self) -> Result<(), TransportError> {
        self.transport.open()
    }

    fn close_channel(&mut self) {
        self.link = None;
        self.transport.close();
    }

    #[instrument(level = "info", skip(self), fields(transport = %self.transport.kind()))]
    fn connect(&mut self) -> Result<(), ProtocolError> {
        self.link = None;
        let attempts = self.settings.connect_attempts.max(1);
        let request = packet::connect(self.settings.connect_mode);
        let timeout = ms(self.settings.timeout_t6_ms);

        let mut info = None;
        for attempt in 1..=attempts {
            match self.exchange(&request, timeout) {
                Ok(payload) => match ConnectInfo::parse(&payload) {
                    Ok(parsed) => {
                        info = Some(parsed);
                        break;
                    }
                    Err(reason) => debug!(attempt, reason = %reason, "Malformed CONNECT response"),
                },
                Err(Attempt::Fail(e)) => return Err(e),
                Err(Attempt::Busy) => debug!(attempt, "Target busy"),
                Err(Attempt::Retry(reason)) => debug!(attempt, reason = %reason, "No CONNECT response"),
            }
            if attempt < attempts {
                thread::sleep(ms(self.settings.retry_backoff_ms));
            }
        }
        let info = info.ok_or(ProtocolError::Timeout {
            command: "CONNECT",
            attempts,
        })?;

        self.link = Some(self.negotiate(info)?);
        if let Err(e) = self.start_programming() {
            self.link = None;
            return Err(e);
        }

        let link = self.link()?;
        info!(
            max_cto = link.max_cto,
            max_cto_pgm = link.max_cto_pgm,
            byte_order = ?link.order,
            "Connected to target"
        );
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let Some(link) = self.link else {
            return Ok(());
        };
        let result = if self.settings.reset_on_disconnect {
            self.finish_programming(link)
        } else {
            self.with_retries("DISCONNECT", ms(self.settings.timeout_t1_ms), |b, wait| {
                b.exchange(&packet::disconnect(), wait)
            })
            .map(|_| ())
        };
        self.link = None;
        result
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<(), ProtocolError> {
        check_range(address, len as usize)?;
        let link = self.link()?;
        if let Some(link) = self.link.as_mut() {
            link.programmed = true;
        }
        debug!(address = %format!("{address:#010X}"), len, "Erasing");
        self.with_retries("PROGRAM_CLEAR", ms(self.settings.timeout_t4_ms), |b, wait| {
            b.ensure_mta(address)?;
            b.exchange(&packet::program_clear(len, link.order), wait)?;
            Ok(())
        })?;
        self.set_mta(None);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        check_range(address, data.len())?;
        self.link()?;
        if let Some(link) = self.link.as_mut() {
            link.programmed = true;
        }
        let chunk_len = self.max_program_chunk();
        for (i, chunk) in data.chunks(chunk_len).enumerate() {
            let chunk_address = address + (i * chunk_len) as u32;
            self.with_retries("PROGRAM", ms(self.settings.timeout_t5_ms), |b, wait| {
                b.ensure_mta(chunk_address)?;
                b.exchange(&packet::program(chunk), wait)?;
                b.set_mta(chunk_address.checked_add(chunk.len() as u32));
                Ok(())
            })?;
        }
        Ok(())
    }

    fn upload(&mut self, address: u32, buf: &mut [u8]) -> Result<(), ProtocolError> {
        check_range(address, buf.len())?;
        self.link()?;
        let chunk_len = self.max_upload_chunk();
        for (i, chunk) in buf.chunks_mut(chunk_len).enumerate() {
            let chunk_address = address + (i * chunk_len) as u32;
            let len = chunk.len();
            let payload = self.with_retries("UPLOAD", ms(self.settings.timeout_t1_ms), |b, wait| {
                b.ensure_mta(chunk_address)?;
                let payload = b.exchange(&packet::upload(len as u8), wait)?;
                if payload.len() < len {
                    return Err(Attempt::Retry(format!(
                        "UPLOAD returned {} of {len} bytes",
                        payload.len()
                    )));
                }
                b.set_mta(chunk_address.checked_add(len as u32));
                Ok(payload)
            })?;
            chunk.copy_from_slice(&payload[..len]);
        }
        Ok(())
    }

    fn max_program_chunk(&self) -> usize {
        self.link.map_or(0, |link| link.max_cto_pgm - 2)
    }

    fn max_upload_chunk(&self) -> usize {
        self.link.map_or(0, |link| link.max_cto - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn fast_settings() -> XcpSettings {
        XcpSettings {
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn setup(config: SimConfig) -> (XcpBackend, MockTransport, SimTarget) {
        let mock = MockTransport::new();
        let target = SimTarget::new(config);
        target.attach(&mock);
        let mut backend = XcpBackend::new(fast_settings(), Box::new(mock.clone()));
        backend.open_channel().unwrap();
        (backend, mock, target)
    }

    fn count(commands: &[u8], code: u8) -> usize {
        commands.iter().filter(|c| **c == code).count()
    }

    #[test]
    fn test_connect_negotiates_packet_sizes() {
        let (mut backend, mock, target) = setup(SimConfig::default());
        assert_eq!(backend.max_program_chunk(), 0);

        backend.connect().unwrap();
        assert!(backend.is_connected());
        assert!(target.is_connected());
        assert_eq!(backend.max_program_chunk(), 6);
        assert_eq!(backend.max_upload_chunk(), 7);
        assert_eq!(mock.requests(), vec![vec![0xFF, 0x00], vec![0xD2]]);
    }

    #[test]
    fn test_program_start_widens_program_packets() {
        let (mut backend, _mock, _target) = setup(SimConfig {
            max_cto_pgm: 64,
            ..Default::default()
        });
        backend.connect().unwrap();
        assert_eq!(backend.max_program_chunk(), 62);
        assert_eq!(backend.max_upload_chunk(), 7);
    }

    #[test]
    fn test_packet_size_capped_by_transport() {
        let mock = MockTransport::with_kind(TransportKind::XcpV10Can, 8);
        let target = SimTarget::new(SimConfig {
            max_cto: 255,
            ..Default::default()
        });
        target.attach(&mock);
        let mut backend = XcpBackend::new(fast_settings(), Box::new(mock));
        backend.open_channel().unwrap();
        backend.connect().unwrap();
        assert_eq!(backend.max_program_chunk(), 6);
        assert_eq!(backend.max_upload_chunk(), 7);
    }

    #[test]
    fn test_connect_timeout() {
        let (mut backend, mock, target) = setup(SimConfig::default());
        target.set_silent(true);
        assert!(matches!(
            backend.connect(),
            Err(ProtocolError::Timeout {
                command: "CONNECT",
                attempts: 5
            })
        ));
        assert_eq!(mock.requests().len(), 5);
        assert!(!backend.is_connected());
    }

    #[test]
    fn test_connect_rejected() {
        let (mut backend, mock, target) = setup(SimConfig::default());
        target.reject(CMD_CONNECT, ERR_ACCESS_LOCKED);
        assert!(matches!(
            backend.connect(),
            Err(ProtocolError::Rejected {
                command: "CONNECT",
                code: ERR_ACCESS_LOCKED,
                ..
            })
        ));
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_connect_requires_programming_resource() {
        let (mut backend, _mock, _target) = setup(SimConfig {
            programming: false,
            ..Default::default()
        });
        assert!(matches!(
            backend.connect(),
            Err(ProtocolError::Unsupported(_))
        ));
        assert!(!backend.is_connected());
    }

    #[test]
    fn test_program_and_upload() {
        let (mut backend, _mock, target) = setup(SimConfig::default());
        backend.connect().unwrap();

        let data: Vec<u8> = (0..20).collect();
        backend.erase(0x0800_0000, 0x100).unwrap();
        backend.program(0x0800_0000, &data).unwrap();
        assert_eq!(target.read(0x0800_0000, 20), data);

        let mut readback = vec![0u8; 20];
        backend.upload(0x0800_0000, &mut readback).unwrap();
        assert_eq!(readback, data);

        // Consecutive chunks ride on the auto-incremented MTA.
        let commands = target.commands();
        assert_eq!(count(&commands, CMD_SET_MTA), 3);
        assert_eq!(count(&commands, CMD_PROGRAM), 4);
        assert_eq!(count(&commands, CMD_UPLOAD), 3);
    }

    #[test]
    fn test_motorola_byte_order() {
        let (mut backend, mock, _target) = setup(SimConfig {
            byte_order: Endianness::Motorola,
            ..Default::default()
        });
        backend.connect().unwrap();
        mock.clear_requests();
        backend.program(0x0800_1234, &[0xAA]).unwrap();
        assert_eq!(
            mock.requests(),
            vec![
                vec![0xF6, 0, 0, 0, 0x08, 0x00, 0x12, 0x34],
                vec![0xD0, 1, 0xAA],
            ]
        );
    }

    #[test]
    fn test_lost_response_reissues_mta() {
        let (mut backend, _mock, target) = setup(SimConfig::default());
        backend.connect().unwrap();
        backend.program(0x1000, &[1, 2, 3, 4, 5, 6]).unwrap();

        // The PROGRAM executes but its response is lost; the retry must
        // rewind the MTA instead of writing the chunk further on.
        target.lose_responses(1);
        backend.program(0x1006, &[7, 8, 9, 10, 11, 12]).unwrap();
        backend.program(0x100C, &[13]).unwrap();

        assert_eq!(target.read(0x1000, 14), {
            let mut expected: Vec<u8> = (1..=13).collect();
            expected.push(0xFF);
            expected
        });
        let commands = target.commands();
        assert_eq!(
            &commands[commands.len() - 5..],
            &[CMD_PROGRAM, CMD_PROGRAM, CMD_SET_MTA, CMD_PROGRAM, CMD_PROGRAM]
        );
    }

    #[test]
    fn test_busy_is_retried() {
        let (mut backend, _mock, target) = setup(SimConfig::default());
        backend.connect().unwrap();

        target.busy_responses(2);
        backend.erase(0x2000, 0x10).unwrap();

        target.busy_responses(3);
        assert!(matches!(
            backend.erase(0x2000, 0x10),
            Err(ProtocolError::Timeout {
                command: "PROGRAM_CLEAR",
                attempts: 3
            })
        ));
    }

    #[test]
    fn test_malformed_response_is_retried() {
        let (mut backend, mock, target) = setup(SimConfig::default());
        backend.connect().unwrap();
        mock.queue_reply(&[0x42]);
        backend.program(0x3000, &[0x55]).unwrap();
        assert_eq!(target.read(0x3000, 1), vec![0x55]);
    }

    #[test]
    fn test_garbled_frame_is_retried() {
        let (mut backend, mock, target) = setup(SimConfig::default());
        backend.connect().unwrap();
        mock.queue_garbled();
        backend.program(0x3000, &[0x66, 0x67]).unwrap();
        assert_eq!(target.read(0x3000, 2), vec![0x66, 0x67]);

        mock.queue_garbled();
        mock.queue_garbled();
        mock.queue_garbled();
        assert!(matches!(
            backend.erase(0x3000, 2),
            Err(ProtocolError::Timeout {
                command: "PROGRAM_CLEAR",
                attempts: 3
            })
        ));
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let (mut backend, _mock, target) = setup(SimConfig {
            flash: 0x1000..0x2000,
            ..Default::default()
        });
        backend.connect().unwrap();
        let err = backend.erase(0x3000, 0x100).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Rejected {
                command: "PROGRAM_CLEAR",
                code: ERR_OUT_OF_RANGE,
                ..
            }
        ));
        assert!(err.to_string().contains("ERR_OUT_OF_RANGE"));
        assert_eq!(count(&target.commands(), CMD_PROGRAM_CLEAR), 1);
    }

    #[test]
    fn test_operations_need_connection() {
        let (mut backend, _mock, _target) = setup(SimConfig::default());
        assert!(matches!(
            backend.erase(0, 1),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            backend.program(0, &[1]),
            Err(ProtocolError::NotConnected)
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            backend.upload(0, &mut buf),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[test]
    fn test_range_checked() {
        let (mut backend, _mock, _target) = setup(SimConfig::default());
        backend.connect().unwrap();
        assert!(matches!(
            backend.program(0xFFFF_FFFF, &[1, 2]),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            backend.erase(0x1000, 0),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_transport_failure_is_not_retried() {
        let mock = MockTransport::new();
        let mut backend = XcpBackend::new(fast_settings(), Box::new(mock.clone()));
        // Never opened.
        assert!(matches!(
            backend.connect(),
            Err(ProtocolError::Transport(TransportError::NotOpen))
        ));
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn test_disconnect_resets_target() {
        let (mut backend, _mock, target) = setup(SimConfig::default());
        backend.connect().unwrap();
        backend.program(0x1000, &[1, 2, 3]).unwrap();
        backend.disconnect().unwrap();

        assert!(!backend.is_connected());
        assert_eq!(target.resets(), 1);
        let commands = target.commands();
        assert_eq!(
            &commands[commands.len() - 2..],
            &[CMD_PROGRAM, CMD_PROGRAM_RESET]
        );
        // Second call is a no-op.
        backend.disconnect().unwrap();
        assert_eq!(target.resets(), 1);
    }

    #[test]
    fn test_reset_response_is_optional() {
        let (mut backend, _mock, target) = setup(SimConfig::default());
        backend.connect().unwrap();
        target.lose_responses(1);
        backend.disconnect().unwrap();
        assert_eq!(target.resets(), 1);
    }

    #[test]
    fn test_plain_disconnect() {
        let mock = MockTransport::new();
        let target = SimTarget::default();
        target.attach(&mock);
        let settings = XcpSettings {
            reset_on_disconnect: false,
            ..fast_settings()
        };
        let mut backend = XcpBackend::new(settings, Box::new(mock));
        backend.open_channel().unwrap();
        backend.connect().unwrap();
        backend.disconnect().unwrap();

        assert_eq!(target.commands().last(), Some(&CMD_DISCONNECT));
        assert_eq!(target.resets(), 0);
        assert!(!target.is_connected());
    }

    #[test]
    fn test_settings_toml_defaults() {
        let settings: XcpSettings = toml::from_str("timeout_t4_ms = 20000").unwrap();
        assert_eq!(settings.timeout_t4_ms, 20000);
        assert_eq!(settings.timeout_t1_ms, 1000);
        assert_eq!(settings.connect_attempts, 5);
        assert!(settings.reset_on_disconnect);
    }
}
