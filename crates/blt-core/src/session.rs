//! BLT session: high-level orchestrator of a firmware update.
//!
//! A session selects a protocol backend and a transport at `init`, opens the
//! link with `start`, and relays memory operations to the target while
//! connected. Every operation checks the current [`SessionState`] first and
//! fails with [`SessionError::InvalidState`] without side effects when it
//! does not apply.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::checksum::Crc32;
use crate::events::{BltEvent, BltObserver, Operation, PACKET_PREVIEW_LEN, PacketDirection, TracingObserver};
use crate::firmware::SegmentStore;
use crate::protocol::{self, ProtocolBackend, ProtocolError, SessionKind, SessionSettings, XcpSettings};
use crate::state::{SessionState, StateMachine};
use crate::transport::{
    self, BuildError, CanSettings, SerialSettings, Transport, TransportError, TransportKind,
    TransportSettings, UsbSettings,
};

/// Bytes handed to the backend per progress report.
pub const PROGRESS_BLOCK_LEN: usize = 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{session} does not support {transport}")]
    UnsupportedCombination {
        session: SessionKind,
        transport: TransportKind,
    },

    #[error("Operation requires state {expected}, session is {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Failed to open transport: {0}")]
    TransportOpenFailed(#[source] TransportError),

    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(#[source] ProtocolError),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(#[source] ProtocolError),

    #[error("Communication timed out: {0}")]
    CommunicationTimeout(#[source] ProtocolError),

    #[error("Communication error: {0}")]
    CommunicationError(#[source] ProtocolError),

    #[error(
        "Verification failed at {address:#010X}: expected CRC {expected:#010X}, target has {actual:#010X}"
    )]
    VerifyFailed {
        address: u32,
        expected: u32,
        actual: u32,
    },

    #[error("{0}")]
    Generic(String),
}

impl SessionError {
    /// A channel that fails mid-handshake never delivered an answer, so it
    /// counts as a timeout; everything else the target said is a rejection.
    fn from_handshake(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Timeout { .. } | ProtocolError::Transport(_) => {
                SessionError::HandshakeTimeout(e)
            }
            _ => SessionError::HandshakeRejected(e),
        }
    }

    fn from_communication(e: ProtocolError) -> Self {
        if e.is_timeout() {
            return SessionError::CommunicationTimeout(e);
        }
        match e {
            ProtocolError::InvalidArgument(msg) => SessionError::InvalidArgument(msg),
            ProtocolError::NotConnected => SessionError::Generic(e.to_string()),
            _ => SessionError::CommunicationError(e),
        }
    }
}

/// Configuration for a BLT session, as stored in a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session: SessionKind,
    pub transport: TransportKind,
    pub xcp: XcpSettings,
    pub serial: SerialSettings,
    pub can: CanSettings,
    pub usb: UsbSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session: SessionKind::XcpV10,
            transport: TransportKind::XcpV10Rs232,
            xcp: XcpSettings::default(),
            serial: SerialSettings::default(),
            can: CanSettings::default(),
            usb: UsbSettings::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Protocol settings for the configured session kind.
    pub fn session_settings(&self) -> SessionSettings {
        match self.session {
            SessionKind::XcpV10 => SessionSettings::XcpV10(self.xcp.clone()),
        }
    }

    /// Channel settings for the configured transport kind.
    pub fn transport_settings(&self) -> Option<TransportSettings> {
        match self.transport {
            TransportKind::XcpV10Rs232 => Some(TransportSettings::Serial(self.serial.clone())),
            TransportKind::XcpV10Can => Some(TransportSettings::Can(self.can.clone())),
            TransportKind::XcpV10Usb => Some(TransportSettings::Usb(self.usb.clone())),
            TransportKind::Loopback => None,
        }
    }
}

/// BLT session. Dropping it terminates it.
pub struct BltSession<O: BltObserver = TracingObserver> {
    machine: StateMachine,
    backend: Option<Box<dyn ProtocolBackend>>,
    observer: Arc<O>,
}

impl BltSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new() -> Self {
        Self::with_observer(Arc::new(TracingObserver))
    }
}

impl Default for BltSession<TracingObserver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: BltObserver + 'static> BltSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(observer: Arc<O>) -> Self {
        Self {
            machine: StateMachine::new(),
            backend: None,
            observer,
        }
    }

    /// Select protocol and transport, constructing the transport from
    /// `transport_settings` or the kind's defaults.
    #[instrument(level = "info", skip(self, session_settings, transport_settings))]
    pub fn init(
        &mut self,
        session_kind: SessionKind,
        session_settings: Option<SessionSettings>,
        transport_kind: TransportKind,
        transport_settings: Option<TransportSettings>,
    ) -> Result<(), SessionError> {
        self.require(SessionState::Uninitialized)?;
        let settings = resolve_settings(session_kind, session_settings, transport_kind)?;
        let transport = transport::build(transport_kind, transport_settings).map_err(|e| match e {
            BuildError::SettingsMismatch => {
                SessionError::InvalidArgument("transport settings belong to another transport kind")
            }
            BuildError::SettingsRequired => {
                SessionError::InvalidArgument("transport kind requires settings")
            }
        })?;
        self.install(settings, transport);
        Ok(())
    }

    /// Like [`init`](Self::init), with a caller-provided transport.
    #[instrument(level = "info", skip(self, session_settings, transport), fields(transport = %transport.kind()))]
    pub fn init_with_transport(
        &mut self,
        session_kind: SessionKind,
        session_settings: Option<SessionSettings>,
        transport: Box<dyn Transport>,
    ) -> Result<(), SessionError> {
        self.require(SessionState::Uninitialized)?;
        let settings = resolve_settings(session_kind, session_settings, transport.kind())?;
        self.install(settings, transport);
        Ok(())
    }

    /// Initialize from a configuration file model.
    pub fn init_from_config(&mut self, config: &SessionConfig) -> Result<(), SessionError> {
        self.init(
            config.session,
            Some(config.session_settings()),
            config.transport,
            config.transport_settings(),
        )
    }

    fn install(&mut self, settings: SessionSettings, transport: Box<dyn Transport>) {
        let observed = ObservableTransport {
            inner: transport,
            observer: Arc::clone(&self.observer),
        };
        let backend = protocol::build(settings, Box::new(observed));
        info!(
            session = %backend.kind(),
            transport = %backend.transport_kind(),
            "Session initialized"
        );
        self.backend = Some(backend);
        self.transition(SessionState::Initialized);
    }
}

impl<O: BltObserver> BltSession<O> {
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    /// Protocol of the initialized session.
    pub fn session_kind(&self) -> Option<SessionKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    /// Transport of the initialized session.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.backend.as_ref().map(|b| b.transport_kind())
    }

    /// Open the transport and connect to the target.
    #[instrument(level = "info", skip(self))]
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Initialized)?;
        let backend = self.backend_mut()?;

        if let Err(e) = backend.open_channel() {
            backend.close_channel();
            return Err(self.fail(SessionError::TransportOpenFailed(e)));
        }
        if let Err(e) = backend.connect() {
            backend.close_channel();
            return Err(self.fail(SessionError::from_handshake(e)));
        }

        self.transition(SessionState::Connected);
        Ok(())
    }

    /// Disconnect from the target and close the transport. Failures are
    /// logged; the session always ends up `Initialized`. No-op unless
    /// connected.
    #[instrument(level = "info", skip(self))]
    pub fn stop(&mut self) {
        if self.state() != SessionState::Connected {
            return;
        }
        if let Some(backend) = self.backend.as_deref_mut() {
            if let Err(e) = backend.disconnect() {
                warn!(error = %e, "Disconnect failed, closing transport anyway");
            }
            backend.close_channel();
        }
        self.transition(SessionState::Initialized);
    }

    /// Stop if connected and release the backend. Safe in every state.
    #[instrument(level = "info", skip(self))]
    pub fn terminate(&mut self) {
        self.stop();
        if let Some(mut backend) = self.backend.take() {
            backend.close_channel();
            debug!("Backend released");
        }
        self.transition(SessionState::Uninitialized);
    }

    /// Erase at least `[address, address + len)` on the target.
    pub fn clear_memory(&mut self, address: u32, len: u32) -> Result<(), SessionError> {
        self.require(SessionState::Connected)?;
        check_range(address, len as usize)?;
        info!(address = %format!("{address:#010X}"), len, "Clearing memory");

        let result = self.backend_mut()?.erase(address, len);
        result.map_err(|e| self.fail(SessionError::from_communication(e)))?;
        self.progress(Operation::Erase, len as u64, len as u64);
        Ok(())
    }

    /// Program `data` at `address`. A failure leaves an unknown prefix of the
    /// range programmed.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<(), SessionError> {
        self.require(SessionState::Connected)?;
        check_range(address, data.len())?;
        info!(address = %format!("{address:#010X}"), len = data.len(), "Writing data");
        self.program_blocks(address, data, 0, data.len() as u64)?;
        Ok(())
    }

    /// Read target memory at `address` into `buf`.
    pub fn read_data(&mut self, address: u32, buf: &mut [u8]) -> Result<(), SessionError> {
        self.require(SessionState::Connected)?;
        check_range(address, buf.len())?;
        debug!(address = %format!("{address:#010X}"), len = buf.len(), "Reading data");

        let total = buf.len() as u64;
        let mut done = 0u64;
        for (i, block) in buf.chunks_mut(PROGRESS_BLOCK_LEN).enumerate() {
            let block_address = address + (i * PROGRESS_BLOCK_LEN) as u32;
            let result = self.backend_mut()?.upload(block_address, block);
            result.map_err(|e| self.fail(SessionError::from_communication(e)))?;
            done += block.len() as u64;
            self.progress(Operation::Read, done, total);
        }
        Ok(())
    }

    /// Read `[address, address + expected.len())` back and compare its CRC-32
    /// with that of `expected`.
    pub fn verify_data(&mut self, address: u32, expected: &[u8]) -> Result<(), SessionError> {
        self.require(SessionState::Connected)?;
        check_range(address, expected.len())?;

        let mut actual = vec![0u8; expected.len()];
        self.read_data(address, &mut actual)?;

        let mut crc = Crc32::new();
        crc.update(expected);
        let expected_crc = crc.finalize();
        let mut crc = Crc32::new();
        crc.update(&actual);
        let actual_crc = crc.finalize();

        self.progress(Operation::Verify, expected.len() as u64, expected.len() as u64);
        if expected_crc != actual_crc {
            return Err(self.fail(SessionError::VerifyFailed {
                address,
                expected: expected_crc,
                actual: actual_crc,
            }));
        }
        debug!(address = %format!("{address:#010X}"), crc = %format!("{expected_crc:#010X}"), "Verified");
        Ok(())
    }

    /// Erase every segment of `image`, then program them, in address order.
    ///
    /// The target may erase whole blocks around a range, so nothing is
    /// programmed until all erases are done.
    #[instrument(level = "info", skip(self, image), fields(segments = image.segment_count()))]
    pub fn program_image(&mut self, image: &SegmentStore) -> Result<(), SessionError> {
        self.require(SessionState::Connected)?;
        if image.is_empty() {
            return Err(SessionError::InvalidArgument("firmware image is empty"));
        }

        let total = image.total_len() as u64;
        let mut erased = 0u64;
        for segment in image.segments() {
            let len = segment.len() as u32;
            let result = self.backend_mut()?.erase(segment.base(), len);
            result.map_err(|e| self.fail(SessionError::from_communication(e)))?;
            erased += len as u64;
            self.progress(Operation::Erase, erased, total);
        }

        let mut programmed = 0u64;
        for segment in image.segments() {
            programmed = self.program_blocks(segment.base(), segment.data(), programmed, total)?;
        }
        info!(bytes = total, "Firmware image programmed");
        Ok(())
    }

    /// Program `data` in progress-sized blocks; returns the updated count.
    fn program_blocks(
        &mut self,
        address: u32,
        data: &[u8],
        mut done: u64,
        total: u64,
    ) -> Result<u64, SessionError> {
        for (i, block) in data.chunks(PROGRESS_BLOCK_LEN).enumerate() {
            let block_address = address + (i * PROGRESS_BLOCK_LEN) as u32;
            let result = self.backend_mut()?.program(block_address, block);
            result.map_err(|e| self.fail(SessionError::from_communication(e)))?;
            done += block.len() as u64;
            self.progress(Operation::Program, done, total);
        }
        Ok(done)
    }

    fn require(&self, expected: SessionState) -> Result<(), SessionError> {
        let actual = self.state();
        if actual != expected {
            return Err(SessionError::InvalidState { expected, actual });
        }
        Ok(())
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn ProtocolBackend>, SessionError> {
        self.backend
            .as_mut()
            .ok_or_else(|| SessionError::Generic("session has no protocol backend".into()))
    }

    fn transition(&mut self, next: SessionState) {
        if let Some(from) = self.machine.goto_state(next) {
            self.observer
                .on_event(&BltEvent::StateChanged { from, to: next });
        }
    }

    fn progress(&self, operation: Operation, current: u64, total: u64) {
        self.observer.on_event(&BltEvent::Progress {
            operation,
            current,
            total,
        });
    }

    /// Report `e` to the observer and hand it back.
    fn fail(&self, e: SessionError) -> SessionError {
        self.observer.on_event(&BltEvent::Error {
            message: e.to_string(),
        });
        e
    }
}

impl<O: BltObserver> Drop for BltSession<O> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Default the protocol settings and check the pairing.
fn resolve_settings(
    session_kind: SessionKind,
    settings: Option<SessionSettings>,
    transport_kind: TransportKind,
) -> Result<SessionSettings, SessionError> {
    if !session_kind.supports(transport_kind) {
        return Err(SessionError::UnsupportedCombination {
            session: session_kind,
            transport: transport_kind,
        });
    }
    match settings {
        Some(settings) if settings.kind() != session_kind => Err(SessionError::InvalidArgument(
            "session settings belong to another session kind",
        )),
        Some(settings) => Ok(settings),
        None => Ok(match session_kind {
            SessionKind::XcpV10 => SessionSettings::XcpV10(XcpSettings::default()),
        }),
    }
}

fn check_range(address: u32, len: usize) -> Result<(), SessionError> {
    if len == 0 {
        return Err(SessionError::InvalidArgument("length must be non-zero"));
    }
    if address as u64 + len as u64 > 1u64 << 32 {
        return Err(SessionError::InvalidArgument(
            "range exceeds the 32-bit address space",
        ));
    }
    Ok(())
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<O: BltObserver> {
    inner: Box<dyn Transport>,
    observer: Arc<O>,
}

impl<O: BltObserver> ObservableTransport<O> {
    fn report(&self, direction: PacketDirection, packet: &[u8]) {
        self.observer.on_event(&BltEvent::Packet {
            direction,
            length: packet.len(),
            data: packet.iter().take(PACKET_PREVIEW_LEN).copied().collect(),
        });
    }
}

impl<O: BltObserver> Transport for ObservableTransport<O> {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.report(PacketDirection::Tx, request);
        let res = self.inner.transact(request, timeout);
        if let Ok(response) = &res {
            self.report(PacketDirection::Rx, response);
        }
        res
    }

    fn max_packet_len(&self) -> usize {
        self.inner.max_packet_len()
    }
}
