//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{Transport, TransportError, TransportKind};

/// Scripted answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Respond with these bytes.
    Packet(Vec<u8>),
    /// Stay silent; the exchange times out.
    Silence,
    /// Deliver a frame the channel cannot decode.
    Garbled,
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct MockState {
    replies: VecDeque<MockReply>,
    responder: Option<Responder>,
    requests: Vec<Vec<u8>>,
    open: bool,
    open_count: usize,
    fail_open: bool,
}

/// Mock transport for unit testing protocol and session logic.
///
/// Clones share state, so a test can keep one handle for inspection while the
/// backend owns another. Queued replies are served first; when the queue is
/// empty the responder (if any) answers; otherwise the exchange times out.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    kind: TransportKind,
    max_packet_len: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_kind(TransportKind::XcpV10Rs232, 255)
    }

    /// Mock that reports `kind` and carries up to `max_packet_len` bytes.
    pub fn with_kind(kind: TransportKind, max_packet_len: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                replies: VecDeque::new(),
                responder: None,
                requests: Vec::new(),
                open: false,
                open_count: 0,
                fail_open: false,
            })),
            kind,
            max_packet_len,
        }
    }

    /// Queue a response packet for the next request.
    pub fn queue_reply(&self, packet: &[u8]) {
        self.lock().replies.push_back(MockReply::Packet(packet.to_vec()));
    }

    /// Queue a silent exchange (timeout) for the next request.
    pub fn queue_silence(&self) {
        self.lock().replies.push_back(MockReply::Silence);
    }

    /// Queue an undecodable frame for the next request.
    pub fn queue_garbled(&self) {
        self.lock().replies.push_back(MockReply::Garbled);
    }

    /// Answer requests with `responder` once the queue is drained.
    /// Returning `None` simulates a timeout.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Make subsequent `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(TransportError::OpenFailed {
                channel: "mock".into(),
                message: "open refused by test".into(),
            });
        }
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if request.len() > self.max_packet_len {
            return Err(TransportError::FrameTooLong {
                len: request.len(),
                max: self.max_packet_len,
            });
        }
        state.requests.push(request.to_vec());

        let reply = match state.replies.pop_front() {
            Some(MockReply::Packet(bytes)) => Some(bytes),
            Some(MockReply::Silence) => None,
            Some(MockReply::Garbled) => {
                return Err(TransportError::Malformed("garbled frame".into()));
            }
            None => state.responder.as_mut().and_then(|r| r(request)),
        };
        reply.ok_or(TransportError::timeout(timeout))
    }

    fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }
}
