//! In-process loopback channel.
//!
//! Every request packet comes straight back as the response. Useful for
//! exercising the host side of a link without hardware. No protocol backend
//! accepts it, since a command echoed back is never a valid XCP response.

use std::time::Duration;

use tracing::trace;

use super::traits::{Transport, TransportError, TransportKind};

pub const LOOPBACK_MAX_PACKET: usize = 255;

#[derive(Debug, Default)]
pub struct LoopbackTransport {
    open: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn transact(&mut self, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if request.len() > LOOPBACK_MAX_PACKET {
            return Err(TransportError::FrameTooLong {
                len: request.len(),
                max: LOOPBACK_MAX_PACKET,
            });
        }
        trace!(len = request.len(), "Loopback echo");
        Ok(request.to_vec())
    }

    fn max_packet_len(&self) -> usize {
        LOOPBACK_MAX_PACKET
    }
}
