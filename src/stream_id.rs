use crate::{
    error::{Result, YamuxError},
    header::SESSION_STREAM_ID,
};
use std::sync::atomic::{AtomicU32, Ordering};

/// Allocates outbound stream ids and validates inbound ones.
///
/// Clients use odd ids starting at 1, servers even ids starting at 2; both
/// sides advance by 2, so ids stay unique and monotonic per side. Id 0 is
/// reserved for session-level frames.
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU32,
    is_client: bool,
}

impl StreamIdGenerator {
    pub fn new(is_client: bool) -> Self {
        let initial_id = if is_client { 1 } else { 2 };
        Self {
            next_id: AtomicU32::new(initial_id),
            is_client,
        }
    }

    /// Take the next outbound id, failing once the 32-bit space is spent.
    pub fn next(&self) -> Result<u32> {
        let current = self.next_id.fetch_add(2, Ordering::Relaxed);
        if current > u32::MAX - 2 {
            return Err(YamuxError::ProtocolViolation(
                "Stream ID space exhausted - session should be restarted".to_string(),
            ));
        }
        Ok(current)
    }

    /// Check that a peer-initiated id has the parity the peer is allowed to
    /// use and is not the reserved session id.
    pub fn validate_peer_stream_id(&self, stream_id: u32) -> Result<()> {
        if stream_id == SESSION_STREAM_ID {
            return Err(YamuxError::InvalidStreamId(stream_id));
        }

        let peer_is_client = !self.is_client;
        if is_client_initiated(stream_id) != peer_is_client {
            return Err(YamuxError::InvalidStreamId(stream_id));
        }

        Ok(())
    }
}

pub fn is_client_initiated(stream_id: u32) -> bool {
    stream_id % 2 == 1
}

pub fn is_server_initiated(stream_id: u32) -> bool {
    stream_id != SESSION_STREAM_ID && stream_id % 2 == 0
}
