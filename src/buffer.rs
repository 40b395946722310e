use bytes::{Buf, BytesMut};

/// Initial capacity for a stream's receive buffer.
pub const INITIAL_RECV_BUFFER_SIZE: usize = 4096;

/// Per-stream receive buffer.
///
/// Holds bytes the session has accepted from the peer that the embedder has
/// not read yet. A read cursor trails the write end; `compact` reclaims the
/// consumed prefix. Single producer (the session's receive task hands chunks
/// over), single consumer (the stream handle).
#[derive(Debug)]
pub struct RecvBuffer {
    buf: BytesMut,
    pos: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_RECV_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Append bytes, growing as needed.
    pub fn write(&mut self, src: &[u8]) {
        self.buf.extend_from_slice(src);
    }

    /// Copy up to `dst.len()` unread bytes out and advance the cursor.
    /// Returns the number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let available = self.buf.len() - self.pos;
        let n = available.min(dst.len());
        if n > 0 {
            dst[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
        }
        if self.pos > 0 && self.pos == self.buf.len() {
            self.compact();
        }
        n
    }

    /// Discard the consumed prefix so the capacity can be reused.
    pub fn compact(&mut self) {
        self.buf.advance(self.pos);
        self.pos = 0;
    }

    /// Unread bytes remaining.
    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}
