use crate::{
    buffer::RecvBuffer,
    config::Config,
    error::{Result, YamuxError},
    frame::Frame,
    session::{SessionCore, SessionState},
};
use bytes::Bytes;
use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream lifecycle states.
///
/// ```text
/// Idle --send SYN--> SynSent --recv SYN|ACK--> Established
/// Idle --recv SYN--> SynRecv --send ACK-----> Established
/// Established --send FIN--> FinSent --recv FIN--> Closed
/// Established --recv FIN--> FinRecv --send FIN--> Closed
/// any --send or recv RST--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    SynSent = 1,
    SynRecv = 2,
    Established = 3,
    FinSent = 4,
    FinRecv = 5,
    Closed = 6,
}

impl StreamState {
    fn from_u8(value: u8) -> StreamState {
        match value {
            0 => StreamState::Idle,
            1 => StreamState::SynSent,
            2 => StreamState::SynRecv,
            3 => StreamState::Established,
            4 => StreamState::FinSent,
            5 => StreamState::FinRecv,
            _ => StreamState::Closed,
        }
    }
}

/// Stream state shared between the session's receive task and the embedder's
/// `Stream` handle. Everything is atomic; the two sides never hold a lock.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    state: AtomicU8,
    /// Set when the stream was torn down by RST rather than FIN.
    reset: AtomicBool,
    /// Credit we may still spend sending DATA to the peer.
    send_window: AtomicU32,
    /// Credit the peer may still spend sending DATA to us.
    recv_window: AtomicU32,
}

impl StreamShared {
    pub(crate) fn new(id: u32, state: StreamState, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: AtomicU8::new(state as u8),
            reset: AtomicBool::new(false),
            send_window: AtomicU32::new(send_window),
            recv_window: AtomicU32::new(recv_window),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.set_state(StreamState::Closed);
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    pub(crate) fn send_window(&self) -> u32 {
        self.send_window.load(Ordering::Acquire)
    }

    pub(crate) fn consume_send_window(&self, n: u32) {
        self.send_window.fetch_sub(n, Ordering::AcqRel);
    }

    /// Apply a WINDOW_UPDATE delta. Fails if the peer would push the window
    /// past `u32::MAX`.
    pub(crate) fn grow_send_window(&self, delta: u32) -> Result<()> {
        self.send_window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(delta)
            })
            .map(|_| ())
            .map_err(|_| {
                YamuxError::ProtocolViolation(format!(
                    "window update overflows send window on stream {}",
                    self.id
                ))
            })
    }

    /// Settle the send window once the peer's SYN|ACK advertises its real
    /// receive window. Credit already spent while the handshake was in
    /// flight stays spent.
    pub(crate) fn complete_handshake(&self, advertised: u32, assumed: u32) {
        let _ = self
            .send_window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let in_flight = assumed.saturating_sub(current);
                Some(advertised.saturating_sub(in_flight))
            });
    }

    /// Debit the receive window for an arriving DATA body. Returns false if
    /// the peer overran its credit.
    pub(crate) fn debit_recv_window(&self, n: u32) -> bool {
        self.recv_window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(n)
            })
            .is_ok()
    }

    pub(crate) fn credit_recv_window(&self, n: u32) {
        self.recv_window.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn recv_window(&self) -> u32 {
        self.recv_window.load(Ordering::Acquire)
    }
}

/// A multiplexed bidirectional byte stream within a yamux session.
///
/// Implements `AsyncRead` and `AsyncWrite` for seamless integration with
/// tokio. Writes are chunked into DATA frames and budgeted against the
/// peer's receive window; reads drain the stream's receive buffer and
/// return 0 once the peer half-closes.
#[derive(Debug)]
pub struct Stream {
    stream_id: u32,
    shared: Arc<StreamShared>,
    /// Inbound DATA chunks from the session's receive task.
    data_rx: flume::Receiver<Bytes>,
    /// Bytes received but not yet read by the embedder.
    recv_buf: RecvBuffer,
    /// Outbound frames to the session's send task.
    frame_tx: flume::Sender<Frame>,
    /// Back-reference for stream-table removal; weak so a forgotten handle
    /// cannot keep a dead session alive.
    session: Weak<SessionCore>,
    session_state: SessionState,
    config: Arc<Config>,
    /// Bytes consumed since the last WINDOW_UPDATE we sent.
    consumed: u32,
}

impl Stream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        data_rx: flume::Receiver<Bytes>,
        frame_tx: flume::Sender<Frame>,
        session: Weak<SessionCore>,
        session_state: SessionState,
        config: Arc<Config>,
    ) -> Self {
        Self {
            stream_id: shared.id,
            shared,
            data_rx,
            recv_buf: RecvBuffer::new(),
            frame_tx,
            session,
            session_state,
            config,
            consumed: 0,
        }
    }

    /// Get the stream ID.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Remaining credit for sending DATA to the peer.
    pub fn send_window(&self) -> u32 {
        self.shared.send_window()
    }

    /// Check if the peer has half-closed (no more inbound data).
    pub fn is_read_closed(&self) -> bool {
        matches!(self.state(), StreamState::FinRecv | StreamState::Closed)
    }

    /// Check if this side has half-closed (no more outbound data).
    pub fn is_write_closed(&self) -> bool {
        matches!(self.state(), StreamState::FinSent | StreamState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Close the stream gracefully by sending FIN. Reads continue to drain
    /// data already received. Idempotent: a second call is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.is_write_closed() {
            return Ok(());
        }
        self.frame_tx
            .send_async(Frame::fin(self.stream_id))
            .await
            .map_err(|_| YamuxError::SessionClosed)?;
        self.finish_local_close();
        Ok(())
    }

    /// Abort the stream: send RST and drop it from the session immediately.
    pub async fn reset(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        // Transport errors are ignored, the stream is going away regardless.
        let _ = self.frame_tx.send_async(Frame::rst(self.stream_id)).await;
        self.shared.mark_reset();
        if let Some(core) = self.session.upgrade() {
            core.remove_stream(self.stream_id);
        }
        Ok(())
    }

    /// Record the FIN we just sent: a stream that had already seen the
    /// peer's FIN is fully closed and leaves the table.
    fn finish_local_close(&mut self) {
        match self.shared.state() {
            StreamState::FinRecv => {
                self.shared.set_state(StreamState::Closed);
                if let Some(core) = self.session.upgrade() {
                    core.remove_stream(self.stream_id);
                }
            }
            StreamState::Closed => {}
            _ => self.shared.set_state(StreamState::FinSent),
        }
    }

    /// Track consumed bytes and replenish the peer's view of our receive
    /// window once half of it has been freed. The half-window threshold
    /// keeps small request/response exchanges free of update frames.
    fn account_consumed(&mut self, n: usize) {
        self.consumed = self.consumed.saturating_add(n as u32);
        if matches!(
            self.shared.state(),
            StreamState::FinRecv | StreamState::Closed
        ) {
            return;
        }
        let threshold = (self.config.max_stream_window_size / 2).max(1);
        if self.consumed >= threshold {
            let delta = self.consumed;
            if self
                .frame_tx
                .try_send(Frame::window_update(self.stream_id, delta))
                .is_ok()
            {
                self.shared.credit_recv_window(delta);
                self.consumed = 0;
            }
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            // Buffered bytes are always delivered first, even when the
            // stream has since been reset.
            if !this.recv_buf.is_empty() {
                let unfilled = buf.initialize_unfilled();
                let n = this.recv_buf.read(unfilled);
                buf.advance(n);
                this.account_consumed(n);
                return Poll::Ready(Ok(()));
            }

            match this.data_rx.try_recv() {
                Ok(chunk) => {
                    this.recv_buf.write(&chunk);
                }
                Err(flume::TryRecvError::Disconnected) => {
                    return if this.shared.is_reset() {
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "Stream reset",
                        )))
                    } else {
                        // Peer half-closed and everything is drained: EOF.
                        Poll::Ready(Ok(()))
                    };
                }
                Err(flume::TryRecvError::Empty) => {
                    if this.session_state.is_closed() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "Session is closed",
                        )));
                    }
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.session_state.is_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Session is closed",
            )));
        }

        match this.shared.state() {
            StreamState::Closed => {
                let kind = if this.shared.is_reset() {
                    io::ErrorKind::ConnectionReset
                } else {
                    io::ErrorKind::BrokenPipe
                };
                return Poll::Ready(Err(io::Error::new(kind, "Stream is closed")));
            }
            StreamState::FinSent => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "Stream is closed for writing",
                )));
            }
            // Writing before the handshake completes is allowed; the credit
            // assumed for SynSent is settled when the SYN|ACK arrives.
            _ => {}
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let window = this.shared.send_window() as usize;
        if window == 0 {
            // Out of credit until the peer replenishes the window.
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let permitted = buf.len().min(window);
        let max_chunk = this.config.max_data_frame_size as usize;
        let mut written = 0usize;

        for chunk in buf[..permitted].chunks(max_chunk) {
            let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(chunk));
            match this.frame_tx.try_send(frame) {
                Ok(()) => written += chunk.len(),
                Err(flume::TrySendError::Full(_)) => break,
                Err(flume::TrySendError::Disconnected(_)) => {
                    if written == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "Session is closed",
                        )));
                    }
                    break;
                }
            }
        }

        if written == 0 {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        this.shared.consume_send_window(written as u32);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session's send task on write; there is no
        // stream-local buffering to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.is_write_closed() {
            return Poll::Ready(Ok(()));
        }

        match this.frame_tx.try_send(Frame::fin(this.stream_id)) {
            Ok(()) => {
                this.finish_local_close();
                Poll::Ready(Ok(()))
            }
            Err(flume::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                // Session already gone; nothing left to notify.
                this.shared.set_state(StreamState::Closed);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.is_write_closed() {
            return;
        }
        // Best effort FIN so the peer is not left waiting.
        let _ = self.frame_tx.try_send(Frame::fin(self.stream_id));
        match self.shared.state() {
            StreamState::FinRecv => {
                self.shared.set_state(StreamState::Closed);
                if let Some(core) = self.session.upgrade() {
                    core.remove_stream(self.stream_id);
                }
            }
            _ => self.shared.set_state(StreamState::FinSent),
        }
    }
}
