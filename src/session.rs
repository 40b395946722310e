use crate::{
    codec::Codec,
    config::Config,
    error::{Result, YamuxError},
    frame::Frame,
    header::{Flags, FrameType, GoAwayCode},
    stream::{Stream, StreamShared, StreamState},
    stream_id::StreamIdGenerator,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{oneshot, Notify},
};
use tokio_util::codec::Framed;

/// Per-stream bookkeeping held in the session's stream table.
#[derive(Debug)]
struct StreamSlot {
    /// Feeds inbound DATA to the stream handle; dropped to None once the
    /// peer half-closes, which is how the handle observes EOF.
    data_tx: Option<flume::Sender<Bytes>>,
    shared: Arc<StreamShared>,
}

/// An outstanding PING waiting for its ACK.
#[derive(Debug)]
struct PendingPing {
    sent_at: Instant,
    /// Present for embedder-issued pings wanting the RTT; keepalive pings
    /// have no listener.
    reply: Option<oneshot::Sender<Duration>>,
}

/// Session-wide liveness flags shared with every stream handle.
#[derive(Debug, Clone)]
pub(crate) struct SessionState {
    die: Arc<Notify>,
    closed: Arc<AtomicBool>,
    go_away_received: Arc<AtomicBool>,
    local_go_away: Arc<AtomicBool>,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            die: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            go_away_received: Arc::new(AtomicBool::new(false)),
            local_go_away: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.die.notify_waiters();
        }
    }

    pub(crate) fn close_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.die)
    }

    fn set_go_away_received(&self) {
        self.go_away_received.store(true, Ordering::Relaxed);
    }

    fn go_away_received(&self) -> bool {
        self.go_away_received.load(Ordering::Relaxed)
    }

    fn set_local_go_away(&self) {
        self.local_go_away.store(true, Ordering::Relaxed);
    }

    fn local_go_away(&self) -> bool {
        self.local_go_away.load(Ordering::Relaxed)
    }

    /// No new streams may be created in either direction.
    fn is_shutdown(&self) -> bool {
        self.is_closed() || self.go_away_received() || self.local_go_away()
    }
}

/// Session internals shared by the public handle, the spawned tasks, and
/// (weakly) every stream handle.
#[derive(Debug)]
pub(crate) struct SessionCore {
    /// Active streams keyed by stream id.
    streams: DashMap<u32, StreamSlot>,
    config: Arc<Config>,
    /// FIFO of inbound streams not yet claimed by accept_stream. Bounded at
    /// accept_backlog; a SYN that does not fit is answered with RST.
    incoming_tx: flume::Sender<Stream>,
    incoming_rx: flume::Receiver<Stream>,
    id_gen: StreamIdGenerator,
    is_client: bool,
    /// All outbound frames funnel through here to the send task.
    frame_tx: flume::Sender<Frame>,
    state: SessionState,
    pending_pings: DashMap<u32, PendingPing>,
    next_ping_id: AtomicU32,
}

impl SessionCore {
    pub(crate) fn remove_stream(&self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    /// Tear down a stream the peer reset (or that violated protocol).
    fn reset_stream(&self, stream_id: u32) {
        if let Some((_, slot)) = self.streams.remove(&stream_id) {
            slot.shared.mark_reset();
        }
    }

    /// Record an inbound FIN for a stream.
    fn handle_remote_fin(&self, stream_id: u32) {
        let mut fully_closed = false;
        if let Some(mut slot) = self.streams.get_mut(&stream_id) {
            match slot.shared.state() {
                StreamState::FinSent => {
                    slot.shared.set_state(StreamState::Closed);
                    slot.data_tx = None;
                    fully_closed = true;
                }
                StreamState::Closed => {}
                _ => {
                    slot.shared.set_state(StreamState::FinRecv);
                    slot.data_tx = None;
                }
            }
        }
        if fully_closed {
            self.streams.remove(&stream_id);
        }
    }

    /// Reset every live stream; used by session close.
    fn reset_all_streams(&self) {
        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for stream_id in ids {
            if let Some((_, slot)) = self.streams.remove(&stream_id) {
                slot.shared.mark_reset();
                // Transport errors are irrelevant mid-shutdown.
                let _ = self.frame_tx.try_send(Frame::rst(stream_id));
            }
        }
    }
}

/// A multiplexed session carrying many independent byte streams over one
/// reliable, ordered transport.
#[derive(Debug)]
pub struct Session<T> {
    core: Arc<SessionCore>,
    _transport: PhantomData<T>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _transport: PhantomData,
        }
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    /// Create a new client session. Clients allocate odd stream ids.
    pub async fn client(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, true).await
    }

    /// Create a new server session. Servers allocate even stream ids.
    pub async fn server(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, false).await
    }

    async fn new(transport: T, config: Config, is_client: bool) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let codec = Codec::new(&config);
        let framed = Framed::new(transport, codec);
        let (sink, stream) = framed.split();

        let (frame_tx, frame_rx) = flume::unbounded();
        let (incoming_tx, incoming_rx) = flume::bounded(config.accept_backlog);

        let core = Arc::new(SessionCore {
            streams: DashMap::new(),
            config: Arc::clone(&config),
            incoming_tx,
            incoming_rx,
            id_gen: StreamIdGenerator::new(is_client),
            is_client,
            frame_tx,
            state: SessionState::new(),
            pending_pings: DashMap::new(),
            next_ping_id: AtomicU32::new(0),
        });

        let recv_core = Arc::clone(&core);
        tokio::spawn(async move {
            if let Err(e) = recv_loop(stream, recv_core).await {
                tracing::error!("recv_loop error: {}", e);
            }
        });

        let send_core = Arc::clone(&core);
        tokio::spawn(async move {
            if let Err(e) = send_loop(sink, frame_rx, send_core).await {
                tracing::error!("send_loop error: {}", e);
            }
        });

        if config.enable_keepalive {
            tokio::spawn(keepalive_loop(Arc::clone(&core)));
        }

        Ok(Session {
            core,
            _transport: PhantomData,
        })
    }

    /// Open a new outgoing stream.
    ///
    /// The SYN carries our initial receive window; data may be written
    /// immediately, budgeted against the configured window until the peer's
    /// SYN|ACK settles the real one.
    pub async fn open_stream(&self) -> Result<Stream> {
        let core = &self.core;
        if core.state.is_shutdown() {
            return Err(YamuxError::SessionClosed);
        }
        if core.streams.len() >= core.config.max_num_streams {
            return Err(YamuxError::TooManyStreams);
        }

        let stream_id = core.id_gen.next()?;
        let window = core.config.max_stream_window_size;
        let shared = Arc::new(StreamShared::new(
            stream_id,
            StreamState::SynSent,
            window,
            window,
        ));
        let (data_tx, data_rx) = flume::unbounded();

        core.streams.insert(
            stream_id,
            StreamSlot {
                data_tx: Some(data_tx),
                shared: Arc::clone(&shared),
            },
        );

        let stream = Stream::new(
            shared,
            data_rx,
            core.frame_tx.clone(),
            Arc::downgrade(core),
            core.state.clone(),
            Arc::clone(&core.config),
        );

        if core
            .frame_tx
            .send_async(Frame::open_stream(stream_id, window))
            .await
            .is_err()
        {
            core.streams.remove(&stream_id);
            return Err(YamuxError::SessionClosed);
        }

        Ok(stream)
    }

    /// Accept an incoming stream initiated by the peer. Streams are handed
    /// out in the order the peer opened them.
    pub async fn accept_stream(&self) -> Result<Stream> {
        if self.core.state.is_closed() {
            return Err(YamuxError::SessionClosed);
        }

        let rx = &self.core.incoming_rx;
        let die = self.core.state.close_notifier();

        tokio::select! {
            result = rx.recv_async() => result.map_err(|_| YamuxError::SessionClosed),
            _ = die.notified() => Err(YamuxError::SessionClosed),
        }
    }

    /// Ping the peer and measure the round trip time.
    pub async fn ping(&self) -> Result<Duration> {
        let core = &self.core;
        if core.state.is_closed() {
            return Err(YamuxError::SessionClosed);
        }

        let token = core.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        core.pending_pings.insert(
            token,
            PendingPing {
                sent_at: Instant::now(),
                reply: Some(reply_tx),
            },
        );

        if core.frame_tx.send_async(Frame::ping(token)).await.is_err() {
            core.pending_pings.remove(&token);
            return Err(YamuxError::SessionClosed);
        }

        let die = core.state.close_notifier();
        tokio::select! {
            rtt = reply_rx => rtt.map_err(|_| YamuxError::SessionClosed),
            _ = die.notified() => {
                core.pending_pings.remove(&token);
                Err(YamuxError::SessionClosed)
            }
        }
    }

    /// Announce that no new streams will be created, without tearing down
    /// the ones already running.
    pub async fn go_away(&self) -> Result<()> {
        let core = &self.core;
        if core.state.is_closed() {
            return Err(YamuxError::SessionClosed);
        }
        core.state.set_local_go_away();
        core.frame_tx
            .send_async(Frame::go_away(GoAwayCode::Normal))
            .await
            .map_err(|_| YamuxError::SessionClosed)
    }

    /// Close the session: send GO_AWAY (best effort), reset every stream,
    /// and stop the background tasks. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let core = &self.core;
        if core.state.is_closed() {
            return Ok(());
        }
        core.state.set_local_go_away();
        let _ = core
            .frame_tx
            .send_async(Frame::go_away(GoAwayCode::Normal))
            .await;
        core.reset_all_streams();
        core.state.close();
        Ok(())
    }

    /// Check if the session is closed.
    pub fn is_closed(&self) -> bool {
        self.core.state.is_closed()
    }

    /// Number of streams currently tracked by the session.
    pub fn num_streams(&self) -> usize {
        self.core.streams.len()
    }

    /// Whether this is the client side of the connection.
    pub fn is_client(&self) -> bool {
        self.core.is_client
    }
}

/// Receive task: decode one frame at a time off the transport and dispatch
/// it. Inbound events on one session are therefore strictly serialized.
async fn recv_loop<T>(
    mut stream: futures::stream::SplitStream<Framed<T, Codec>>,
    core: Arc<SessionCore>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let die = core.state.close_notifier();
    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        // A bad frame for one stream does not take the
                        // session down; the handler answers with RST.
                        if let Err(e) = handle_frame(frame, &core).await {
                            tracing::error!("Error handling frame: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("Frame decode error: {}", e);
                        break;
                    }
                    None => {
                        tracing::debug!("Transport closed");
                        break;
                    }
                }
            }
            _ = die.notified() => {
                tracing::debug!("recv_loop shutting down");
                break;
            }
        }
    }

    core.state.close();
    Ok(())
}

/// Send task: the single writer draining the outbound frame queue.
async fn send_loop<T>(
    mut sink: futures::stream::SplitSink<Framed<T, Codec>, Frame>,
    frame_rx: flume::Receiver<Frame>,
    core: Arc<SessionCore>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let die = core.state.close_notifier();
    let write_timeout = core.config.connection_write_timeout;
    loop {
        tokio::select! {
            result = frame_rx.recv_async() => {
                match result {
                    Ok(frame) => {
                        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::error!("Frame send error: {}", e);
                                break;
                            }
                            Err(_) => {
                                tracing::error!("Transport write timed out");
                                break;
                            }
                        }
                    }
                    Err(_) => {
                        tracing::debug!("Frame sender closed");
                        break;
                    }
                }
            }
            _ = die.notified() => {
                // Flush frames queued before shutdown (GO_AWAY, final RSTs).
                while let Ok(frame) = frame_rx.try_recv() {
                    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                tracing::debug!("send_loop shutting down");
                break;
            }
        }
    }

    core.state.close();
    Ok(())
}

/// Keepalive task: ping the peer every interval; an ACK that has not come
/// back by the next tick means the connection is dead.
async fn keepalive_loop(core: Arc<SessionCore>) {
    let die = core.state.close_notifier();
    let period = core.config.keepalive_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut outstanding: Option<u32> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(token) = outstanding.take() {
                    if core.pending_pings.remove(&token).is_some() {
                        tracing::error!("keepalive ping {} went unanswered, closing session", token);
                        core.state.close();
                        break;
                    }
                }

                let token = core.next_ping_id.fetch_add(1, Ordering::Relaxed);
                core.pending_pings.insert(token, PendingPing {
                    sent_at: Instant::now(),
                    reply: None,
                });
                if core.frame_tx.send_async(Frame::ping(token)).await.is_err() {
                    break;
                }
                outstanding = Some(token);
            }
            _ = die.notified() => break,
        }
    }
}

/// Dispatch one inbound frame. The match on the frame type is exhaustive;
/// unknown types never get this far (the codec rejects them).
async fn handle_frame(frame: Frame, core: &Arc<SessionCore>) -> Result<()> {
    match frame.header.ty {
        FrameType::Data => handle_data_frame(frame, core).await,
        FrameType::WindowUpdate => handle_window_update_frame(frame, core).await,
        FrameType::Ping => handle_ping_frame(frame, core).await,
        FrameType::GoAway => handle_go_away_frame(frame, core),
    }
}

async fn handle_data_frame(frame: Frame, core: &Arc<SessionCore>) -> Result<()> {
    let stream_id = frame.stream_id();
    let flags = frame.flags();

    if flags.contains(Flags::RST) {
        core.reset_stream(stream_id);
        return Ok(());
    }

    let lookup = core
        .streams
        .get(&stream_id)
        .map(|slot| (slot.data_tx.clone(), Arc::clone(&slot.shared)));

    let Some((data_tx, shared)) = lookup else {
        // Tolerated: the peer may be racing a reset of ours.
        tracing::warn!(stream_id, "DATA for unknown stream, replying RST");
        let _ = core.frame_tx.try_send(Frame::rst(stream_id));
        return Ok(());
    };

    if matches!(
        shared.state(),
        StreamState::Closed | StreamState::FinRecv
    ) {
        // Not readable anymore; the payload is already off the transport,
        // just tell the peer to stop.
        let _ = core.frame_tx.try_send(Frame::rst(stream_id));
        return Ok(());
    }

    let body_len = frame.body.len() as u32;
    if body_len > 0 {
        if !shared.debit_recv_window(body_len) {
            core.reset_stream(stream_id);
            let _ = core.frame_tx.try_send(Frame::rst(stream_id));
            return Err(YamuxError::ProtocolViolation(format!(
                "stream {stream_id} exceeded its receive window"
            )));
        }
        if let Some(tx) = &data_tx {
            if tx.send(frame.body).is_err() {
                tracing::debug!(stream_id, "dropping DATA for abandoned stream");
            }
        }
    }

    if flags.contains(Flags::FIN) {
        core.handle_remote_fin(stream_id);
    }

    Ok(())
}

async fn handle_window_update_frame(frame: Frame, core: &Arc<SessionCore>) -> Result<()> {
    let stream_id = frame.stream_id();
    let flags = frame.flags();
    let delta = frame.window_delta()?;

    if flags.contains(Flags::RST) {
        core.reset_stream(stream_id);
        return Ok(());
    }

    if flags.contains(Flags::SYN) && !flags.contains(Flags::ACK) {
        return handle_inbound_syn(core, stream_id, delta).await;
    }

    let shared = core
        .streams
        .get(&stream_id)
        .map(|slot| Arc::clone(&slot.shared));

    if flags.contains(Flags::SYN) && flags.contains(Flags::ACK) {
        // Peer accepted our stream and advertised its receive window.
        match shared {
            Some(shared) if shared.state() == StreamState::SynSent => {
                shared.complete_handshake(delta, core.config.max_stream_window_size);
                shared.set_state(StreamState::Established);
            }
            Some(_) => {}
            None => tracing::warn!(stream_id, "SYN|ACK for unknown stream"),
        }
        return Ok(());
    }

    if flags.contains(Flags::FIN) && flags.contains(Flags::ACK) {
        // Legacy FIN acknowledgement completes our half-close.
        if let Some(shared) = shared {
            if shared.state() == StreamState::FinSent {
                shared.set_state(StreamState::Closed);
                core.streams.remove(&stream_id);
            }
        }
        return Ok(());
    }

    if flags.contains(Flags::FIN) {
        // Compat: some implementations carry FIN on a window update and
        // expect a FIN|ACK back.
        if shared.is_some() {
            core.handle_remote_fin(stream_id);
            let _ = core.frame_tx.try_send(Frame::fin_ack(stream_id));
        }
        return Ok(());
    }

    // Bare window update: the peer granted us more send credit. A
    // zero-length frame decodes as delta 0 and falls through harmlessly.
    if delta > 0 {
        match shared {
            Some(shared) => {
                if let Err(e) = shared.grow_send_window(delta) {
                    core.reset_stream(stream_id);
                    let _ = core.frame_tx.try_send(Frame::rst(stream_id));
                    return Err(e);
                }
            }
            None => tracing::warn!(stream_id, "window update for unknown stream"),
        }
    }

    Ok(())
}

/// The peer opened a stream: SYN carried on a WINDOW_UPDATE advertising its
/// initial receive window.
async fn handle_inbound_syn(core: &Arc<SessionCore>, stream_id: u32, peer_window: u32) -> Result<()> {
    if let Err(e) = core.id_gen.validate_peer_stream_id(stream_id) {
        tracing::warn!(stream_id, "rejecting SYN with invalid id: {}", e);
        let _ = core.frame_tx.try_send(Frame::rst(stream_id));
        return Ok(());
    }

    if core.state.is_shutdown() {
        let _ = core.frame_tx.try_send(Frame::rst(stream_id));
        return Ok(());
    }

    if core.streams.contains_key(&stream_id) {
        // Duplicate SYN: answer RST for the id, the session survives.
        tracing::warn!(stream_id, "SYN for an id already in use, replying RST");
        let _ = core.frame_tx.try_send(Frame::rst(stream_id));
        return Ok(());
    }

    if core.streams.len() >= core.config.max_num_streams || core.incoming_tx.is_full() {
        tracing::warn!(stream_id, "accept backlog full, replying RST");
        let _ = core.frame_tx.try_send(Frame::rst(stream_id));
        return Ok(());
    }

    let our_window = core.config.max_stream_window_size;
    let shared = Arc::new(StreamShared::new(
        stream_id,
        StreamState::SynRecv,
        peer_window,
        our_window,
    ));
    let (data_tx, data_rx) = flume::unbounded();

    let stream = Stream::new(
        Arc::clone(&shared),
        data_rx,
        core.frame_tx.clone(),
        Arc::downgrade(core),
        core.state.clone(),
        Arc::clone(&core.config),
    );

    core.streams.insert(
        stream_id,
        StreamSlot {
            data_tx: Some(data_tx),
            shared: Arc::clone(&shared),
        },
    );

    if core.incoming_tx.try_send(stream).is_err() {
        core.streams.remove(&stream_id);
        let _ = core.frame_tx.try_send(Frame::rst(stream_id));
        return Ok(());
    }

    core.frame_tx
        .send_async(Frame::accept_stream(stream_id, our_window))
        .await
        .map_err(|_| YamuxError::SessionClosed)?;
    shared.set_state(StreamState::Established);
    Ok(())
}

async fn handle_ping_frame(frame: Frame, core: &Arc<SessionCore>) -> Result<()> {
    let token = frame.ping_token();

    if frame.flags().contains(Flags::ACK) {
        if let Some((_, pending)) = core.pending_pings.remove(&token) {
            let rtt = pending.sent_at.elapsed();
            tracing::trace!(token, ?rtt, "ping acknowledged");
            if let Some(reply) = pending.reply {
                let _ = reply.send(rtt);
            }
        }
        return Ok(());
    }

    // Request: echo the token back.
    core.frame_tx
        .send_async(Frame::ping_ack(token))
        .await
        .map_err(|_| YamuxError::SessionClosed)
}

fn handle_go_away_frame(frame: Frame, core: &Arc<SessionCore>) -> Result<()> {
    let code = frame.go_away_code()?;
    core.state.set_go_away_received();

    match GoAwayCode::from_u32(code) {
        Some(GoAwayCode::Normal) => tracing::debug!("peer is going away"),
        Some(GoAwayCode::ProtocolError) => {
            tracing::warn!("peer is going away: protocol error")
        }
        Some(GoAwayCode::InternalError) => {
            tracing::warn!("peer is going away: internal error")
        }
        None => tracing::warn!(code, "peer is going away with unknown reason"),
    }

    Ok(())
}
