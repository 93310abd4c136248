use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{
    Flags, Frame, FrameCodec, FrameType, GO_AWAY_INTERNAL_ERROR, GO_AWAY_NORMAL,
    GO_AWAY_PROTOCOL_ERROR,
};
use crate::stream::{Stream, StreamShared, StreamState};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Replies generated by the reader (pongs, rejections) that may wait for
/// the writer; beyond this the reader stops consuming the connection
const MAX_PENDING_REPLIES: usize = 64;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which side of the underlying connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialer, allocates odd stream ids
    Initiator,
    /// Listener, allocates even stream ids
    Responder,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Responder => 2,
        }
    }

    /// Whether `id` belongs to the ids this role allocates
    fn owns(self, id: u32) -> bool {
        match self {
            Role::Initiator => id % 2 == 1,
            Role::Responder => id % 2 == 0,
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Peer sent GoAway: existing streams continue, no new ones
    GoingAway,
    Closed,
}

struct SessionInner {
    state: SessionState,

    /// Active streams (stream_id -> state)
    streams: HashMap<u32, Arc<StreamShared>>,

    /// Next id for locally opened streams, `None` once the id space is used up
    next_stream_id: Option<u32>,

    /// Code carried by the peer's GoAway
    remote_go_away: Option<u32>,
}

#[derive(Default)]
struct Pings {
    next_id: u32,
    pending: HashMap<u32, oneshot::Sender<()>>,
}

/// State shared by the session handle, its background tasks and (weakly)
/// its streams
pub(crate) struct SessionShared {
    role: Role,
    config: Config,
    inner: Mutex<SessionInner>,
    pings: Mutex<Pings>,

    /// Frames queued for the writer task
    outbound: mpsc::UnboundedSender<Frame>,

    /// Cancellation token for the background tasks
    cancel: CancellationToken,
}

impl SessionShared {
    fn new(role: Role, config: Config) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            role,
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                streams: HashMap::new(),
                next_stream_id: Some(role.first_stream_id()),
                remote_go_away: None,
            }),
            pings: Mutex::new(Pings::default()),
            outbound,
            cancel: CancellationToken::new(),
            config,
        });
        (shared, outbound_rx)
    }

    /// Session without background tasks; frames land in the returned receiver
    #[cfg(test)]
    pub(crate) fn detached(
        role: Role,
        config: Config,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        Self::new(role, config)
    }

    #[cfg(test)]
    pub(crate) fn insert_stream(&self, stream: Arc<StreamShared>) {
        lock(&self.inner).streams.insert(stream.id(), stream);
    }

    /// Queue a frame for the writer task
    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.outbound.send(frame).map_err(|_| Error::SessionClosed)
    }

    pub(crate) fn remove_stream(&self, stream_id: u32) {
        if lock(&self.inner).streams.remove(&stream_id).is_some() {
            trace!("Removed closed stream id={}", stream_id);
        }
    }

    pub(crate) fn stream_count(&self) -> usize {
        lock(&self.inner).streams.len()
    }

    fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    fn open_stream(self: &Arc<Self>) -> Result<Stream> {
        let shared = {
            let mut inner = lock(&self.inner);
            match inner.state {
                SessionState::Open => {}
                SessionState::GoingAway => {
                    return Err(Error::GoAway(inner.remote_go_away.unwrap_or(GO_AWAY_NORMAL)))
                }
                SessionState::Closed => return Err(Error::SessionClosed),
            }
            if inner.streams.len() >= self.config.max_streams {
                return Err(Error::ResourceExhausted(self.config.max_streams));
            }

            // Allocate stream ID (odd for initiator, even for responder)
            let stream_id = inner
                .next_stream_id
                .ok_or(Error::ResourceExhausted(self.config.max_streams))?;
            inner.next_stream_id = stream_id.checked_add(2);

            let shared = Arc::new(StreamShared::new(stream_id, StreamState::Idle, &self.config));
            inner.streams.insert(stream_id, shared.clone());
            shared
        };

        let stream = Stream::new(shared, Arc::downgrade(self));
        if !self.config.lazy_open {
            stream.send_syn()?;
        }
        debug!("Opened stream id={}", stream.id());
        Ok(stream)
    }

    /// Route one inbound frame, returning the reply it calls for
    fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<Stream>,
    ) -> Result<Option<Frame>> {
        trace!(
            "rx {:?} stream={} flags={:?} length={}",
            frame.frame_type(),
            frame.stream_id(),
            frame.flags(),
            frame.header.length
        );

        match frame.frame_type() {
            FrameType::Data | FrameType::WindowUpdate => self.on_stream_frame(frame, incoming),
            FrameType::Ping => Ok(self.on_ping(frame)),
            FrameType::GoAway => {
                self.on_go_away(frame.header.length);
                Ok(None)
            }
        }
    }

    fn on_stream_frame(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<Stream>,
    ) -> Result<Option<Frame>> {
        let stream_id = frame.stream_id();
        if stream_id == 0 {
            return Err(Error::Protocol(format!(
                "{:?} frame on reserved stream id 0",
                frame.frame_type()
            )));
        }

        let existing = lock(&self.inner).streams.get(&stream_id).cloned();
        match existing {
            Some(_) if frame.flags().contains(Flags::SYN) => Err(Error::Protocol(format!(
                "Duplicate SYN for stream {}",
                stream_id
            ))),
            Some(stream) => {
                if stream.on_frame(&frame)? {
                    self.remove_stream(stream_id);
                }
                Ok(None)
            }
            None if frame.flags().contains(Flags::SYN) => self.on_inbound_syn(frame, incoming),
            None => {
                trace!("Dropping frame for unknown stream id={}", stream_id);
                Ok(None)
            }
        }
    }

    /// Handle a new incoming stream (SYN frame)
    fn on_inbound_syn(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<Stream>,
    ) -> Result<Option<Frame>> {
        let stream_id = frame.stream_id();
        let reject = Frame::window_update(stream_id, Flags::RST, 0);

        // Validate stream ID (should not match our allocation scheme)
        if self.role.owns(stream_id) {
            return Err(Error::Protocol(format!(
                "Peer opened stream {} with our id parity ({:?})",
                stream_id, self.role
            )));
        }

        let shared = {
            let mut inner = lock(&self.inner);
            if inner.state != SessionState::Open {
                None
            } else if inner.streams.len() >= self.config.max_streams {
                warn!(
                    "Stream limit {} reached, rejecting stream id={}",
                    self.config.max_streams, stream_id
                );
                None
            } else {
                let shared = Arc::new(StreamShared::new(
                    stream_id,
                    StreamState::SynReceived,
                    &self.config,
                ));
                inner.streams.insert(stream_id, shared.clone());
                Some(shared)
            }
        };

        let Some(shared) = shared else {
            debug!("Rejecting inbound stream id={}", stream_id);
            return Ok(Some(reject));
        };

        if shared.on_frame(&frame)? {
            self.remove_stream(stream_id);
            return Ok(None);
        }

        let stream = Stream::new(shared.clone(), Arc::downgrade(self));
        match incoming.try_send(stream) {
            Ok(()) => {
                debug!("Accepted incoming stream id={}", stream_id);
                Ok(None)
            }
            Err(e) => {
                if matches!(e, mpsc::error::TrySendError::Full(_)) {
                    warn!("Accept backlog full, resetting stream id={}", stream_id);
                }
                shared.abort();
                self.remove_stream(stream_id);
                Ok(Some(reject))
            }
        }
    }

    fn on_ping(&self, frame: Frame) -> Option<Frame> {
        let value = frame.header.length;
        if frame.flags().contains(Flags::SYN) {
            return Some(Frame::ping(Flags::ACK, value));
        }
        if frame.flags().contains(Flags::ACK) {
            match lock(&self.pings).pending.remove(&value) {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => trace!("Unsolicited ping ack value={}", value),
            }
        }
        None
    }

    fn on_go_away(&self, code: u32) {
        let mut inner = lock(&self.inner);
        if inner.state == SessionState::Open {
            inner.state = SessionState::GoingAway;
            inner.remote_go_away = Some(code);
            if code == GO_AWAY_NORMAL {
                debug!("Peer is going away");
            } else {
                warn!("Peer is going away with error code {}", code);
            }
        }
    }

    async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        let value = {
            let mut pings = lock(&self.pings);
            let value = pings.next_id;
            pings.next_id = pings.next_id.wrapping_add(1);
            pings.pending.insert(value, tx);
            value
        };

        let start = Instant::now();
        if let Err(e) = self.send(Frame::ping(Flags::SYN, value)) {
            lock(&self.pings).pending.remove(&value);
            return Err(e);
        }
        rx.await.map_err(|_| Error::SessionClosed)?;
        Ok(start.elapsed())
    }

    /// Close the session: GoAway, fail every stream, stop the tasks
    pub(crate) fn shutdown(&self, code: u32) {
        let streams: Vec<_> = {
            let mut inner = lock(&self.inner);
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.streams.drain().map(|(_, stream)| stream).collect()
        };

        // The writer drains queued frames after cancellation
        let _ = self.send(Frame::go_away(code));

        for stream in &streams {
            stream.terminate();
        }
        lock(&self.pings).pending.clear();
        self.cancel.cancel();

        debug!(
            "Session closed ({} streams reset, go away code {})",
            streams.len(),
            code
        );
    }

    /// Fatal failure: log, tell the peer why, and close
    fn terminate(&self, err: Error) {
        let code = match err {
            Error::Protocol(_) | Error::FlowControl { .. } => GO_AWAY_PROTOCOL_ERROR,
            _ => GO_AWAY_INTERNAL_ERROR,
        };
        if self.state() != SessionState::Closed {
            error!("Session terminated: {}", err);
        }
        self.shutdown(code);
    }
}

/// One muxer instance over one secured duplex connection
///
/// Owns the connection and all streams multiplexed on it. Dropping the
/// session closes it.
pub struct Session {
    shared: Arc<SessionShared>,

    /// Inbound streams waiting for `accept_stream()`
    incoming: tokio::sync::Mutex<mpsc::Receiver<Stream>>,

    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session over `conn`
    ///
    /// Spawns the reader, writer and (if configured) keepalive tasks, so it
    /// must be called from within a tokio runtime.
    pub fn new<T>(conn: T, role: Role, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (read_half, write_half) = tokio::io::split(conn);
        let reader = FramedRead::new(read_half, FrameCodec::new(config.max_frame_size));
        let writer = FramedWrite::new(write_half, FrameCodec::new(config.max_frame_size));
        let keepalive = config
            .keepalive_interval
            .map(|interval| (interval, config.keepalive_timeout));
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog);
        let (replies_tx, replies_rx) = mpsc::channel(MAX_PENDING_REPLIES);

        let (shared, outbound_rx) = SessionShared::new(role, config);

        tokio::spawn(reader_task(shared.clone(), reader, incoming_tx, replies_tx));
        let writer = tokio::spawn(writer_task(
            shared.clone(),
            writer,
            outbound_rx,
            replies_rx,
        ));
        if let Some((interval, timeout)) = keepalive {
            tokio::spawn(keepalive_task(shared.clone(), interval, timeout));
        }

        debug!("Session started as {:?}", role);

        Ok(Self {
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    /// Get the side of the connection this session plays
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Get the session configuration
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Get current session state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Check if session is closed
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Code of the GoAway received from the peer, if any
    pub fn remote_go_away(&self) -> Option<u32> {
        lock(&self.shared.inner).remote_go_away
    }

    /// Get the number of active streams
    pub fn stream_count(&self) -> usize {
        self.shared.stream_count()
    }

    /// Open a new stream to the peer
    ///
    /// Returns immediately; the peer learns about the stream from its first
    /// frame (or right away when `lazy_open` is off).
    pub fn open_stream(&self) -> Result<Stream> {
        self.shared.open_stream()
    }

    /// Accept an incoming stream from the peer
    ///
    /// Accepting acknowledges the stream to the peer. To reject it, call
    /// [`Stream::reset`] on the returned stream.
    ///
    /// Streams that arrived before the session closed are still handed out,
    /// so their buffered data can be read.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut incoming = self.incoming.lock().await;
        let stream = tokio::select! {
            biased;
            stream = incoming.recv() => stream,
            _ = self.shared.cancel.cancelled() => incoming.try_recv().ok(),
        };

        let stream = stream.ok_or(Error::SessionClosed)?;
        stream.acknowledge();
        Ok(stream)
    }

    /// Measure the round-trip time to the peer
    pub async fn ping(&self) -> Result<Duration> {
        self.shared.ping().await
    }

    /// Close the session and wait until the GoAway is flushed and the
    /// connection released
    pub async fn close(&self) {
        self.shared.shutdown(GO_AWAY_NORMAL);
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown(GO_AWAY_NORMAL);
    }
}

/// Background reader task
///
/// The only consumer of the connection's read side: decodes frames and
/// routes them to streams. Never waits on a stream, so one stalled stream
/// cannot starve control frames for the others.
async fn reader_task<R>(
    shared: Arc<SessionShared>,
    mut reader: FramedRead<R, FrameCodec>,
    incoming: mpsc::Sender<Stream>,
    replies: mpsc::Sender<Frame>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            next = reader.next() => {
                match next {
                    Some(Ok(frame)) => match shared.dispatch(frame, &incoming) {
                        Ok(Some(reply)) => {
                            // Waits while the writer is backed up, so a peer
                            // that never reads stops being read
                            tokio::select! {
                                sent = replies.send(reply) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                                _ = shared.cancel.cancelled() => return,
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            shared.terminate(e);
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        shared.terminate(e);
                        return;
                    }
                    None => {
                        debug!("Connection closed by peer");
                        shared.shutdown(GO_AWAY_NORMAL);
                        return;
                    }
                }
            }
            _ = shared.cancel.cancelled() => {
                trace!("Reader task cancelled");
                return;
            }
        }
    }
}

/// Background writer task
///
/// The only writer to the connection: frames from every stream and the
/// reader's replies pass through this task, so they are never interleaved
/// mid-frame.
async fn writer_task<W>(
    shared: Arc<SessionShared>,
    mut writer: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut replies: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_loop(&shared, &mut writer, &mut outbound, &mut replies).await {
        shared.terminate(e);
    }

    // Flush what was queued before close (GoAway, resets), then shut down.
    // A peer that stopped reading only gets `close_timeout` to catch up.
    let drain = async {
        while let Some(frame) = next_queued(&mut outbound, &mut replies) {
            writer.feed(frame).await?;
        }
        writer.close().await
    };
    match tokio::time::timeout(shared.config.close_timeout, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!("Closing connection: {}", e),
        Err(_) => debug!(
            "Peer not reading, dropping connection after {:?}",
            shared.config.close_timeout
        ),
    }
    drop(writer);
    trace!("Writer task finished");
}

fn next_queued(
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    replies: &mut mpsc::Receiver<Frame>,
) -> Option<Frame> {
    replies.try_recv().or_else(|_| outbound.try_recv()).ok()
}

async fn write_loop<W>(
    shared: &SessionShared,
    writer: &mut FramedWrite<W, FrameCodec>,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    replies: &mut mpsc::Receiver<Frame>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(()),
            Some(frame) = replies.recv() => frame,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };

        // A stalled connection must not hide cancellation
        tokio::select! {
            written = write_batch(writer, frame, outbound, replies) => written?,
            _ = shared.cancel.cancelled() => return Ok(()),
        }
    }
}

/// Write `first` plus everything already queued, then flush once
async fn write_batch<W>(
    writer: &mut FramedWrite<W, FrameCodec>,
    first: Frame,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    replies: &mut mpsc::Receiver<Frame>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.feed(first).await?;
    while let Some(frame) = next_queued(outbound, replies) {
        writer.feed(frame).await?;
    }
    writer.flush().await
}

/// Background keepalive task
///
/// A ping left unanswered past `timeout` is fatal to the session.
async fn keepalive_task(shared: Arc<SessionShared>, interval: Duration, timeout: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.cancel.cancelled() => return,
        }

        match tokio::time::timeout(timeout, shared.ping()).await {
            Ok(Ok(rtt)) => trace!("Keepalive rtt={:?}", rtt),
            Ok(Err(_)) => return,
            Err(_) => {
                shared.terminate(Error::KeepaliveTimeout);
                return;
            }
        }
    }
}
