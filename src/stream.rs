use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::FlowController;
use crate::protocol::{Flags, Frame, FrameType};
use crate::session::{lock, SessionShared};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace, warn};

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Opened locally, SYN not sent yet
    Idle,
    /// SYN sent, waiting for the peer's ACK
    SynSent,
    /// SYN received, not yet accepted by the application
    SynReceived,
    /// Both directions open
    Established,
    /// FIN sent, peer may still send
    LocalClosed,
    /// FIN received, we may still send
    RemoteClosed,
    /// Both directions closed, or reset
    Closed,
}

/// Who tore the stream down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetCause {
    Local,
    Remote,
    Session,
}

impl ResetCause {
    fn error(self) -> Error {
        match self {
            ResetCause::Session => Error::SessionClosed,
            ResetCause::Local | ResetCause::Remote => Error::StreamReset,
        }
    }
}

struct StreamInner {
    /// Open handshake progress; one of Idle, SynSent, SynReceived, Established
    open: StreamState,

    /// We sent FIN
    local_fin: bool,

    /// Peer sent FIN: once `recv_buf` drains, reads return EOF
    remote_fin: bool,

    reset: Option<ResetCause>,

    flow: FlowController,

    /// Data received from the peer, not yet read
    recv_buf: BytesMut,

    read_waker: Option<Waker>,

    write_wakers: Vec<Waker>,
}

impl StreamInner {
    fn state(&self) -> StreamState {
        if self.is_closed() {
            StreamState::Closed
        } else if self.local_fin {
            StreamState::LocalClosed
        } else if self.remote_fin {
            StreamState::RemoteClosed
        } else {
            self.open
        }
    }

    fn is_closed(&self) -> bool {
        self.reset.is_some() || (self.local_fin && self.remote_fin)
    }

    /// Flags owed to the peer on our next outbound frame
    fn open_flags(&mut self) -> Flags {
        match self.open {
            StreamState::Idle => {
                self.open = StreamState::SynSent;
                Flags::SYN
            }
            StreamState::SynReceived => {
                self.open = StreamState::Established;
                Flags::ACK
            }
            _ => Flags::NONE,
        }
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writers(&mut self) {
        for waker in self.write_wakers.drain(..) {
            waker.wake();
        }
    }

    fn register_writer(&mut self, waker: &Waker) {
        if !self.write_wakers.iter().any(|w| w.will_wake(waker)) {
            self.write_wakers.push(waker.clone());
        }
    }

    /// Data already received survives a session teardown; only a reset
    /// discards it
    fn tear_down(&mut self, cause: ResetCause) {
        self.reset = Some(cause);
        if cause != ResetCause::Session {
            self.recv_buf.clear();
        }
        self.wake_reader();
        self.wake_writers();
    }
}

/// Per-stream state owned by the session's stream table
pub(crate) struct StreamShared {
    id: u32,
    split_send_size: usize,
    inner: Mutex<StreamInner>,
}

impl StreamShared {
    pub(crate) fn new(id: u32, open: StreamState, config: &Config) -> Self {
        Self {
            id,
            split_send_size: config.split_send_size,
            inner: Mutex::new(StreamInner {
                open,
                local_fin: false,
                remote_fin: false,
                reset: None,
                flow: FlowController::new(config.initial_window),
                recv_buf: BytesMut::new(),
                read_waker: None,
                write_wakers: Vec::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Apply an inbound Data or WindowUpdate frame
    ///
    /// Returns `true` once the stream is fully closed and should leave the
    /// stream table. Errors are fatal to the session.
    pub(crate) fn on_frame(&self, frame: &Frame) -> Result<bool> {
        let mut inner = lock(&self.inner);
        if inner.reset.is_some() {
            return Ok(true);
        }

        let flags = frame.flags();
        if flags.contains(Flags::ACK) && inner.open == StreamState::SynSent {
            inner.open = StreamState::Established;
            trace!("Stream {} established", self.id);
        }

        match frame.frame_type() {
            FrameType::Data if !frame.payload.is_empty() => {
                inner
                    .flow
                    .record_received(self.id, frame.payload.len() as u32)?;
                if inner.remote_fin {
                    warn!(
                        "Stream {}: dropping {} bytes received after FIN",
                        self.id,
                        frame.payload.len()
                    );
                } else {
                    inner.recv_buf.extend_from_slice(&frame.payload);
                    inner.wake_reader();
                }
            }
            FrameType::WindowUpdate if frame.header.length > 0 => {
                inner.flow.credit_send(self.id, frame.header.length)?;
                trace!(
                    "Stream {}: send window now {} (sent {}, credited {})",
                    self.id,
                    inner.flow.send_window(),
                    inner.flow.bytes_sent(),
                    inner.flow.bytes_credited()
                );
                inner.wake_writers();
            }
            _ => {}
        }

        if flags.contains(Flags::RST) {
            debug!("Stream {} reset by peer", self.id);
            inner.tear_down(ResetCause::Remote);
            return Ok(true);
        }

        if flags.contains(Flags::FIN) && !inner.remote_fin {
            debug!("Stream {}: peer finished sending", self.id);
            inner.remote_fin = true;
            inner.wake_reader();
        }

        Ok(inner.is_closed())
    }

    /// Drop a stream the peer has not been told about yet, without
    /// sending anything
    pub(crate) fn abort(&self) {
        let mut inner = lock(&self.inner);
        if inner.reset.is_none() {
            inner.tear_down(ResetCause::Local);
        }
    }

    /// Session is going down: fail every pending and future write.
    /// Reads still drain what was already buffered.
    pub(crate) fn terminate(&self) {
        let mut inner = lock(&self.inner);
        if inner.reset.is_none() {
            inner.tear_down(ResetCause::Session);
        }
    }
}

/// Individual bidirectional stream
///
/// A cheap handle: clones share the same stream. The session owns the
/// stream state; the handle reaches its session only through a weak
/// reference, so holding a `Stream` never keeps a session alive.
///
/// Implements AsyncRead + AsyncWrite for standard Rust async I/O.
/// One outstanding reader per stream is supported.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Weak<SessionShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Weak<SessionShared>) -> Self {
        Self { shared, session }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Get current stream state
    pub fn state(&self) -> StreamState {
        lock(&self.shared.inner).state()
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.inner).is_closed()
    }

    /// Credit currently available for sending
    pub fn send_window(&self) -> u32 {
        lock(&self.shared.inner).flow.send_window()
    }

    fn send(&self, frame: Frame) -> Result<()> {
        let session = self.session.upgrade().ok_or(Error::SessionClosed)?;
        session.send(frame)
    }

    fn detach(&self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_stream(self.shared.id);
        }
    }

    /// Announce the stream without waiting for the first write
    pub(crate) fn send_syn(&self) -> Result<()> {
        let mut inner = lock(&self.shared.inner);
        if inner.open != StreamState::Idle {
            return Ok(());
        }
        let flags = inner.open_flags();
        self.send(Frame::window_update(self.shared.id, flags, 0))
    }

    /// Acknowledge an inbound stream handed to the application
    pub(crate) fn acknowledge(&self) {
        let mut inner = lock(&self.shared.inner);
        if inner.open != StreamState::SynReceived || inner.reset.is_some() {
            return;
        }
        let flags = inner.open_flags();
        if let Err(e) = self.send(Frame::window_update(self.shared.id, flags, 0)) {
            trace!("Stream {}: ACK not sent: {}", self.shared.id, e);
        }
    }

    fn poll_read_buf(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize>> {
        let mut inner = lock(&self.shared.inner);

        match inner.reset {
            Some(ResetCause::Session) | None => {}
            Some(cause) => return Poll::Ready(Err(cause.error())),
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if !inner.recv_buf.is_empty() {
            let n = buf.len().min(inner.recv_buf.len());
            buf[..n].copy_from_slice(&inner.recv_buf[..n]);
            inner.recv_buf.advance(n);

            // Hand credit back once enough of the buffer has drained
            if !inner.remote_fin && inner.reset.is_none() {
                let buffered = inner.recv_buf.len();
                if let Some(delta) = inner.flow.window_update(buffered) {
                    let flags = inner.open_flags();
                    trace!("Stream {}: window update +{}", self.shared.id, delta);
                    if let Err(e) = self.send(Frame::window_update(self.shared.id, flags, delta)) {
                        trace!("Stream {}: window update not sent: {}", self.shared.id, e);
                    }
                }
            }

            return Poll::Ready(Ok(n));
        }

        if inner.remote_fin {
            // Peer sent FIN and recv_buf is empty → EOF
            return Poll::Ready(Ok(0));
        }

        if let Some(cause) = inner.reset {
            return Poll::Ready(Err(cause.error()));
        }

        if self.session.strong_count() == 0 {
            return Poll::Ready(Err(Error::SessionClosed));
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_write_buf(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let mut inner = lock(&self.shared.inner);

        if let Some(cause) = inner.reset {
            return Poll::Ready(Err(cause.error()));
        }
        if inner.local_fin {
            return Poll::Ready(Err(Error::StreamClosedForWrites));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let session = match self.session.upgrade() {
            Some(session) => session,
            None => return Poll::Ready(Err(Error::SessionClosed)),
        };

        let want = buf.len().min(self.shared.split_send_size);
        let granted = inner.flow.reserve_send(want) as usize;
        if granted == 0 {
            trace!("Stream {}: send window exhausted, waiting", self.shared.id);
            inner.register_writer(cx.waker());
            return Poll::Pending;
        }

        // Queued under the stream lock so concurrent writers keep their order
        let flags = inner.open_flags();
        let frame = Frame::data(self.shared.id, flags, Bytes::copy_from_slice(&buf[..granted]));
        if session.send(frame).is_err() {
            return Poll::Ready(Err(Error::SessionClosed));
        }
        trace!(
            "Stream {}: queued {} bytes, window now {} (sent {})",
            self.shared.id,
            granted,
            inner.flow.send_window(),
            inner.flow.bytes_sent()
        );
        Poll::Ready(Ok(granted))
    }

    /// Read buffered data into `buf`, waiting if none is available
    ///
    /// Returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read_buf(cx, buf)).await
    }

    /// Queue all of `data`, waiting for window credit as needed
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = poll_fn(|cx| self.poll_write_buf(cx, &data[written..])).await?;
            written += n;
        }
        Ok(())
    }

    /// Graceful close (FIN) of our sending direction
    pub fn close(&self) -> Result<()> {
        let closed = {
            let mut inner = lock(&self.shared.inner);
            if let Some(cause) = inner.reset {
                return Err(cause.error());
            }
            if inner.local_fin {
                return Ok(());
            }

            let flags = inner.open_flags() | Flags::FIN;
            self.send(Frame::data(self.shared.id, flags, Bytes::new()))?;
            inner.local_fin = true;
            inner.wake_writers();
            inner.is_closed()
        };

        debug!("Stream {} closed for writes", self.shared.id);
        if closed {
            self.detach();
        }
        Ok(())
    }

    /// Immediate close (RST); discards unread data and never blocks
    pub fn reset(&self) {
        {
            let mut inner = lock(&self.shared.inner);
            if inner.is_closed() {
                return;
            }

            // The peer never heard of a stream that is still Idle
            if inner.open != StreamState::Idle {
                let flags = inner.open_flags() | Flags::RST;
                if let Err(e) = self.send(Frame::window_update(self.shared.id, flags, 0)) {
                    trace!("Stream {}: RST not sent: {}", self.shared.id, e);
                }
            }
            inner.tear_down(ResetCause::Local);
        }

        debug!("Stream {} reset locally", self.shared.id);
        self.detach();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let dst = buf.initialize_unfilled();
        match ready!(self.poll_read_buf(cx, dst)) {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e.into_io())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_buf(cx, buf).map_err(Error::into_io)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer as soon as they are accepted
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close().map_err(Error::into_io))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GO_AWAY_NORMAL;
    use crate::session::{Role, SessionShared};
    use tokio::sync::mpsc;

    fn remote_stream(
        config: &Config,
    ) -> (Arc<SessionShared>, Stream, mpsc::UnboundedReceiver<Frame>) {
        let (session, rx) = SessionShared::detached(Role::Responder, config.clone());
        let shared = Arc::new(StreamShared::new(1, StreamState::SynReceived, config));
        session.insert_stream(shared.clone());
        let stream = Stream::new(shared, Arc::downgrade(&session));
        (session, stream, rx)
    }

    #[tokio::test]
    async fn test_stream_creation() {
        let (_session, stream, _rx) = remote_stream(&Config::default());
        assert_eq!(stream.id(), 1);
        assert_eq!(stream.state(), StreamState::SynReceived);
        assert_eq!(stream.send_window(), 256 * 1024);
    }

    #[tokio::test]
    async fn test_first_frame_carries_ack() {
        let (_session, stream, mut rx) = remote_stream(&Config::default());

        stream.write(b"hi").await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type(), FrameType::Data);
        assert!(frame.flags().contains(Flags::ACK));
        assert_eq!(&frame.payload[..], b"hi");
        assert_eq!(stream.state(), StreamState::Established);

        stream.write(b"again").await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.flags().is_empty());
    }

    #[tokio::test]
    async fn test_stream_data_delivery() {
        let (_session, stream, _rx) = remote_stream(&Config::default());

        let data = Frame::data(1, Flags::NONE, Bytes::from_static(b"hello"));
        assert!(!stream.shared.on_frame(&data).unwrap());

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_fin_drains_then_eof() {
        let (_session, stream, _rx) = remote_stream(&Config::default());

        let data = Frame::data(1, Flags::FIN, Bytes::from_static(b"bye"));
        stream.shared.on_frame(&data).unwrap();
        assert_eq!(stream.state(), StreamState::RemoteClosed);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_half_close_then_full_close() {
        let (session, stream, mut rx) = remote_stream(&Config::default());

        stream.close().unwrap();
        assert_eq!(stream.state(), StreamState::LocalClosed);
        let fin = rx.recv().await.unwrap();
        assert!(fin.flags().contains(Flags::FIN));
        assert!(fin.flags().contains(Flags::ACK));
        assert!(matches!(
            stream.write(b"late").await,
            Err(Error::StreamClosedForWrites)
        ));

        let peer_fin = Frame::data(1, Flags::FIN, Bytes::new());
        assert!(stream.shared.on_frame(&peer_fin).unwrap());
        assert_eq!(stream.state(), StreamState::Closed);
        drop(session);
    }

    #[tokio::test]
    async fn test_stream_reset_on_rst() {
        let (_session, stream, _rx) = remote_stream(&Config::default());

        stream
            .shared
            .on_frame(&Frame::data(1, Flags::NONE, Bytes::from_static(b"unread")))
            .unwrap();
        let rst = Frame::window_update(1, Flags::RST, 0);
        assert!(stream.shared.on_frame(&rst).unwrap());
        assert_eq!(stream.state(), StreamState::Closed);

        // Buffered data is discarded
        let mut buf = [0u8; 16];
        assert!(matches!(stream.read(&mut buf).await, Err(Error::StreamReset)));
    }

    #[tokio::test]
    async fn test_local_reset_sends_rst() {
        let (session, stream, mut rx) = remote_stream(&Config::default());
        assert_eq!(session.stream_count(), 1);

        stream.reset();
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(session.stream_count(), 0);

        let frame = rx.recv().await.unwrap();
        assert!(frame.flags().contains(Flags::RST));
        assert_eq!(frame.stream_id(), 1);
        assert!(matches!(stream.write(b"x").await, Err(Error::StreamReset)));
    }

    #[tokio::test]
    async fn test_receive_window_violation() {
        let config = Config::default().with_initial_window(4).with_split_send_size(4);
        let (_session, stream, _rx) = remote_stream(&config);

        let data = Frame::data(1, Flags::NONE, Bytes::from_static(b"12345"));
        assert!(matches!(
            stream.shared.on_frame(&data),
            Err(Error::FlowControl { stream_id: 1, len: 5, window: 4 })
        ));
    }

    #[tokio::test]
    async fn test_write_waits_for_window_update() {
        let config = Config::default().with_initial_window(4).with_split_send_size(4);
        let (_session, stream, mut rx) = remote_stream(&config);

        let writer = tokio::spawn({
            let stream = stream.clone();
            async move { stream.write(b"abcdef").await }
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(&first.payload[..], b"abcd");
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        stream
            .shared
            .on_frame(&Frame::window_update(1, Flags::NONE, 2))
            .unwrap();
        writer.await.unwrap().unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(&second.payload[..], b"ef");
        assert_eq!(stream.send_window(), 0);
    }

    #[tokio::test]
    async fn test_terminate_reports_session_closed() {
        let (session, stream, _rx) = remote_stream(&Config::default());

        let reader = tokio::spawn({
            let stream = stream.clone();
            async move {
                let mut buf = [0u8; 8];
                stream.read(&mut buf).await
            }
        });
        tokio::task::yield_now().await;

        session.shutdown(GO_AWAY_NORMAL);
        assert!(matches!(reader.await.unwrap(), Err(Error::SessionClosed)));
        assert!(matches!(stream.write(b"x").await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_buffered_data_survives_session_close() {
        let (session, stream, _rx) = remote_stream(&Config::default());

        stream
            .shared
            .on_frame(&Frame::data(1, Flags::FIN, Bytes::from_static(b"hello")))
            .unwrap();
        session.shutdown(GO_AWAY_NORMAL);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(stream.write(b"x").await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_buffered_data_then_session_closed_without_fin() {
        let (session, stream, _rx) = remote_stream(&Config::default());

        stream
            .shared
            .on_frame(&Frame::data(1, Flags::NONE, Bytes::from_static(b"part")))
            .unwrap();
        session.shutdown(GO_AWAY_NORMAL);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        assert!(matches!(stream.read(&mut buf).await, Err(Error::SessionClosed)));
    }
}
