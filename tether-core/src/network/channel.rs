//! Multiplexed physical channel.
//!
//! One framed link carries any number of logical streams. A background
//! reader task demultiplexes inbound frames by stream id into per-stream
//! queues; a background writer task drains a shared outbound queue onto
//! the socket; a third task emits heartbeats.
//!
//! ```text
//!             ┌──────────────┐  Frame   ┌──────────────┐
//! StreamSender├──► writer q ─┼────────► │ writer task  ├──► socket
//!             └──────────────┘          └──────────────┘
//!                                       ┌──────────────┐
//! StreamReceiver ◄── stream q ◄─────────┤ reader task  │◄── socket
//!                                       └──────────────┘
//! ```
//!
//! Stream queues are bounded: when a consumer falls behind, the reader
//! task waits for room before reading further, which in turn stalls the
//! peer's writer through the socket.
//!
//! Any read or write failure closes the whole channel: the cancellation
//! token fires and every per-stream queue is dropped, so each open stream
//! observes [`TetherError::ChannelClosed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::FrameCodec;
use crate::error::TetherError;
use crate::message::{FrameKind, Method};
use crate::packet::{Frame, encode_message};
use crate::protocol::call::{CallMetadata, Status};

/// Interval between heartbeat frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A link with no inbound traffic for this long is considered dead.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

const WRITE_QUEUE_DEPTH: usize = 256;

/// Inbound frames buffered per stream before the reader waits.
pub const STREAM_QUEUE_DEPTH: usize = 64;

/// State shared between the handle, its streams and the background tasks.
struct Link {
    writer: mpsc::Sender<Frame>,
    streams: DashMap<u64, mpsc::Sender<Frame>>,
    closed: CancellationToken,
    peer: String,
}

impl Link {
    async fn send(&self, frame: Frame) -> Result<(), TetherError> {
        if self.closed.is_cancelled() {
            return Err(TetherError::ChannelClosed);
        }
        self.writer.send(frame).await?;
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.cancel();
        self.streams.clear();
    }
}

struct ChannelInner {
    link: Arc<Link>,
    next_stream_id: AtomicU64,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.link.shutdown();
    }
}

/// Handle to one physical link. Cheap to clone; the link closes when the
/// last handle is dropped or [`Channel::close`] is called.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// A stream opened by the remote side.
#[derive(Debug)]
pub struct IncomingCall {
    pub method: Method,
    pub metadata: CallMetadata,
    pub stream: CallStream,
}

impl Channel {
    /// Wrap the calling side of a link. Opened streams use odd ids.
    pub fn client<IO>(io: IO, peer: impl Into<String>) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(io, peer.into(), None, 1)
    }

    /// Wrap the serving side of a link; streams the peer opens arrive on
    /// the returned receiver.
    pub fn server<IO>(io: IO, peer: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<IncomingCall>)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let channel = Self::spawn(io, peer.into(), Some(incoming_tx), 2);
        (channel, incoming_rx)
    }

    fn spawn<IO>(
        io: IO,
        peer: String,
        incoming: Option<mpsc::UnboundedSender<IncomingCall>>,
        first_stream_id: u64,
    ) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut net_writer, mut net_reader) = Framed::new(io, FrameCodec::new()).split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);

        let link = Arc::new(Link {
            writer: writer_tx,
            streams: DashMap::new(),
            closed: CancellationToken::new(),
            peer,
        });

        // Writer task: queue -> network
        let writer_link = link.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_link.closed.cancelled() => break,
                    frame = writer_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = net_writer.send(frame).await {
                            warn!(peer = %writer_link.peer, error = %e, "channel write failed");
                            break;
                        }
                    }
                }
            }
            writer_link.shutdown();
            let _ = net_writer.close().await;
        });

        // Reader task: network -> stream queues
        let reader_link = link.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_link.closed.cancelled() => break,
                    next = tokio::time::timeout(HEARTBEAT_TIMEOUT, net_reader.next()) => next,
                };
                match next {
                    Err(_) => {
                        warn!(peer = %reader_link.peer, "no traffic within {:?}, dropping link", HEARTBEAT_TIMEOUT);
                        break;
                    }
                    Ok(None) => {
                        debug!(peer = %reader_link.peer, "peer closed the link");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(peer = %reader_link.peer, error = %e, "channel read failed");
                        break;
                    }
                    Ok(Some(Ok(frame))) => dispatch(&reader_link, frame, incoming.as_ref()).await,
                }
            }
            reader_link.shutdown();
        });

        // Heartbeat
        let heartbeat_link = link.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = heartbeat_link.closed.cancelled() => break,
                    _ = interval.tick() => {
                        if heartbeat_link.writer.send(Frame::heartbeat()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            inner: Arc::new(ChannelInner {
                link,
                next_stream_id: AtomicU64::new(first_stream_id),
            }),
        }
    }

    /// Open a logical stream for `method`.
    pub async fn open(&self, method: Method, metadata: &CallMetadata) -> Result<CallStream, TetherError> {
        let link = &self.inner.link;
        if link.closed.is_cancelled() {
            return Err(TetherError::ChannelClosed);
        }
        let id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        link.streams.insert(id, tx);

        let open = Frame::open(id, method, metadata)?;
        if let Err(e) = link.send(open).await {
            link.streams.remove(&id);
            return Err(e);
        }
        trace!(peer = %link.peer, stream_id = id, %method, "stream opened");
        Ok(CallStream::new(id, link.clone(), rx))
    }

    pub fn peer(&self) -> &str {
        &self.inner.link.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.link.closed.is_cancelled()
    }

    /// Resolves once the link is gone.
    pub async fn closed(&self) {
        self.inner.link.closed.cancelled().await
    }

    /// Number of streams with a live inbound queue.
    pub fn active_streams(&self) -> usize {
        self.inner.link.streams.len()
    }

    /// Tear the link down; every open stream observes "channel closed".
    pub fn close(&self) {
        self.inner.link.shutdown();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.inner.link.peer)
            .field("closed", &self.is_closed())
            .field("streams", &self.active_streams())
            .finish()
    }
}

async fn dispatch(link: &Arc<Link>, frame: Frame, incoming: Option<&mpsc::UnboundedSender<IncomingCall>>) {
    let id = frame.stream_id();
    match frame.kind() {
        FrameKind::Heartbeat => trace!(peer = %link.peer, "heartbeat"),
        FrameKind::Open => accept_stream(link, frame, incoming).await,
        FrameKind::Status | FrameKind::Reset => {
            if let Some((_, tx)) = link.streams.remove(&id) {
                deliver(link, id, &tx, frame).await;
            }
        }
        FrameKind::Data | FrameKind::End => {
            // Clone out of the map so no shard lock is held across the await.
            let tx = link.streams.get(&id).map(|entry| entry.value().clone());
            match tx {
                Some(tx) => deliver(link, id, &tx, frame).await,
                None => trace!(peer = %link.peer, stream_id = id, "frame for unknown stream dropped"),
            }
        }
    }
}

/// Queue `frame` for its stream, waiting while the queue is full.
async fn deliver(link: &Link, id: u64, tx: &mpsc::Sender<Frame>, frame: Frame) {
    tokio::select! {
        _ = link.closed.cancelled() => {}
        sent = tx.send(frame) => {
            if sent.is_err() {
                trace!(peer = %link.peer, stream_id = id, "stream receiver gone");
                link.streams.remove(&id);
            }
        }
    }
}

async fn accept_stream(link: &Arc<Link>, frame: Frame, incoming: Option<&mpsc::UnboundedSender<IncomingCall>>) {
    let id = frame.stream_id();
    let Some(incoming) = incoming else {
        warn!(peer = %link.peer, stream_id = id, "peer tried to open a stream on a client link");
        let _ = link.send(Frame::reset(id)).await;
        return;
    };
    if link.streams.contains_key(&id) {
        warn!(peer = %link.peer, stream_id = id, "duplicate stream id");
        let _ = link.send(Frame::reset(id)).await;
        return;
    }

    let method = match frame.method() {
        Ok(method) => method,
        Err(e) => {
            debug!(peer = %link.peer, stream_id = id, error = %e, "unknown method");
            reject(link, id, Status::unimplemented(e.to_string())).await;
            return;
        }
    };
    let metadata: CallMetadata = match bincode::deserialize(frame.payload()) {
        Ok(metadata) => metadata,
        Err(e) => {
            reject(link, id, Status::invalid_argument(format!("bad call metadata: {e}"))).await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
    link.streams.insert(id, tx);
    let stream = CallStream::new(id, link.clone(), rx);
    if incoming.send(IncomingCall { method, metadata, stream }).is_err() {
        debug!(peer = %link.peer, stream_id = id, "no acceptor for incoming stream");
    }
}

async fn reject(link: &Link, id: u64, status: Status) {
    if let Ok(frame) = Frame::status(id, &status) {
        let _ = link.send(frame).await;
    }
}

// ── Streams ──────────────────────────────────────────────────────

/// Both halves of one logical stream.
#[derive(Debug)]
pub struct CallStream {
    pub sender: StreamSender,
    pub receiver: StreamReceiver,
}

impl CallStream {
    fn new(id: u64, link: Arc<Link>, rx: mpsc::Receiver<Frame>) -> Self {
        Self {
            sender: StreamSender {
                id,
                link: link.clone(),
            },
            receiver: StreamReceiver {
                id,
                link,
                rx,
                remote_done: false,
                terminated: false,
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.sender.id
    }

    pub fn split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

/// Outbound half of a stream. Clones share the same stream.
#[derive(Clone)]
pub struct StreamSender {
    id: u64,
    link: Arc<Link>,
}

impl StreamSender {
    pub fn stream_id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.link.closed.is_cancelled()
    }

    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), TetherError> {
        self.send_encoded(encode_message(message)?).await
    }

    /// Send `message` and half-close in the same frame.
    pub async fn send_last<T: Serialize>(&self, message: &T) -> Result<(), TetherError> {
        self.link.send(Frame::message(self.id, message, true)?).await
    }

    /// Send a payload that was already encoded with [`encode_message`].
    pub async fn send_encoded(&self, payload: Bytes) -> Result<(), TetherError> {
        self.link.send(Frame::data(self.id, payload, false)?).await
    }

    /// Half-close: no more messages from this side.
    pub async fn close_send(&self) -> Result<(), TetherError> {
        self.link.send(Frame::end(self.id)).await
    }

    /// Terminate the stream with a status. Serving side only.
    pub async fn finish(&self, status: Status) -> Result<(), TetherError> {
        self.link.streams.remove(&self.id);
        self.link.send(Frame::status(self.id, &status)?).await
    }

    /// Abandon the stream.
    pub async fn reset(&self) -> Result<(), TetherError> {
        self.link.streams.remove(&self.id);
        self.link.send(Frame::reset(self.id)).await
    }
}

impl std::fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender").field("id", &self.id).finish()
    }
}

/// Inbound half of a stream.
pub struct StreamReceiver {
    id: u64,
    link: Arc<Link>,
    rx: mpsc::Receiver<Frame>,
    /// The peer half-closed.
    remote_done: bool,
    /// A Status or Reset arrived, or the channel went away.
    terminated: bool,
}

impl StreamReceiver {
    pub fn stream_id(&self) -> u64 {
        self.id
    }

    /// Frames received but not yet consumed.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Next raw payload.
    ///
    /// `Ok(None)` marks a clean end: the peer half-closed or finished with
    /// an OK status. A non-OK status surfaces as [`TetherError::Status`], a
    /// reset as [`TetherError::Cancelled`], and a dead link as
    /// [`TetherError::ChannelClosed`].
    pub async fn recv_payload(&mut self) -> Result<Option<Bytes>, TetherError> {
        if self.remote_done {
            return Ok(None);
        }
        let Some(frame) = self.rx.recv().await else {
            self.terminated = true;
            self.remote_done = true;
            return Err(TetherError::ChannelClosed);
        };
        match frame.kind() {
            FrameKind::Data => {
                if frame.is_end_stream() {
                    self.remote_done = true;
                }
                Ok(Some(frame.into_payload()))
            }
            FrameKind::End => {
                self.remote_done = true;
                Ok(None)
            }
            FrameKind::Status => {
                self.terminated = true;
                self.remote_done = true;
                let status: Status = bincode::deserialize(frame.payload())?;
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(TetherError::Status(status))
                }
            }
            FrameKind::Reset => {
                self.terminated = true;
                self.remote_done = true;
                Err(TetherError::Cancelled)
            }
            FrameKind::Open | FrameKind::Heartbeat => {
                Err(TetherError::ProtocolViolation("control frame routed to a stream"))
            }
        }
    }

    /// Next decoded message.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TetherError> {
        match self.recv_payload().await? {
            Some(payload) => Ok(Some(bincode::deserialize(&payload)?)),
            None => Ok(None),
        }
    }

    /// Wait until the peer stops sending, discarding anything it still
    /// sends. Used by push subscriptions to notice a departed client.
    pub async fn closed(&mut self) {
        loop {
            match self.recv_payload().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return,
            }
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.link.streams.remove(&self.id);
        if !self.terminated && !self.remote_done && !self.link.closed.is_cancelled() {
            let _ = self.link.writer.try_send(Frame::reset(self.id));
        }
    }
}

impl std::fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("id", &self.id)
            .field("remote_done", &self.remote_done)
            .field("terminated", &self.terminated)
            .finish()
    }
}
