//! Client session.
//!
//! One logical connection over a pooled channel. On connect it opens four
//! long-lived streams:
//!
//! | Stream           | Direction          | Pump                         |
//! |------------------|--------------------|------------------------------|
//! | `JsonStream`     | request / ack      | resolves the pending table   |
//! | `JsonDuplex`     | both, unacked      | raises `JsonReceived`        |
//! | `SubscribeFiles` | server push        | reassembles broadcast files  |
//! | `SubscribeBytes` | server push        | raises `BytesReceived`       |
//!
//! Unary calls (upload, download, list, screenshot, byte send) open their
//! own short-lived streams on the same channel.
//!
//! Whatever ends a pump, and any transport failure on a send, raises
//! [`SessionEvent::ConnectionLost`] exactly once and fails every pending
//! request. The session never retries; that is the supervisor's job.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::chunk::{self, Assembled, ChunkAssembler, ChunkReader};
use tether_core::protocol::DEFAULT_CHUNK_SIZE;
use tether_core::{
    AppConfig, ByteAck, ByteMessage, CallMetadata, Channel, ChannelPool, DownloadRequest,
    EndpointIdentity, JsonAck, JsonEnvelope, ListRequest, ListResponse, Method, ScreenshotRequest,
    Secret, StreamReceiver, StreamSender, SubscribeRequest, TetherError, TransferChunk, UploadStatus,
};

use crate::events::{Direction, SessionEvent};
use crate::pending::{PendingAck, PendingRequests};

/// How long the post-connect probe may take before the link is
/// considered broken.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Metadata header naming the client in server logs.
pub const CLIENT_HEADER: &str = "x-tether-client";

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_name: String,
    pub secret: Option<Secret>,
    pub chunk_size: usize,
    /// Where broadcast files are written. `None` keeps them in memory only.
    pub download_dir: Option<PathBuf>,
    /// Delete files written to `download_dir` when the session closes.
    pub auto_delete_received_files: bool,
    pub probe_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_name: "tether-client".into(),
            secret: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            download_dir: None,
            auto_delete_received_files: false,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig, secret: Option<Secret>) -> Self {
        Self {
            secret,
            chunk_size: config.chunk_size(),
            download_dir: Some(config.download_dir()),
            auto_delete_received_files: config.auto_delete_received_files,
            ..Self::default()
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }
}

// ── Shared pump state ────────────────────────────────────────────

/// State the pumps share with the session handle.
struct Shared {
    pending: PendingRequests,
    events: mpsc::UnboundedSender<SessionEvent>,
    lost: AtomicBool,
    download_dir: Option<PathBuf>,
    received_files: Mutex<Vec<PathBuf>>,
    track_received: bool,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn progress(&self, direction: Direction, name: &str, percent: u8) {
        self.emit(SessionEvent::Progress {
            direction,
            name: name.to_string(),
            percent,
        });
    }

    /// Raise `ConnectionLost` unless it was already raised or the session
    /// was closed on purpose.
    fn connection_lost(&self, reason: impl Into<String>) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        let failed = self.pending.fail_all();
        warn!(%reason, failed, "connection lost");
        self.emit(SessionEvent::ConnectionLost { reason });
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn received(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        self.received_files.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Write a completed broadcast file to the download directory.
    async fn materialize(&self, name: String, data: Bytes) {
        let size = data.len() as u64;
        let Some(dir) = &self.download_dir else {
            self.emit(SessionEvent::FileReceived {
                name,
                size,
                saved_to: None,
            });
            return;
        };
        let Some(file_name) = bare_name(&name) else {
            self.emit(SessionEvent::FileFailed {
                error: format!("refusing to save {name:?}"),
                name,
            });
            return;
        };
        let target = dir.join(file_name);
        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&target, &data).await
        }
        .await;
        match written {
            Ok(()) => {
                info!(%name, size, path = %target.display(), "broadcast file saved");
                if self.track_received {
                    self.received().push(target.clone());
                }
                self.emit(SessionEvent::FileReceived {
                    name,
                    size,
                    saved_to: Some(target),
                });
            }
            Err(e) => {
                warn!(%name, error = %e, "could not save broadcast file");
                self.emit(SessionEvent::FileFailed {
                    name,
                    error: e.to_string(),
                });
            }
        }
    }

    fn delete_received(&self) {
        for path in self.received().drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "deleted received file"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not delete received file"),
            }
        }
    }
}

fn bare_name(name: &str) -> Option<String> {
    let unified = name.replace('\\', "/");
    match Path::new(&unified).components().next_back() {
        Some(std::path::Component::Normal(part)) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }
}

// ── Session ──────────────────────────────────────────────────────

pub struct ClientSession {
    endpoint: EndpointIdentity,
    pool: Arc<ChannelPool>,
    channel: Channel,
    metadata: CallMetadata,
    options: SessionOptions,
    json: StreamSender,
    duplex: StreamSender,
    shared: Arc<Shared>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

struct OpenedStreams {
    json: (StreamSender, StreamReceiver),
    duplex: (StreamSender, StreamReceiver),
    files: StreamReceiver,
    bytes: StreamReceiver,
}

async fn open_streams(channel: &Channel, metadata: &CallMetadata, name: &str) -> Result<OpenedStreams, TetherError> {
    let json = channel.open(Method::JsonStream, metadata).await?.split();
    let duplex = channel.open(Method::JsonDuplex, metadata).await?.split();

    let subscribe = SubscribeRequest {
        client_name: name.to_string(),
    };
    let (files_tx, files) = channel.open(Method::SubscribeFiles, metadata).await?.split();
    files_tx.send(&subscribe).await?;
    let (bytes_tx, bytes) = channel.open(Method::SubscribeBytes, metadata).await?.split();
    bytes_tx.send(&subscribe).await?;

    Ok(OpenedStreams {
        json,
        duplex,
        files,
        bytes,
    })
}

impl ClientSession {
    /// Open a session to `endpoint` over a channel from `pool`.
    ///
    /// Fails only if no channel or stream could be opened. A failed
    /// handshake probe is reported as a `ConnectionLost` event instead.
    pub async fn connect(
        pool: Arc<ChannelPool>,
        endpoint: EndpointIdentity,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), TetherError> {
        let channel = pool.get_or_create(&endpoint).await?;

        let mut metadata = CallMetadata::new().with(CLIENT_HEADER, options.client_name.clone());
        if let Some(secret) = &options.secret {
            secret.authorize(&mut metadata);
        }

        let streams = match open_streams(&channel, &metadata, &options.client_name).await {
            Ok(streams) => streams,
            Err(e) => {
                pool.release(&endpoint);
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: PendingRequests::new(),
            events: events_tx,
            lost: AtomicBool::new(false),
            download_dir: options.download_dir.clone(),
            received_files: Mutex::new(Vec::new()),
            track_received: options.auto_delete_received_files,
        });

        let OpenedStreams {
            json: (json, json_rx),
            duplex: (duplex, duplex_rx),
            files,
            bytes,
        } = streams;
        let pumps = vec![
            tokio::spawn(pump_acks(json_rx, shared.clone())),
            tokio::spawn(pump_duplex(duplex_rx, shared.clone())),
            tokio::spawn(pump_files(files, shared.clone())),
            tokio::spawn(pump_bytes(bytes, shared.clone())),
        ];

        let session = Self {
            endpoint,
            pool,
            channel,
            metadata,
            options,
            json,
            duplex,
            shared,
            pumps: Mutex::new(pumps),
            closed: AtomicBool::new(false),
        };

        let probe = session
            .request_timeout(JsonEnvelope::probe(), session.options.probe_timeout)
            .await;
        match probe {
            Ok(ack) if ack.success => info!(endpoint = %session.endpoint, "session established"),
            Ok(ack) => {
                let error = ack.error.unwrap_or_default();
                session.shared.connection_lost(format!("handshake probe rejected: {error}"));
            }
            Err(e) => session.shared.connection_lost(format!("handshake probe failed: {e}")),
        }
        Ok((session, events_rx))
    }

    pub fn endpoint(&self) -> &EndpointIdentity {
        &self.endpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for an ack.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Broadcast files written during this session.
    pub fn received_files(&self) -> Vec<PathBuf> {
        self.shared.received().clone()
    }

    fn ensure_open(&self) -> Result<(), TetherError> {
        if self.is_closed() || self.is_lost() || self.channel.is_closed() {
            return Err(TetherError::ChannelClosed);
        }
        Ok(())
    }

    /// Treat a transport failure as a lost connection, then hand the error back.
    fn observe(&self, error: TetherError) -> TetherError {
        if error.is_transport() {
            self.shared.connection_lost(format!("{error}"));
        }
        error
    }

    async fn open_call(&self, method: Method) -> Result<(StreamSender, StreamReceiver), TetherError> {
        self.ensure_open()?;
        let stream = self
            .channel
            .open(method, &self.metadata)
            .await
            .map_err(|e| self.observe(e))?;
        Ok(stream.split())
    }

    // ── JSON ─────────────────────────────────────────────────────

    async fn begin_request(&self, envelope: &JsonEnvelope) -> Result<PendingAck, TetherError> {
        self.ensure_open()?;
        let pending = self.shared.pending.register(envelope.id.clone())?;
        // The table may have been flushed between the check and the insert.
        if self.is_lost() {
            self.shared.pending.discard(&envelope.id);
            return Err(TetherError::ChannelClosed);
        }
        if let Err(e) = self.json.send(envelope).await {
            self.shared.pending.discard(&envelope.id);
            return Err(self.observe(e));
        }
        Ok(pending)
    }

    /// Send an envelope on the ack stream and wait for its ack.
    pub async fn request(&self, envelope: JsonEnvelope) -> Result<JsonAck, TetherError> {
        self.begin_request(&envelope).await?.wait().await
    }

    pub async fn request_timeout(&self, envelope: JsonEnvelope, timeout: Duration) -> Result<JsonAck, TetherError> {
        self.begin_request(&envelope).await?.wait_timeout(timeout).await
    }

    /// Like [`request`](Self::request), but gives up with
    /// [`TetherError::Cancelled`] once `cancel` fires.
    pub async fn request_cancellable(
        &self,
        envelope: JsonEnvelope,
        cancel: &CancellationToken,
    ) -> Result<JsonAck, TetherError> {
        self.begin_request(&envelope).await?.wait_cancellable(cancel).await
    }

    pub async fn send_json(&self, kind: impl Into<String>, json: impl Into<String>) -> Result<JsonAck, TetherError> {
        self.request(JsonEnvelope::new(kind, json)).await
    }

    /// Fire-and-forget on the duplex stream.
    pub async fn send_duplex(&self, kind: impl Into<String>, json: impl Into<String>) -> Result<(), TetherError> {
        self.ensure_open()?;
        self.duplex
            .send(&JsonEnvelope::new(kind, json))
            .await
            .map_err(|e| self.observe(e))
    }

    // ── Transfers ────────────────────────────────────────────────

    /// Upload `local`, stored by the server under `remote_name` or the
    /// local file name.
    pub async fn upload(&self, local: &Path, remote_name: Option<&str>) -> Result<UploadStatus, TetherError> {
        let name = match remote_name {
            Some(name) => name.to_string(),
            None => local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| TetherError::InvalidPath(local.display().to_string()))?,
        };
        let file = File::open(local).await?;
        let len = file.metadata().await?.len();
        let mut reader = ChunkReader::new(file, name.clone(), len, self.options.chunk_size);
        let total = reader.total_chunks();

        let (tx, mut rx) = self.open_call(Method::Upload).await?;
        let mut sent = 0;
        while let Some(piece) = reader.next_chunk().await? {
            tx.send(&piece).await.map_err(|e| self.observe(e))?;
            sent += 1;
            self.shared.progress(Direction::Upload, &name, chunk::progress_percent(sent, total));
        }
        debug!(%name, size = len, chunks = sent, "upload sent");

        match rx.recv::<UploadStatus>().await.map_err(|e| self.observe(e))? {
            Some(status) if status.success => Ok(status),
            Some(status) => Err(TetherError::Remote(
                status.error.unwrap_or_else(|| format!("upload of {name} failed")),
            )),
            None => Err(TetherError::ProtocolViolation("upload finished without a status")),
        }
    }

    /// Download `remote` into `dest`, creating parent directories.
    /// Returns the number of bytes written.
    pub async fn download(&self, remote: &str, dest: &Path) -> Result<u64, TetherError> {
        let (tx, mut rx) = self.open_call(Method::Download).await?;
        tx.send_last(&DownloadRequest { path: remote.into() })
            .await
            .map_err(|e| self.observe(e))?;

        let mut file: Option<File> = None;
        let mut received: u32 = 0;
        let mut written: u64 = 0;
        loop {
            let Some(piece) = rx.recv::<TransferChunk>().await.map_err(|e| self.observe(e))? else {
                return Err(TetherError::ProtocolViolation("download ended before its last chunk"));
            };
            if let Some(error) = piece.error {
                return Err(TetherError::Remote(error));
            }
            if piece.index != received {
                return Err(TetherError::ProtocolViolation("download chunk out of order"));
            }

            if file.is_none() {
                if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                file = Some(File::create(dest).await?);
            }
            if let Some(out) = file.as_mut() {
                out.write_all(&piece.data).await?;
            }
            received += 1;
            written += piece.data.len() as u64;
            self.shared.progress(
                Direction::Download,
                remote,
                chunk::progress_percent(received, piece.total_chunks),
            );

            if piece.is_last {
                if let Some(out) = file.as_mut() {
                    out.flush().await?;
                }
                debug!(%remote, dest = %dest.display(), size = written, "download complete");
                return Ok(written);
            }
        }
    }

    /// Capture monitor `monitor_index` on the server.
    pub async fn screenshot(&self, monitor_index: u32) -> Result<Bytes, TetherError> {
        let (tx, mut rx) = self.open_call(Method::Screenshot).await?;
        tx.send_last(&ScreenshotRequest { monitor_index })
            .await
            .map_err(|e| self.observe(e))?;

        let mut assembler = ChunkAssembler::new();
        while let Some(piece) = rx.recv::<TransferChunk>().await.map_err(|e| self.observe(e))? {
            let assembled = assembler.accept(piece);
            if let Some(percent) = assembled.percent() {
                self.shared.progress(Direction::Screenshot, assembled.path(), percent);
            }
            match assembled {
                Assembled::Progress { .. } => {}
                Assembled::Complete { data, .. } => return Ok(data),
                Assembled::Failed { error, .. } => return Err(TetherError::Remote(error)),
            }
        }
        Err(TetherError::ProtocolViolation("screenshot ended before its last chunk"))
    }

    pub async fn list(&self, directory: &str) -> Result<Vec<String>, TetherError> {
        let (tx, mut rx) = self.open_call(Method::ListFiles).await?;
        tx.send_last(&ListRequest {
            directory: directory.into(),
        })
        .await
        .map_err(|e| self.observe(e))?;
        match rx.recv::<ListResponse>().await.map_err(|e| self.observe(e))? {
            Some(response) => Ok(response.files),
            None => Err(TetherError::ProtocolViolation("list finished without a response")),
        }
    }

    // ── Bytes ────────────────────────────────────────────────────

    pub async fn send_bytes(&self, message: &ByteMessage) -> Result<ByteAck, TetherError> {
        let (tx, mut rx) = self.open_call(Method::SendBytes).await?;
        tx.send_last(message).await.map_err(|e| self.observe(e))?;
        match rx.recv::<ByteAck>().await.map_err(|e| self.observe(e))? {
            Some(ack) => Ok(ack),
            None => Err(TetherError::ProtocolViolation("byte send finished without an ack")),
        }
    }

    /// Send without an ack. Returns once the server finished the call.
    pub async fn send_bytes_no_ack(&self, message: &ByteMessage) -> Result<(), TetherError> {
        let (tx, mut rx) = self.open_call(Method::SendBytesNoAck).await?;
        tx.send_last(message).await.map_err(|e| self.observe(e))?;
        while rx.recv_payload().await.map_err(|e| self.observe(e))?.is_some() {}
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Stop the pumps, release the pooled channel and, if configured,
    /// delete the broadcast files this session saved. Idempotent. Does not
    /// raise `ConnectionLost`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.lost.store(true, Ordering::SeqCst);
        self.shared.pending.fail_all();
        let pumps: Vec<_> = self.pumps.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for pump in pumps {
            pump.abort();
        }
        self.pool.release(&self.endpoint);
        if self.options.auto_delete_received_files {
            self.shared.delete_received();
        }
        info!(endpoint = %self.endpoint, "session closed");
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("endpoint", &self.endpoint)
            .field("lost", &self.is_lost())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

// ── Pumps ────────────────────────────────────────────────────────

async fn pump_acks(mut rx: StreamReceiver, shared: Arc<Shared>) {
    let reason = loop {
        match rx.recv::<JsonAck>().await {
            Ok(Some(ack)) => {
                shared.pending.resolve(ack);
            }
            Ok(None) => break "ack stream ended".to_string(),
            Err(e) => break format!("ack stream failed: {e}"),
        }
    };
    shared.connection_lost(reason);
}

async fn pump_duplex(mut rx: StreamReceiver, shared: Arc<Shared>) {
    let reason = loop {
        match rx.recv::<JsonEnvelope>().await {
            Ok(Some(envelope)) => {
                debug!(kind = %envelope.kind, id = %envelope.id, "json pushed");
                shared.emit(SessionEvent::JsonReceived(envelope));
            }
            Ok(None) => break "duplex stream ended".to_string(),
            Err(e) => break format!("duplex stream failed: {e}"),
        }
    };
    shared.connection_lost(reason);
}

async fn pump_bytes(mut rx: StreamReceiver, shared: Arc<Shared>) {
    let reason = loop {
        match rx.recv::<ByteMessage>().await {
            Ok(Some(message)) => {
                debug!(kind = %message.kind, size = message.data.len(), "bytes pushed");
                shared.emit(SessionEvent::BytesReceived(message));
            }
            Ok(None) => break "byte subscription ended".to_string(),
            Err(e) => break format!("byte subscription failed: {e}"),
        }
    };
    shared.connection_lost(reason);
}

async fn pump_files(mut rx: StreamReceiver, shared: Arc<Shared>) {
    let mut assembler = ChunkAssembler::new();
    let reason = loop {
        let piece = match rx.recv::<TransferChunk>().await {
            Ok(Some(piece)) => piece,
            Ok(None) => break "file subscription ended".to_string(),
            Err(e) => break format!("file subscription failed: {e}"),
        };
        let assembled = assembler.accept(piece);
        if let Some(percent) = assembled.percent() {
            shared.progress(Direction::Broadcast, assembled.path(), percent);
        }
        match assembled {
            Assembled::Progress { .. } => {}
            Assembled::Complete { path, data } => shared.materialize(path, data).await,
            Assembled::Failed { path, error } => {
                warn!(%path, %error, "broadcast file failed");
                shared.emit(SessionEvent::FileFailed { name: path, error });
            }
        }
    };
    shared.connection_lost(reason);
}
