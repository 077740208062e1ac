//! Server-side broadcast hub.
//!
//! Three registries of push subscribers: duplex JSON, file push and byte
//! push. A broadcast snapshots one registry and writes to every subscriber
//! in parallel. Each subscriber's writes are serialized by its own lock so
//! a chunk sequence never interleaves with another sequence to the same
//! client. A subscriber whose write fails is removed on the spot and never
//! retried.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tether_core::chunk;
use tether_core::protocol::DEFAULT_CHUNK_SIZE;
use tether_core::{ByteMessage, JsonEnvelope, StreamSender, TetherError, TransferChunk};

// ── Sinks ────────────────────────────────────────────────────────

/// Where a subscriber's pushes go.
#[async_trait]
pub trait PushSink<T>: Send {
    async fn push(&mut self, message: &T) -> Result<(), TetherError>;
}

#[async_trait]
impl<T> PushSink<T> for StreamSender
where
    T: Serialize + Sync,
{
    async fn push(&mut self, message: &T) -> Result<(), TetherError> {
        self.send(message).await
    }
}

// ── Registry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Json,
    Files,
    Bytes,
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKind::Json => write!(f, "json"),
            SubscriptionKind::Files => write!(f, "files"),
            SubscriptionKind::Bytes => write!(f, "bytes"),
        }
    }
}

pub type SubscriberId = u64;

struct Subscriber<T> {
    id: SubscriberId,
    label: String,
    sink: Mutex<Box<dyn PushSink<T>>>,
}

/// Subscribers of one kind.
struct Registry<T> {
    kind: SubscriptionKind,
    subscribers: DashMap<SubscriberId, Arc<Subscriber<T>>>,
}

impl<T: Sync> Registry<T> {
    fn new(kind: SubscriptionKind) -> Self {
        Self {
            kind,
            subscribers: DashMap::new(),
        }
    }

    fn insert(&self, id: SubscriberId, label: String, sink: Box<dyn PushSink<T>>) {
        self.subscribers.insert(
            id,
            Arc::new(Subscriber {
                id,
                label,
                sink: Mutex::new(sink),
            }),
        );
    }

    fn remove(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Write `messages`, in order, to every current subscriber.
    async fn broadcast(&self, messages: &[T]) -> BroadcastReport {
        let snapshot: Vec<Arc<Subscriber<T>>> =
            self.subscribers.iter().map(|e| Arc::clone(e.value())).collect();
        let attempted = snapshot.len();

        let outcomes = join_all(snapshot.into_iter().map(|subscriber| async move {
            let mut sink = subscriber.sink.lock().await;
            for message in messages {
                if let Err(e) = sink.push(message).await {
                    self.subscribers.remove(&subscriber.id);
                    warn!(
                        kind = %self.kind,
                        id = subscriber.id,
                        label = %subscriber.label,
                        error = %e,
                        "push failed, subscriber removed"
                    );
                    return false;
                }
            }
            true
        }))
        .await;

        let reached = outcomes.into_iter().filter(|ok| *ok).count();
        BroadcastReport { attempted, reached }
    }

    fn snapshot_info(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .iter()
            .map(|e| SubscriberInfo {
                kind: self.kind,
                id: e.id,
                label: e.label.clone(),
            })
            .collect()
    }
}

// ── Report ───────────────────────────────────────────────────────

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers registered when the broadcast started.
    pub attempted: usize,
    /// Subscribers every message was written to.
    pub reached: usize,
}

impl BroadcastReport {
    pub fn failed(&self) -> usize {
        self.attempted - self.reached
    }

    /// Only a broadcast with nobody registered counts as a failure.
    pub fn is_failure(&self) -> bool {
        self.attempted == 0
    }
}

impl fmt::Display for BroadcastReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reached {} of {} subscribers", self.reached, self.attempted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub kind: SubscriptionKind,
    pub id: SubscriberId,
    pub label: String,
}

// ── BroadcastHub ─────────────────────────────────────────────────

pub struct BroadcastHub {
    json: Registry<JsonEnvelope>,
    files: Registry<TransferChunk>,
    bytes: Registry<ByteMessage>,
    next_id: AtomicU64,
    chunk_size: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl BroadcastHub {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            json: Registry::new(SubscriptionKind::Json),
            files: Registry::new(SubscriptionKind::Files),
            bytes: Registry::new(SubscriptionKind::Bytes),
            next_id: AtomicU64::new(1),
            chunk_size: chunk::clamp_chunk_size(chunk_size),
        }
    }

    fn allocate_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_json(&self, label: impl Into<String>, sink: Box<dyn PushSink<JsonEnvelope>>) -> SubscriberId {
        let id = self.allocate_id();
        self.json.insert(id, label.into(), sink);
        debug!(id, "json subscriber registered");
        id
    }

    pub fn register_files(&self, label: impl Into<String>, sink: Box<dyn PushSink<TransferChunk>>) -> SubscriberId {
        let id = self.allocate_id();
        self.files.insert(id, label.into(), sink);
        debug!(id, "file subscriber registered");
        id
    }

    pub fn register_bytes(&self, label: impl Into<String>, sink: Box<dyn PushSink<ByteMessage>>) -> SubscriberId {
        let id = self.allocate_id();
        self.bytes.insert(id, label.into(), sink);
        debug!(id, "byte subscriber registered");
        id
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unregister(&self, kind: SubscriptionKind, id: SubscriberId) -> bool {
        match kind {
            SubscriptionKind::Json => self.json.remove(id),
            SubscriptionKind::Files => self.files.remove(id),
            SubscriptionKind::Bytes => self.bytes.remove(id),
        }
    }

    pub fn subscriber_count(&self, kind: SubscriptionKind) -> usize {
        match kind {
            SubscriptionKind::Json => self.json.subscribers.len(),
            SubscriptionKind::Files => self.files.subscribers.len(),
            SubscriptionKind::Bytes => self.bytes.subscribers.len(),
        }
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let mut all = self.json.snapshot_info();
        all.extend(self.files.snapshot_info());
        all.extend(self.bytes.snapshot_info());
        all.sort_by_key(|s| s.id);
        all
    }

    // ── Broadcasts ───────────────────────────────────────────────

    pub async fn broadcast_json(&self, envelope: &JsonEnvelope) -> BroadcastReport {
        let report = self.json.broadcast(std::slice::from_ref(envelope)).await;
        info!(kind = %envelope.kind, %report, "json broadcast");
        report
    }

    pub async fn broadcast_bytes(&self, message: &ByteMessage) -> BroadcastReport {
        let report = self.bytes.broadcast(std::slice::from_ref(message)).await;
        info!(kind = %message.kind, size = message.data.len(), %report, "byte broadcast");
        report
    }

    /// Chunk `data` once under `name` and push the whole sequence to every
    /// file subscriber.
    pub async fn broadcast_payload(&self, name: &str, data: &[u8]) -> BroadcastReport {
        let chunks = chunk::split(name, data, self.chunk_size);
        let report = self.files.broadcast(&chunks).await;
        info!(%name, size = data.len(), chunks = chunks.len(), %report, "file broadcast");
        report
    }

    /// Read a file from disk and broadcast it under its bare file name.
    pub async fn broadcast_file(&self, path: &Path) -> Result<BroadcastReport, TetherError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TetherError::InvalidPath(path.display().to_string()))?;
        let data = tokio::fs::read(path).await?;
        Ok(self.broadcast_payload(&name, &data).await)
    }
}
