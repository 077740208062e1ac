//! Pending-request table shared by a session's send path and its ack loop.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tether_core::{JsonAck, TetherError};

/// In-flight requests keyed by envelope id. Each entry resolves exactly
/// once: by its ack, or by [`fail_all`](Self::fail_all) when the link dies.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: DashMap<String, oneshot::Sender<JsonAck>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` before its envelope is written.
    pub fn register(&self, id: impl Into<String>) -> Result<PendingAck, TetherError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        match self.slots.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TetherError::ProtocolViolation("duplicate request id")),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingAck { id, rx })
            }
        }
    }

    /// Route an ack to its waiter. The entry is removed even if the waiter
    /// already gave up. Returns `false` for an unknown id.
    pub fn resolve(&self, ack: JsonAck) -> bool {
        let Some((id, slot)) = self.slots.remove(&ack.id) else {
            debug!(id = %ack.id, "ack for unknown request");
            return false;
        };
        if slot.send(ack).is_err() {
            trace!(%id, "ack for abandoned request");
        }
        true
    }

    /// Forget `id` without resolving it.
    pub fn discard(&self, id: &str) {
        self.slots.remove(id);
    }

    /// Drop every entry; their waiters observe "channel closed".
    pub fn fail_all(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// The caller's end of one pending request.
#[derive(Debug)]
pub struct PendingAck {
    id: String,
    rx: oneshot::Receiver<JsonAck>,
}

impl PendingAck {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<JsonAck, TetherError> {
        self.rx.await.map_err(|_| TetherError::ChannelClosed)
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<JsonAck, TetherError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| TetherError::Timeout(timeout))?
    }

    /// Wait unless `cancel` fires first. A cancelled wait leaves the entry
    /// in the table until its late ack arrives.
    pub async fn wait_cancellable(self, cancel: &CancellationToken) -> Result<JsonAck, TetherError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TetherError::Cancelled),
            ack = self.wait() => ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_resolves_its_waiter_once() {
        let table = PendingRequests::new();
        let pending = table.register("a").unwrap();
        assert!(table.resolve(JsonAck::success("a")));
        assert!(!table.resolve(JsonAck::success("a")));
        assert_eq!(pending.wait().await.unwrap().id, "a");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_refused() {
        let table = PendingRequests::new();
        let _first = table.register("x").unwrap();
        assert!(table.register("x").is_err());
    }

    #[tokio::test]
    async fn late_ack_removes_cancelled_entry() {
        let table = PendingRequests::new();
        let cancel = CancellationToken::new();
        let pending = table.register("slow").unwrap();
        cancel.cancel();
        assert!(matches!(pending.wait_cancellable(&cancel).await, Err(TetherError::Cancelled)));
        assert_eq!(table.len(), 1);

        assert!(table.resolve(JsonAck::success("slow")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_closes_every_waiter() {
        let table = PendingRequests::new();
        let a = table.register("a").unwrap();
        let b = table.register("b").unwrap();
        assert_eq!(table.fail_all(), 2);
        assert!(matches!(a.wait().await, Err(TetherError::ChannelClosed)));
        assert!(matches!(b.wait().await, Err(TetherError::ChannelClosed)));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let table = PendingRequests::new();
        let pending = table.register("quiet").unwrap();
        let err = pending.wait_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TetherError::Timeout(_)));
    }
}
