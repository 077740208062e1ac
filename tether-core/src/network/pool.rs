//! Reference-counted cache of physical channels keyed by endpoint.
//!
//! Sessions to the same endpoint share one link. `release` only drops a
//! reference; closing happens in the periodic sweep once an entry has no
//! references and has been idle past the threshold, or at `shutdown`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::channel::Channel;
use super::endpoint::{Connector, EndpointIdentity, TcpConnector};
use crate::error::TetherError;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// An unreferenced entry idle this long is closed by the sweep.
    pub idle_timeout: Duration,

    /// How often the background sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Debug)]
struct PooledChannel {
    channel: Channel,
    refs: i64,
    last_access: Instant,
}

impl PooledChannel {
    fn expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.refs <= 0 && now.saturating_duration_since(self.last_access) >= idle_timeout
    }
}

/// Shared channel cache. Construct one per process and hand an `Arc` of it
/// to every session; tests build isolated pools.
pub struct ChannelPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    entries: Mutex<HashMap<EndpointIdentity, PooledChannel>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            entries: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// A pool over plain TCP with default timings.
    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpConnector::default()), PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<EndpointIdentity, PooledChannel>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the live channel for `endpoint`, opening one if needed.
    /// Every successful call must be balanced by one [`release`](Self::release).
    pub async fn get_or_create(&self, endpoint: &EndpointIdentity) -> Result<Channel, TetherError> {
        let mut carried_refs = 0;
        {
            let mut entries = self.entries();
            if let Some(entry) = entries.get_mut(endpoint) {
                if !entry.channel.is_closed() {
                    entry.refs += 1;
                    entry.last_access = Instant::now();
                    return Ok(entry.channel.clone());
                }
                debug!(%endpoint, "pooled channel is closed, replacing it");
                carried_refs = entry.refs.max(0);
                entries.remove(endpoint);
            }
        }

        // Connect without holding the lock.
        let channel = self.connector.connect(endpoint).await?;

        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(endpoint) {
            if !entry.channel.is_closed() {
                // Lost a race with another caller; use theirs.
                channel.close();
                entry.refs += 1;
                entry.last_access = Instant::now();
                return Ok(entry.channel.clone());
            }
            carried_refs = carried_refs.max(entry.refs);
        }
        info!(%endpoint, "opened pooled channel");
        entries.insert(
            endpoint.clone(),
            PooledChannel {
                channel: channel.clone(),
                refs: carried_refs + 1,
                last_access: Instant::now(),
            },
        );
        Ok(channel)
    }

    /// Drop one reference. Never closes anything.
    pub fn release(&self, endpoint: &EndpointIdentity) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(endpoint) {
            entry.refs -= 1;
            entry.last_access = Instant::now();
            debug!(%endpoint, refs = entry.refs, "released pooled channel");
        }
    }

    /// Close entries that are unreferenced and idle as of now.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Close entries that are unreferenced and idle as of `now`.
    /// Returns the number of entries removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut removed = 0;
        self.entries().retain(|endpoint, entry| {
            if entry.expired(now, idle_timeout) {
                debug!(%endpoint, "evicting idle channel");
                entry.channel.close();
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until shutdown.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                let removed = pool.sweep();
                if removed > 0 {
                    info!(removed, "swept idle channels");
                }
            }
        });
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweeper and close every entry regardless of references.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        let drained: Vec<_> = self.entries().drain().collect();
        for (endpoint, entry) in &drained {
            debug!(%endpoint, refs = entry.refs, "closing channel on shutdown");
            entry.channel.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "channel pool shut down");
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Current reference count for `endpoint`, if pooled.
    pub fn ref_count(&self, endpoint: &EndpointIdentity) -> Option<i64> {
        self.entries().get(endpoint).map(|e| e.refs)
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::IncomingCall;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Connects over in-memory pipes and counts how often it was asked to.
    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        servers: Mutex<Vec<(Channel, mpsc::UnboundedReceiver<IncomingCall>)>>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, endpoint: &EndpointIdentity) -> Result<Channel, TetherError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (a, b) = tokio::io::duplex(4096);
            self.servers.lock().unwrap().push(Channel::server(b, "client"));
            Ok(Channel::client(a, endpoint.address()))
        }
    }

    fn pool() -> (Arc<CountingConnector>, ChannelPool) {
        let connector = Arc::new(CountingConnector::default());
        let pool = ChannelPool::new(connector.clone(), PoolConfig::default());
        (connector, pool)
    }

    fn later(pool: &ChannelPool) -> Instant {
        Instant::now() + pool.config().idle_timeout + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn sessions_share_one_channel() {
        let (connector, pool) = pool();
        let e = EndpointIdentity::new("127.0.0.1", 50051);
        let a = pool.get_or_create(&e).await.unwrap();
        let b = pool.get_or_create(&e).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.ref_count(&e), Some(2));
        assert_eq!(a.peer(), b.peer());

        let secure = e.clone().secure(true);
        pool.get_or_create(&secure).await.unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn over_released_entry_is_swept_once() {
        let (_, pool) = pool();
        let e = EndpointIdentity::new("127.0.0.1", 50051);
        let channel = pool.get_or_create(&e).await.unwrap();
        pool.release(&e);
        pool.release(&e);
        assert_eq!(pool.ref_count(&e), Some(-1));

        assert_eq!(pool.sweep_at(later(&pool)), 1);
        assert!(pool.is_empty());
        assert!(channel.is_closed());
        assert_eq!(pool.sweep_at(later(&pool)), 0);
    }

    #[tokio::test]
    async fn reacquire_before_sweep_keeps_entry() {
        let (connector, pool) = pool();
        let e = EndpointIdentity::new("127.0.0.1", 50051);
        pool.get_or_create(&e).await.unwrap();
        pool.release(&e);
        pool.release(&e);
        let again = pool.get_or_create(&e).await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(!again.is_closed());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn referenced_entry_is_never_swept() {
        let (_, pool) = pool();
        let e = EndpointIdentity::new("127.0.0.1", 50051);
        pool.get_or_create(&e).await.unwrap();
        assert_eq!(pool.sweep_at(later(&pool)), 0);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn recently_released_entry_survives_sweep() {
        let (_, pool) = pool();
        let e = EndpointIdentity::new("127.0.0.1", 50051);
        pool.get_or_create(&e).await.unwrap();
        pool.release(&e);
        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn closed_channel_is_replaced() {
        let (connector, pool) = pool();
        let e = EndpointIdentity::new("127.0.0.1", 50051);
        let first = pool.get_or_create(&e).await.unwrap();
        first.close();

        let second = pool.get_or_create(&e).await.unwrap();
        assert!(!second.is_closed());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        // The holder of the dead channel still owes one release.
        assert_eq!(pool.ref_count(&e), Some(2));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (_, pool) = pool();
        let pool = Arc::new(pool);
        pool.start_sweeper();
        let e = EndpointIdentity::new("127.0.0.1", 50051);
        let channel = pool.get_or_create(&e).await.unwrap();

        pool.shutdown();
        assert!(pool.is_empty());
        assert!(channel.is_closed());
    }
}
