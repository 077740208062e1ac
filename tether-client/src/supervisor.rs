//! Reconnect supervisor.
//!
//! Owns the current [`ClientSession`] for one endpoint and drives the
//! [`ConnectionState`] machine:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!      ▲                        │                  │
//!      │                      fail              lost
//!      │                        ▼                  ▼
//!      └──── disconnect ──── Error         Disconnected ──delay──► Retrying ──ok──► Connected
//! ```
//!
//! A lost connection schedules one reconnect after a fixed delay. The
//! `reconnect_scheduled` flag is claimed with a compare-and-swap, so a
//! second loss signal while a reconnect is pending is a no-op. An explicit
//! [`disconnect`](ReconnectSupervisor::disconnect) suppresses reconnects
//! until the caller connects again.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tether_core::{ChannelPool, ConnectionState, EndpointIdentity, TetherError};

use crate::events::SessionEvent;
use crate::session::{ClientSession, SessionOptions};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Give up after this many consecutive failed attempts.
    pub max_attempts: Option<u32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

struct Inner {
    pool: Arc<ChannelPool>,
    endpoint: EndpointIdentity,
    options: SessionOptions,
    config: SupervisorConfig,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Arc<ClientSession>>>,
    /// Bumped whenever the current session is replaced or dropped.
    generation: AtomicU64,
    reconnect_scheduled: AtomicBool,
    auto_reconnect: AtomicBool,
    attempts: AtomicU32,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Keeps a session to one endpoint alive. Cheap to clone.
#[derive(Clone)]
pub struct ReconnectSupervisor {
    inner: Arc<Inner>,
}

impl ReconnectSupervisor {
    pub fn new(
        pool: Arc<ChannelPool>,
        endpoint: EndpointIdentity,
        options: SessionOptions,
        config: SupervisorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::default());
        let inner = Arc::new(Inner {
            pool,
            endpoint,
            options,
            config,
            state,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnect_scheduled: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            events,
        });
        (Self { inner }, events_rx)
    }

    pub fn endpoint(&self) -> &EndpointIdentity {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observe every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<Arc<ClientSession>> {
        self.inner.slot().clone()
    }

    /// Reconnect attempts made so far, across every outage.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn is_reconnect_scheduled(&self) -> bool {
        self.inner.reconnect_scheduled.load(Ordering::SeqCst)
    }

    /// Connect and enable automatic reconnects. A failure leaves the state
    /// at `Error` and does not schedule a retry.
    pub async fn connect(&self) -> Result<(), TetherError> {
        let inner = &self.inner;
        inner.auto_reconnect.store(true, Ordering::SeqCst);
        if inner.state.borrow().is_connected() {
            return Ok(());
        }
        inner.transition(ConnectionState::begin_connect)?;
        info!(endpoint = %inner.endpoint, "connecting");

        match inner.establish().await {
            Ok((generation, events)) => {
                Inner::start_forwarding(inner, generation, events);
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %inner.endpoint, error = %e, "connect failed");
                let _ = inner.transition(|s| s.fail(e.to_string()));
                Err(e)
            }
        }
    }

    /// Close the session and stop reconnecting.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.auto_reconnect.store(false, Ordering::SeqCst);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        let session = inner.slot().take();
        if let Some(session) = session {
            session.close();
        }
        inner.state.send_modify(ConnectionState::force_disconnect);
        info!(endpoint = %inner.endpoint, "disconnected by caller");
    }

    /// Report a lost connection from outside the session's own pumps.
    pub fn notify_connection_lost(&self, reason: &str) {
        self.inner.connection_lost(reason);
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<ClientSession>>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply a state transition, publishing it only if it was valid.
    fn transition<F>(&self, apply: F) -> Result<(), TetherError>
    where
        F: FnOnce(&mut ConnectionState) -> Result<(), TetherError>,
    {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            result = apply(state);
            result.is_ok()
        });
        result
    }

    /// Open a fresh session and install it as current. A session whose
    /// handshake probe failed counts as a failed connect.
    async fn establish(&self) -> Result<(u64, mpsc::UnboundedReceiver<SessionEvent>), TetherError> {
        let (session, mut events) =
            ClientSession::connect(self.pool.clone(), self.endpoint.clone(), self.options.clone()).await?;
        if session.is_lost() {
            session.close();
            let reason = lost_reason(&mut events).unwrap_or_else(|| "handshake failed".to_string());
            return Err(TetherError::Other(reason));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = self.transition(ConnectionState::complete_connect) {
            // The caller disconnected while we were connecting.
            debug!(error = %e, "discarding session opened after disconnect");
            session.close();
            return Err(TetherError::Cancelled);
        }
        let previous = self.slot().replace(Arc::new(session));
        if let Some(previous) = previous {
            previous.close();
        }
        info!(endpoint = %self.endpoint, generation, "connected");
        Ok((generation, events))
    }

    /// Relay one session's events to the consumer until it is superseded.
    fn start_forwarding(self: &Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                if inner.generation.load(Ordering::SeqCst) != generation {
                    debug!(generation, "dropping events of a superseded session");
                    return;
                }
                let lost = match &event {
                    SessionEvent::ConnectionLost { reason } => Some(reason.clone()),
                    _ => None,
                };
                let _ = inner.events.send(event);
                if let Some(reason) = lost {
                    inner.connection_lost(&reason);
                }
            }
        });
    }

    fn connection_lost(self: &Arc<Self>, reason: &str) {
        if self.transition(ConnectionState::lose).is_ok() {
            info!(endpoint = %self.endpoint, %reason, "connection lost");
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        if self
            .reconnect_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(endpoint = %self.endpoint, "reconnect already scheduled");
            return;
        }
        debug!(endpoint = %self.endpoint, delay = ?self.config.reconnect_delay, "reconnect scheduled");
        tokio::spawn(reconnect_loop(Arc::downgrade(self)));
    }
}

/// Reason carried by a `ConnectionLost` already queued on `events`.
fn lost_reason(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Option<String> {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ConnectionLost { reason } = event {
            return Some(reason);
        }
    }
    None
}

async fn reconnect_loop(weak: Weak<Inner>) {
    let mut round: u32 = 0;
    loop {
        let Some(delay) = weak.upgrade().map(|inner| inner.config.reconnect_delay) else {
            return;
        };
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else { return };

        let still_wanted = inner.auto_reconnect.load(Ordering::SeqCst);
        if !still_wanted || inner.state.borrow().is_connected() {
            inner.reconnect_scheduled.store(false, Ordering::SeqCst);
            return;
        }

        round += 1;
        if let Some(max) = inner.config.max_attempts {
            if round > max {
                warn!(endpoint = %inner.endpoint, max, "giving up on reconnect");
                inner.state.send_replace(ConnectionState::Error {
                    message: format!("gave up after {max} reconnect attempts"),
                });
                inner.reconnect_scheduled.store(false, Ordering::SeqCst);
                return;
            }
        }

        if let Err(e) = inner.transition(|s| s.begin_retry(round)) {
            debug!(error = %e, "reconnect no longer applicable");
            inner.reconnect_scheduled.store(false, Ordering::SeqCst);
            return;
        }
        inner.attempts.fetch_add(1, Ordering::SeqCst);
        info!(endpoint = %inner.endpoint, attempt = round, "reconnecting");

        match inner.establish().await {
            Ok((generation, events)) => {
                // Clear the flag first so a loss on the new session can schedule again.
                inner.reconnect_scheduled.store(false, Ordering::SeqCst);
                Inner::start_forwarding(&inner, generation, events);
                return;
            }
            Err(e) => {
                warn!(endpoint = %inner.endpoint, attempt = round, error = %e, "reconnect failed");
                let _ = inner.transition(|s| s.fail(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{PoolConfig, TcpConnector};

    async fn unused_endpoint() -> EndpointIdentity {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        EndpointIdentity::new("127.0.0.1", port)
    }

    fn pool() -> Arc<ChannelPool> {
        Arc::new(ChannelPool::new(
            Arc::new(TcpConnector::new(Duration::from_millis(500))),
            PoolConfig::default(),
        ))
    }

    #[tokio::test]
    async fn failed_connect_lands_in_error_without_retry() {
        let (supervisor, _events) = ReconnectSupervisor::new(
            pool(),
            unused_endpoint().await,
            SessionOptions::default(),
            SupervisorConfig {
                reconnect_delay: Duration::from_millis(10),
                max_attempts: None,
            },
        );
        let states = supervisor.watch_state();
        assert!(supervisor.connect().await.is_err());
        assert!(matches!(supervisor.state(), ConnectionState::Error { .. }));
        assert!(states.has_changed().unwrap());
        assert!(!supervisor.is_reconnect_scheduled());
        assert!(supervisor.session().is_none());
        assert_eq!(supervisor.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn attempt_cap_gives_up() {
        let (supervisor, _events) = ReconnectSupervisor::new(
            pool(),
            unused_endpoint().await,
            SessionOptions::default(),
            SupervisorConfig {
                reconnect_delay: Duration::from_millis(10),
                max_attempts: Some(2),
            },
        );
        let _ = supervisor.connect().await;
        supervisor.notify_connection_lost("test");

        tokio::time::timeout(Duration::from_secs(5), async {
            while supervisor.is_reconnect_scheduled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(supervisor.reconnect_attempts(), 2);
        assert_eq!(
            supervisor.state(),
            ConnectionState::Error {
                message: "gave up after 2 reconnect attempts".into()
            }
        );
    }

    #[tokio::test]
    async fn disconnect_suppresses_reconnect() {
        let (supervisor, _events) = ReconnectSupervisor::new(
            pool(),
            unused_endpoint().await,
            SessionOptions::default(),
            SupervisorConfig {
                reconnect_delay: Duration::from_millis(20),
                max_attempts: None,
            },
        );
        let _ = supervisor.connect().await;
        supervisor.notify_connection_lost("flaky");
        assert!(supervisor.is_reconnect_scheduled());
        supervisor.disconnect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.reconnect_attempts(), 0);
        assert!(!supervisor.is_reconnect_scheduled());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }
}
