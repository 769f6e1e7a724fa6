//! Session manager for per-owner agent clients.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use kernel_agents_core::config::SessionConfig;
use serde::Serialize;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect client for '{owner}': {reason}")]
    Connect { owner: String, reason: String },
    #[error("Failed to disconnect client: {0}")]
    Disconnect(String),
}

/// A connected, long-lived agent client.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Close the client's connection and discard its conversation state.
    async fn disconnect(&self) -> Result<(), ClientError>;
}

/// Creates clients for owners.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    type Client: AgentClient + 'static;
    type Config: Clone + Send + Sync + 'static;

    async fn connect(
        &self,
        owner_key: &str,
        config: &Self::Config,
    ) -> Result<Self::Client, ClientError>;
}

struct Session<C: ClientConnector> {
    client: Arc<C::Client>,
    config: C::Config,
    created_at: Instant,
    last_access_at: Instant,
}

/// Per-owner slot. A retired slot has been removed from the map and must not be reused.
struct Slot<C: ClientConnector> {
    session: Option<Session<C>>,
    retired: bool,
}

impl<C: ClientConnector> Default for Slot<C> {
    fn default() -> Self {
        Self {
            session: None,
            retired: false,
        }
    }
}

type SlotRef<C> = Arc<Mutex<Slot<C>>>;

/// Snapshot of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo<Cfg> {
    pub owner_key: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub config: Cfg,
}

/// Owns at most one client per owner key.
///
/// Clients are created lazily, reused across calls and dropped on reset,
/// idle sweep or shutdown. Each key has its own lock, so connecting a new
/// client for one owner never blocks calls for another.
pub struct SessionManager<C: ClientConnector> {
    connector: C,
    slots: Mutex<HashMap<String, SlotRef<C>>>,
}

impl<C: ClientConnector> SessionManager<C> {
    /// Create a new session manager.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, owner_key: &str) -> SlotRef<C> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(owner_key.to_string()).or_default())
    }

    /// Remove a retired slot from the map, unless it was already replaced.
    async fn unlink(&self, owner_key: &str, slot: &SlotRef<C>) {
        let mut slots = self.slots.lock().await;
        if slots.get(owner_key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(owner_key);
        }
    }

    async fn disconnect_logged(owner_key: &str, client: &C::Client) {
        match client.disconnect().await {
            Ok(()) => debug!(owner = %owner_key, "Disconnected client"),
            Err(e) => warn!(owner = %owner_key, error = %e, "Client disconnect failed"),
        }
    }

    /// Return the client for `owner_key`, connecting one under `config` if none exists.
    ///
    /// An existing client is returned as-is even if `config` differs.
    ///
    /// # Errors
    /// Returns the connector's error if a new client cannot be connected.
    pub async fn get_or_create(
        &self,
        owner_key: &str,
        config: &C::Config,
    ) -> Result<Arc<C::Client>, ClientError> {
        loop {
            let slot = self.slot(owner_key).await;
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            if let Some(session) = guard.session.as_mut() {
                session.last_access_at = Instant::now();
                return Ok(Arc::clone(&session.client));
            }

            let client = match self.connector.connect(owner_key, config).await {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    guard.retired = true;
                    self.unlink(owner_key, &slot).await;
                    drop(guard);
                    warn!(owner = %owner_key, error = %e, "Failed to connect session client");
                    return Err(e);
                }
            };
            let now = Instant::now();
            guard.session = Some(Session {
                client: Arc::clone(&client),
                config: config.clone(),
                created_at: now,
                last_access_at: now,
            });
            info!(owner = %owner_key, "Created session client");
            return Ok(client);
        }
    }

    /// Disconnect and drop the client for `owner_key`. Returns whether one existed.
    pub async fn reset(&self, owner_key: &str) -> bool {
        let Some(slot) = self.slots.lock().await.get(owner_key).cloned() else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.retired {
            return false;
        }
        let session = guard.session.take();
        if let Some(session) = &session {
            Self::disconnect_logged(owner_key, &session.client).await;
        }
        guard.retired = true;
        self.unlink(owner_key, &slot).await;
        drop(guard);
        if session.is_some() {
            info!(owner = %owner_key, "Reset session");
        }
        session.is_some()
    }

    /// Disconnect and drop every client idle for longer than `max_idle`.
    ///
    /// Returns the evicted owner keys.
    pub async fn sweep(&self, max_idle: Duration) -> Vec<String> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut evicted = Vec::new();
        for (owner_key, slot) in slots {
            let Ok(mut guard) = slot.try_lock() else {
                // Busy connecting or resetting, so not idle.
                continue;
            };
            if guard.retired {
                continue;
            }
            let Some(session) = guard.session.as_ref() else {
                // Empty and unlocked: nobody is connecting into it.
                guard.retired = true;
                self.unlink(&owner_key, &slot).await;
                continue;
            };
            if session.last_access_at.elapsed() <= max_idle {
                continue;
            }
            if let Some(session) = guard.session.take() {
                Self::disconnect_logged(&owner_key, &session.client).await;
            }
            guard.retired = true;
            self.unlink(&owner_key, &slot).await;
            evicted.push(owner_key);
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Disconnect and drop every client.
    ///
    /// Disconnect failures are logged; they never stop the rest of the drain.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.slots.lock().await.drain().collect();
        let count = slots.len();
        join_all(slots.into_iter().map(|(owner_key, slot)| async move {
            let mut guard = slot.lock().await;
            guard.retired = true;
            if let Some(session) = guard.session.take() {
                Self::disconnect_logged(&owner_key, &session.client).await;
            }
        }))
        .await;
        info!(count, "Session manager shut down");
    }

    /// Owner keys with a live client.
    pub async fn active_sessions(&self) -> Vec<String> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        let mut keys = Vec::new();
        for (key, slot) in slots {
            if slot.lock().await.session.is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }

    /// Snapshot of the session for `owner_key`, if it has a live client.
    pub async fn info(&self, owner_key: &str) -> Option<SessionInfo<C::Config>> {
        let slot = self.slots.lock().await.get(owner_key).cloned()?;
        let guard = slot.lock().await;
        let session = guard.session.as_ref()?;
        Some(SessionInfo {
            owner_key: owner_key.to_string(),
            age_secs: session.created_at.elapsed().as_secs(),
            idle_secs: session.last_access_at.elapsed().as_secs(),
            config: session.config.clone(),
        })
    }
}

impl<C: ClientConnector + 'static> SessionManager<C> {
    /// Sweep idle sessions every `interval` until the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Session manager dropped; stopping sweeper");
                    return;
                };
                manager.sweep(max_idle).await;
            }
        })
    }

    /// [`spawn_sweeper`](Self::spawn_sweeper) with the configured interval and idle limit.
    pub fn spawn_configured_sweeper(self: &Arc<Self>, config: &SessionConfig) -> JoinHandle<()> {
        self.spawn_sweeper(config.sweep_interval(), config.max_idle())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct FakeClient {
        serial: usize,
        fail_disconnect: bool,
        disconnected: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentClient for FakeClient {
        async fn disconnect(&self) -> Result<(), ClientError> {
            if self.fail_disconnect {
                return Err(ClientError::Disconnect("socket already gone".into()));
            }
            self.disconnected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
        disconnected: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClientConnector for FakeConnector {
        type Client = FakeClient;
        type Config = String;

        async fn connect(
            &self,
            owner_key: &str,
            config: &String,
        ) -> Result<FakeClient, ClientError> {
            if config == "unreachable" {
                return Err(ClientError::Connect {
                    owner: owner_key.to_string(),
                    reason: "refused".into(),
                });
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(FakeClient {
                serial: self.connects.fetch_add(1, Ordering::SeqCst),
                fail_disconnect: owner_key.starts_with("broken"),
                disconnected: Arc::clone(&self.disconnected),
            })
        }
    }

    fn manager() -> SessionManager<FakeConnector> {
        SessionManager::new(FakeConnector::default())
    }

    fn cfg() -> String {
        "model-a".to_string()
    }

    #[tokio::test]
    async fn same_key_reuses_client() {
        let manager = manager();

        let a = tokio_test::assert_ok!(manager.get_or_create("alice", &cfg()).await);
        let b = tokio_test::assert_ok!(manager.get_or_create("alice", &cfg()).await);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let manager = manager();

        let c = cfg();

        let (a, b) = tokio::join!(
            manager.get_or_create("alice", &c),
            manager.get_or_create("alice", &c),
        );

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(manager.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_gives_a_new_client() {
        let manager = manager();
        let before = manager.get_or_create("alice", &cfg()).await.unwrap();

        assert!(manager.reset("alice").await);
        assert!(!manager.reset("alice").await);
        let after = manager.get_or_create("alice", &cfg()).await.unwrap();

        assert_ne!(before.serial, after.serial);
        assert_eq!(manager.connector.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_sessions() {
        let manager = manager();
        manager.get_or_create("idle", &cfg()).await.unwrap();
        manager.get_or_create("busy", &cfg()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.get_or_create("busy", &cfg()).await.unwrap();

        let evicted = manager.sweep(Duration::from_millis(80)).await;

        assert_eq!(evicted, vec!["idle".to_string()]);
        assert_eq!(manager.active_sessions().await, vec!["busy".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_drains_past_failures() {
        let manager = manager();
        manager.get_or_create("broken-1", &cfg()).await.unwrap();
        manager.get_or_create("alice", &cfg()).await.unwrap();
        manager.get_or_create("bob", &cfg()).await.unwrap();

        manager.shutdown().await;

        assert!(manager.active_sessions().await.is_empty());
        assert_eq!(manager.connector.disconnected.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_failure_leaves_no_session() {
        let manager = manager();

        let err = manager
            .get_or_create("alice", &"unreachable".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(manager.info("alice").await.is_none());
        assert!(manager.get_or_create("alice", &cfg()).await.is_ok());
    }

    #[tokio::test]
    async fn failed_connects_leave_no_slots_behind() {
        let manager = manager();
        let unreachable = "unreachable".to_string();

        for i in 0..50 {
            let owner = format!("owner-{i}");
            assert!(manager.get_or_create(&owner, &unreachable).await.is_err());
        }

        assert!(manager.slots.lock().await.is_empty());
        assert!(manager.sweep(Duration::ZERO).await.is_empty());
        assert!(manager.slots.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_drains_past_failed_disconnects() {
        let manager = manager();
        manager.get_or_create("broken-1", &cfg()).await.unwrap();
        manager.get_or_create("alice", &cfg()).await.unwrap();
        manager.get_or_create("broken-2", &cfg()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut evicted = manager.sweep(Duration::from_millis(5)).await;
        evicted.sort();

        assert_eq!(evicted, vec!["alice", "broken-1", "broken-2"]);
        assert!(manager.active_sessions().await.is_empty());
        assert_eq!(manager.connector.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_racing_get_or_create_never_yields_two_live_clients() {
        let manager = Arc::new(manager());
        let c = cfg();
        let first = manager.get_or_create("alice", &c).await.unwrap();

        let mut handed_out = vec![first];
        for _ in 0..20 {
            let getter = {
                let manager = Arc::clone(&manager);
                let c = c.clone();
                tokio::spawn(async move { manager.get_or_create("alice", &c).await })
            };
            let resetter = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.reset("alice").await })
            };
            resetter.await.unwrap();
            handed_out.push(getter.await.unwrap().unwrap());
        }

        let connects = manager.connector.connects.load(Ordering::SeqCst);
        let disconnected = manager.connector.disconnected.load(Ordering::SeqCst);
        let live = usize::from(manager.info("alice").await.is_some());
        assert_eq!(connects, disconnected + live);
        assert!(live <= 1);
        let serials: std::collections::HashSet<_> = handed_out.iter().map(|c| c.serial).collect();
        assert_eq!(serials.len(), connects);
    }

    #[tokio::test]
    async fn info_reports_config_snapshot() {
        let manager = manager();
        manager.get_or_create("alice", &cfg()).await.unwrap();

        let info = manager.info("alice").await.unwrap();

        assert_eq!(info.owner_key, "alice");
        assert_eq!(info.config, "model-a");
        assert_eq!(info.idle_secs, 0);
    }

    #[tokio::test]
    async fn sweeper_runs_periodically() {
        let manager = Arc::new(manager());
        manager.get_or_create("alice", &cfg()).await.unwrap();

        let sweeper = manager.spawn_sweeper(Duration::from_millis(20), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(manager.active_sessions().await.is_empty());
        sweeper.abort();
    }
}
