//! Failover front for the rate-limit counters.
//!
//! The store routes every operation to the remote backend while it is
//! healthy and silently serves it from the in-process map otherwise. Callers
//! never see a connectivity error: the worst case is per-process counting.
//!
//! Each process owns its own fallback map. With several gateway processes and
//! the remote backend down, every process enforces the limit on its own, so
//! the effective limit across the fleet is looser. That is accepted rather
//! than papered over.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use tokio::{sync::OnceCell, task::JoinHandle};

use crate::{
    config::StoreConfig,
    error::BackendError,
    ratelimit::{
        CounterBackend,
        CounterSnapshot,
        RemoteConnector,
        cleanup::spawn_cleanup,
        health::{BackendHealth, HealthState},
        in_memory::InMemoryCounterBackend,
        redis_backend::RedisConnector,
    },
};

static SHARED: OnceCell<Arc<RateLimitStore>> = OnceCell::const_new();

/// The process-wide store, created on first use.
pub async fn shared(cfg: &StoreConfig) -> Arc<RateLimitStore> {
    SHARED
        .get_or_init(|| async { Arc::new(RateLimitStore::connect(cfg).await) })
        .await
        .clone()
}

/// Closes the process-wide store. It stays in place and serves locally, but
/// no longer holds a remote connection.
pub async fn close_shared() {
    if let Some(store) = SHARED.get() {
        store.close().await;
    }
}

type RemoteSlot = Option<Arc<dyn CounterBackend>>;

pub struct RateLimitStore {
    remote: RwLock<RemoteSlot>,
    connector: Option<Arc<dyn RemoteConnector>>,
    local: Arc<InMemoryCounterBackend>,
    health: BackendHealth,
    namespace: String,
    cleanup_interval: Duration,
    reconnect_interval: Option<Duration>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimitStore {
    /// Picks the backend eagerly. The remote backend is skipped in the test
    /// environment and when no host is configured; a failed connection leaves
    /// the store on local counters from the start.
    pub async fn connect(cfg: &StoreConfig) -> Self {
        let redis_cfg = match &cfg.redis {
            Some(redis) if cfg.app_env.uses_remote_store() => redis,
            Some(_) => {
                tracing::info!("test environment; rate limit counters kept in memory");
                return Self::build(None, None, HealthState::Uninitialized, cfg);
            }
            None => {
                tracing::info!("no REDIS_HOST configured; rate limit counters kept in memory");
                return Self::build(None, None, HealthState::Uninitialized, cfg);
            }
        };

        tracing::info!(
            host = %redis_cfg.host,
            port = redis_cfg.port,
            "connecting rate limit store to redis"
        );
        Self::with_connector(Arc::new(RedisConnector::new(redis_cfg.clone())), cfg).await
    }

    /// Dials the remote once. On failure the connector is kept, so a later
    /// reconnect attempt can dial again.
    pub async fn with_connector(connector: Arc<dyn RemoteConnector>, cfg: &StoreConfig) -> Self {
        match connector.connect().await {
            Ok(remote) => {
                tracing::info!(backend = remote.name(), "rate limit store connected");
                Self::build(Some(remote), Some(connector), HealthState::Connected, cfg)
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "remote rate limit backend unavailable at startup; counters kept in memory"
                );
                let store = Self::build(None, Some(connector), HealthState::Connecting, cfg);
                store.health.mark_failed();
                store
            }
        }
    }

    /// Builds an isolated store around an already constructed remote backend.
    /// Must be called inside a tokio runtime.
    pub fn with_backends(remote: Option<Arc<dyn CounterBackend>>, cfg: &StoreConfig) -> Self {
        let state = if remote.is_some() {
            HealthState::Connected
        } else {
            HealthState::Uninitialized
        };
        Self::build(remote, None, state, cfg)
    }

    fn build(
        remote: RemoteSlot,
        connector: Option<Arc<dyn RemoteConnector>>,
        state: HealthState,
        cfg: &StoreConfig,
    ) -> Self {
        let store = Self {
            remote: RwLock::new(remote),
            connector,
            local: Arc::new(InMemoryCounterBackend::new()),
            health: BackendHealth::new(state),
            namespace: format!("{}ratelimit:", cfg.key_prefix),
            cleanup_interval: cfg.cleanup_interval,
            reconnect_interval: cfg.reconnect_interval,
            cleanup: Mutex::new(None),
        };
        if state != HealthState::Connected {
            store.ensure_cleanup();
        }
        store
    }

    pub fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub fn health(&self) -> HealthState {
        self.health.state()
    }

    /// Which backend would serve a request right now.
    pub fn counter_backend(&self) -> &'static str {
        match (self.current_remote(), self.health.state()) {
            (Some(_), HealthState::Connected) => "remote",
            _ => "local",
        }
    }

    pub async fn increment(&self, key: &str, window: Duration) -> CounterSnapshot {
        let key = self.namespaced(key);
        if let Some(remote) = self.routable_remote().await {
            match remote.hit(&key, window).await {
                Ok(snapshot) => {
                    self.on_remote_success();
                    return snapshot;
                }
                Err(err) => self.on_remote_failure("increment", &err),
            }
        }
        self.local.hit_now(&key, window)
    }

    pub async fn decrement(&self, key: &str) -> u64 {
        let key = self.namespaced(key);
        if let Some(remote) = self.routable_remote().await {
            match remote.decrement(&key).await {
                Ok(count) => {
                    self.on_remote_success();
                    return count;
                }
                Err(err) => self.on_remote_failure("decrement", &err),
            }
        }
        self.local.decrement_now(&key)
    }

    pub async fn get(&self, key: &str) -> Option<u64> {
        let key = self.namespaced(key);
        if let Some(remote) = self.routable_remote().await {
            match remote.get(&key).await {
                Ok(count) => {
                    self.on_remote_success();
                    return count;
                }
                Err(err) => self.on_remote_failure("get", &err),
            }
        }
        self.local.get_now(&key)
    }

    pub async fn reset(&self, key: &str) {
        let key = self.namespaced(key);
        if let Some(remote) = self.routable_remote().await {
            match remote.del(&key).await {
                Ok(()) => {
                    self.on_remote_success();
                    return;
                }
                Err(err) => self.on_remote_failure("reset", &err),
            }
        }
        self.local.del_now(&key);
    }

    /// Stops the cleanup task and drops the remote client. Later calls are
    /// served locally.
    pub async fn close(&self) {
        if let Some(handle) = self.cleanup_slot().take() {
            handle.abort();
        }

        self.health.mark_closed();
        let remote = self.remote_slot().take();
        if let Some(remote) = remote {
            remote.shutdown().await;
        }
        tracing::info!("rate limit store closed");
    }

    /// The remote to use for this call, if any. A failed remote is only
    /// handed out to the single caller that wins the reconnect probe; every
    /// other caller stays local meanwhile.
    async fn routable_remote(&self) -> RemoteSlot {
        match self.health.state() {
            HealthState::Connected => self.current_remote(),
            HealthState::Failed => {
                let interval = self.reconnect_interval?;
                let existing = self.current_remote();
                if existing.is_none() && self.connector.is_none() {
                    return None;
                }
                if !self.health.try_begin_probe(interval) {
                    return None;
                }
                tracing::info!("probing remote rate limit backend");
                if existing.is_some() {
                    return existing;
                }
                self.redial().await
            }
            _ => None,
        }
    }

    async fn redial(&self) -> RemoteSlot {
        let Some(connector) = &self.connector else {
            self.health.mark_failed();
            return None;
        };

        match connector.connect().await {
            Ok(remote) => {
                if self.health.state() == HealthState::Closed {
                    remote.shutdown().await;
                    return None;
                }
                *self.remote_slot() = Some(remote.clone());
                Some(remote)
            }
            Err(err) => {
                self.on_remote_failure("connect", &err);
                None
            }
        }
    }

    fn on_remote_success(&self) {
        if self.health.mark_connected() {
            tracing::info!("remote rate limit backend recovered");
        }
    }

    fn on_remote_failure(&self, op: &'static str, err: &BackendError) {
        if self.health.mark_failed() {
            tracing::warn!(
                op,
                error = %err,
                "remote rate limit backend failed; falling back to in-memory counters"
            );
        } else {
            tracing::debug!(op, error = %err, "remote rate limit backend still failing");
        }
        self.ensure_cleanup();
    }

    fn ensure_cleanup(&self) {
        let mut slot = self.cleanup_slot();
        if slot.is_none() && self.health.state() != HealthState::Closed {
            *slot = Some(spawn_cleanup(self.local.clone(), self.cleanup_interval));
        }
    }

    fn current_remote(&self) -> RemoteSlot {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remote_slot(&self) -> std::sync::RwLockWriteGuard<'_, RemoteSlot> {
        self.remote.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn cleanup_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.cleanup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn local_len(&self) -> usize {
        self.local.len()
    }

    #[cfg(test)]
    fn cleanup_running(&self) -> bool {
        self.cleanup_slot().is_some()
    }
}

impl Drop for RateLimitStore {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_slot().take() {
            handle.abort();
        }
    }
}
