pub mod cleanup;
pub mod health;
pub mod in_memory;
pub mod redis_backend;
pub mod store;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::BackendResult;

/// Remaining lifetime of a counter key, mirroring redis `TTL` semantics
/// (`-2` missing, `-1` no expiry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Remaining(Duration),
}

/// Result of counting one hit inside a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u64,
    pub ttl_secs: u64,
    /// Exact time left in the window; `ttl_secs` is this rounded up.
    pub reset_in: Duration,
}

impl CounterSnapshot {
    pub fn from_ttl(count: u64, ttl: KeyTtl, window: Duration) -> Self {
        let reset_in = match ttl {
            KeyTtl::Remaining(left) => left,
            KeyTtl::Missing | KeyTtl::Persistent => window,
        };
        Self {
            count,
            ttl_secs: ceil_secs(reset_in),
            reset_in,
        }
    }
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1_000) as u64
}

#[async_trait]
pub trait CounterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Adds one to `key`, creating it at 1 when absent or expired. Never
    /// touches an existing expiry.
    async fn increment(&self, key: &str) -> BackendResult<u64>;

    /// Subtracts one from a live counter, never below zero and never creating
    /// the key.
    async fn decrement(&self, key: &str) -> BackendResult<u64>;

    async fn expire(&self, key: &str, ttl: Duration) -> BackendResult<()>;

    async fn ttl(&self, key: &str) -> BackendResult<KeyTtl>;

    async fn get(&self, key: &str) -> BackendResult<Option<u64>>;

    async fn del(&self, key: &str) -> BackendResult<()>;

    /// Counts a hit in a fixed window: the first hit (or a key that somehow
    /// lost its expiry) starts the window, later hits leave it alone.
    async fn hit(&self, key: &str, window: Duration) -> BackendResult<CounterSnapshot> {
        let count = self.increment(key).await?;
        let ttl = self.ttl(key).await?;

        if count == 1 || !matches!(ttl, KeyTtl::Remaining(_)) {
            self.expire(key, window).await?;
            return Ok(CounterSnapshot::from_ttl(count, KeyTtl::Remaining(window), window));
        }

        Ok(CounterSnapshot::from_ttl(count, ttl, window))
    }

    async fn shutdown(&self) {}
}

/// Opens the remote backend. The store keeps one around so it can dial again
/// after a failed startup connection.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> BackendResult<Arc<dyn CounterBackend>>;
}
