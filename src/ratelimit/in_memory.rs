use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;

use crate::{
    error::BackendResult,
    ratelimit::{CounterBackend, CounterSnapshot, KeyTtl},
};

/// Expiry given to a brand-new key until the caller sets its window.
const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(60);

/// Process-local counters. Each key is mutated under its shard lock, so
/// concurrent hits on one key never lose an update.
pub struct InMemoryCounterBackend {
    entries: DashMap<String, CounterEntry>,
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn fresh(now: Instant) -> Self {
        Self {
            count: 1,
            expires_at: Some(now + DEFAULT_ENTRY_TTL),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl Default for InMemoryCounterBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn increment_now(&self, key: &str) -> u64 {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CounterEntry::fresh(now);
                } else {
                    entry.count += 1;
                }
                entry.count
            }
            Entry::Vacant(vacant) => vacant.insert(CounterEntry::fresh(now)).count,
        }
    }

    pub fn decrement_now(&self, key: &str) -> u64 {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.count = entry.count.saturating_sub(1);
                entry.count
            }
            _ => 0,
        }
    }

    pub fn expire_now(&self, key: &str, ttl: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    pub fn ttl_now(&self, key: &str) -> KeyTtl {
        let now = Instant::now();
        let ttl = match self.entries.get(key) {
            None => return KeyTtl::Missing,
            Some(entry) if entry.is_expired(now) => None,
            Some(entry) => Some(match entry.expires_at {
                Some(at) => KeyTtl::Remaining(at.saturating_duration_since(now)),
                None => KeyTtl::Persistent,
            }),
        };

        ttl.unwrap_or_else(|| {
            self.remove_if_expired(key, now);
            KeyTtl::Missing
        })
    }

    pub fn get_now(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let count = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then_some(entry.count));

        match count {
            Some(Some(count)) => Some(count),
            Some(None) => {
                self.remove_if_expired(key, now);
                None
            }
            None => None,
        }
    }

    pub fn del_now(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Fixed-window hit against local counters. Infallible, which is what
    /// makes this backend the fallback of last resort. The count and the
    /// window start are written under one shard lock, so a concurrent hit
    /// never sees the placeholder expiry.
    pub fn hit_now(&self, key: &str, window: Duration) -> CounterSnapshot {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(CounterEntry {
                count: 0,
                expires_at: None,
            });

        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = None;
        }
        entry.count += 1;
        if entry.count == 1 || entry.expires_at.is_none() {
            entry.expires_at = Some(now + window);
        }

        let ttl = match entry.expires_at {
            Some(at) => KeyTtl::Remaining(at.saturating_duration_since(now)),
            None => KeyTtl::Persistent,
        };
        CounterSnapshot::from_ttl(entry.count, ttl, window)
    }

    /// Drops every expired entry without reading keys individually. Returns
    /// the number of evicted entries.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl CounterBackend for InMemoryCounterBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &str) -> BackendResult<u64> {
        Ok(self.increment_now(key))
    }

    async fn decrement(&self, key: &str) -> BackendResult<u64> {
        Ok(self.decrement_now(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> BackendResult<()> {
        self.expire_now(key, ttl);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> BackendResult<KeyTtl> {
        Ok(self.ttl_now(key))
    }

    async fn get(&self, key: &str) -> BackendResult<Option<u64>> {
        Ok(self.get_now(key))
    }

    async fn del(&self, key: &str) -> BackendResult<()> {
        self.del_now(key);
        Ok(())
    }

    async fn hit(&self, key: &str, window: Duration) -> BackendResult<CounterSnapshot> {
        Ok(self.hit_now(key, window))
    }
}
