//! In-memory expiring cache for keyed entries.
//!
//! Expiry is checked on every read and can additionally be swept
//! periodically. Time comes from `tokio::time::Instant` so a paused test
//! runtime controls it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Default TTL of the signal key cache (5 minutes).
pub const SIGNAL_STORE_TTL: Duration = Duration::from_secs(5 * 60);

/// Minimal cache capability so callers can share or replace the cache.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Bytes>;
    fn set(&self, key: &str, value: Bytes);
    fn del(&self, key: &str);
    fn flush_all(&self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.inserted_at) >= ttl,
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct ExpiringCache {
    default_ttl: Option<Duration>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ExpiringCache {
    /// `None` keeps entries until they are deleted or flushed.
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    pub fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.lock().insert(key.to_string(), entry);
    }

    /// Drop every expired entry; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.entries.lock();
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_expired(now));
        let evicted = before - guard.len();
        if evicted > 0 {
            trace!(evicted, "swept expired cache entries");
        }
        evicted
    }

    /// Sweep on a fixed interval until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}

impl Default for ExpiringCache {
    fn default() -> Self {
        Self::new(Some(SIGNAL_STORE_TTL))
    }
}

impl CacheStore for ExpiringCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut guard = self.entries.lock();
        match guard.get(key) {
            Some(entry) if entry.is_expired(now) => {
                guard.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn set(&self, key: &str, value: Bytes) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    fn del(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn flush_all(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
