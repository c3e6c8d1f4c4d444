//! Get-or-compute response cache with a fixed time-to-live.
//!
//! Keys are request URLs (path + query string). Each key owns an async mutex, so concurrent misses
//! on the same key run the computation once: later callers wait for the first one and then read
//! its stored value. Failed computations store nothing and give their slot back. Expired entries
//! stay in place until [`ResponseCache::evict_expired`] sweeps them.

use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{sync::Mutex, time::Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type Slot<V> = Arc<Mutex<Option<Entry<V>>>>;

/// Shared response cache. Clone-free: wrap it in an `Arc` to share it.
pub struct ResponseCache<V = String> {
    ttl: Duration,
    slots: DashMap<String, Slot<V>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the live value for `key`, or run `compute`, store its result for one TTL and
    /// return it.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = match self.slots.get(key) {
            Some(slot) => Arc::clone(slot.value()),
            None => Arc::clone(self.slots.entry(key.to_string()).or_default().value()),
        };

        let mut entry = slot.lock().await;
        if let Some(live) = entry.as_ref().filter(|e| e.expires_at > Instant::now()) {
            tracing::debug!(event = "cache_hit", key = %key);
            return Ok(live.value.clone());
        }

        tracing::debug!(event = "cache_miss", key = %key, stale = entry.is_some());
        let value = match compute().await {
            Ok(value) => value,
            Err(err) => {
                let vacant = entry.is_none();
                drop(entry);
                if vacant {
                    self.release_slot(key, &slot);
                }
                return Err(err);
            }
        };
        *entry = Some(Entry {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(value)
    }

    /// Remove `slot` from the map unless a value landed in it or another caller holds it.
    fn release_slot(&self, key: &str, slot: &Slot<V>) {
        self.slots.remove_if(key, |_, current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(current) == 2
                && current.try_lock().is_ok_and(|e| e.is_none())
        });
    }

    /// Drop expired entries and empty slots nobody is waiting on. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry.as_ref().is_some_and(|e| e.expires_at > now),
                Err(_) => true,
            }
        });
        let evicted = before.saturating_sub(self.slots.len());
        if evicted > 0 {
            tracing::debug!(event = "cache_evicted", evicted);
        }
        evicted
    }

    /// Drop every entry, live or not.
    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Number of keys that hold a value (live or expired but not yet evicted) or are being
    /// computed.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
