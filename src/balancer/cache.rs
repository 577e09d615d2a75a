//! Response Cache
//!
//! TTL cache for successful reads, keyed by request key.
//!
//! ## Usage
//!
//! ```
//! use std::time::Duration;
//! use request_balancer::balancer::ResponseCache;
//!
//! let cache: ResponseCache<String> = ResponseCache::new(200);
//!
//! cache.store("/api/courts", "[]".to_string(), Duration::from_secs(30));
//! assert_eq!(cache.lookup("/api/courts"), Some("[]".to_string()));
//!
//! // Writes to a resource drop every related read
//! cache.invalidate("/api/courts");
//! assert_eq!(cache.lookup("/api/courts"), None);
//! ```

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache entry with expiration
#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// In-memory response cache with lazy expiry.
///
/// Expired entries are dropped when looked up, and swept in bulk whenever
/// the entry count grows past `sweep_threshold`. The threshold is not a
/// capacity: live entries are never evicted to make room.
pub struct ResponseCache<T> {
    store: DashMap<String, CacheEntry<T>>,
    sweep_threshold: usize,
}

impl<T: Clone> ResponseCache<T> {
    /// Create a cache that sweeps expired entries once it holds more than
    /// `sweep_threshold` keys.
    pub fn new(sweep_threshold: usize) -> Self {
        Self {
            store: DashMap::new(),
            sweep_threshold,
        }
    }

    /// Get cached value if it exists and has not expired.
    pub fn lookup(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired(now) {
                debug!(key = key, "cache hit");
                return Some(entry.value.clone());
            }
            // Release the shard read guard before removing.
            drop(entry);
            self.store.remove_if(key, |_, e| e.is_expired(now));
            debug!(key = key, "cache entry expired");
        }
        debug!(key = key, "cache miss");
        None
    }

    /// Store a value for `ttl`. A zero TTL stores nothing; a TTL too large
    /// to add to the current instant (such as `Duration::MAX`) never expires.
    pub fn store(&self, key: impl Into<String>, value: T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let key = key.into();
        self.store.insert(
            key.clone(),
            CacheEntry {
                value,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        debug!(key = key.as_str(), ttl_ms = ttl.as_millis() as u64, "cached");

        if self.store.len() > self.sweep_threshold {
            self.sweep_expired();
        }
    }

    /// Remove every key that starts with or contains `pattern`.
    ///
    /// Plain substring matching: invalidating `/api/court` also clears
    /// `/api/courts/42/schedules`. Returns the number of removed entries.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut removed = 0;
        self.store.retain(|key, _| {
            let hit = key.contains(pattern);
            removed += usize::from(hit);
            !hit
        });
        debug!(pattern = pattern, removed = removed, "cache invalidated");
        removed
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.store.retain(|_, entry| {
            let expired = entry.is_expired(now);
            removed += usize::from(expired);
            !expired
        });
        if removed > 0 {
            debug!(removed = removed, "swept expired cache entries");
        }
        removed
    }

    /// Clear all cached values
    pub fn clear(&self) {
        self.store.clear();
        debug!("cleared response cache");
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
