//! In-process TTL cache for fallback values

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

/// Default bound on the number of entries
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Thread-safe TTL cache keyed by string
pub struct LocalCache {
    entries: DashMap<String, Entry>,
    default_ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct Entry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

impl LocalCache {
    /// Create an empty cache whose entries live for `default_ttl`
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Limit the number of entries; the oldest entry is evicted first
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Value for `key`, unless missing or expired.
    ///
    /// Expired entries are evicted on access.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store `value` with the default TTL
    pub fn set(&self, key: &str, value: Value) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store `value` with an explicit TTL
    pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict expired entries (background maintenance)
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let count = before.saturating_sub(self.entries.len());
        if count > 0 {
            self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().stored_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Statistics snapshot
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> LocalCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        LocalCacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("size", &self.entries.len())
            .field("default_ttl", &self.default_ttl)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalCacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries dropped for age or capacity
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hit_and_miss() {
        let cache = LocalCache::new(Duration::from_secs(60));
        cache.set("ticker:BTC-USD", json!({"price": "67000.10"}));

        assert_eq!(cache.get("ticker:BTC-USD"), Some(json!({"price": "67000.10"})));
        assert_eq!(cache.get("ticker:ETH-USD"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_evicted_on_read() {
        let cache = LocalCache::new(Duration::from_secs(60));
        cache.set_with_ttl("short", json!(1), Duration::from_millis(100));
        cache.set("long", json!(2));

        tokio::time::advance(Duration::from_millis(200)).await;

        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(json!(2)));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_sweeps() {
        let cache = LocalCache::new(Duration::from_millis(50));
        cache.set("a", json!("a"));
        cache.set("b", json!("b"));
        tokio::time::advance(Duration::from_millis(100)).await;
        cache.set("c", json!("c"));

        assert_eq!(cache.evict_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = LocalCache::new(Duration::from_secs(60)).with_max_entries(2);
        cache.set("first", json!(1));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("second", json!(2));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("third", json!(3));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("first"), None);
        assert_eq!(cache.get("third"), Some(json!(3)));
    }
}
