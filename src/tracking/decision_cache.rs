//! Sharded, time-expiring LRU map from fingerprint to decision.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Hit/miss counters for a cache
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Entries dropped because their TTL elapsed
    pub expired: u64,
    /// Live entries across all shards
    pub entries: usize,
}

/// Bounded cache keyed by 64-bit fingerprints.
///
/// Entries expire `ttl` after insertion; with `refresh_on_hit` a hit pushes
/// the expiry forward. Each shard is an independent LRU so unrelated
/// fingerprints never contend on the same lock.
pub struct DecisionCache<V> {
    shards: Vec<Mutex<LruCache<u64, Entry<V>>>>,
    ttl: Duration,
    refresh_on_hit: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone> DecisionCache<V> {
    /// Create a cache holding at most roughly `max_size` entries
    pub fn new(max_size: usize, shards: usize, ttl: Duration) -> Self {
        let shard_count = shards.clamp(1, max_size.max(1));
        let per_shard = NonZeroUsize::new(max_size.div_ceil(shard_count).max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            ttl,
            refresh_on_hit: true,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Keep the original expiry on hits
    pub fn without_refresh(mut self) -> Self {
        self.refresh_on_hit = false;
        self
    }

    fn shard(&self, key: u64) -> &Mutex<LruCache<u64, Entry<V>>> {
        // High bits pick the shard; the LRU itself hashes the full key.
        let idx = ((key >> 32) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Look up a live entry
    pub fn get_at(&self, key: u64, now: Instant) -> Option<V> {
        let mut shard = self.shard(key).lock();
        let found = match shard.get_mut(&key) {
            Some(entry) if entry.expires_at > now => {
                if self.refresh_on_hit {
                    entry.expires_at = now + self.ttl;
                }
                Some(entry.value.clone())
            },
            Some(_) => {
                shard.pop(&key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                None
            },
            None => None,
        };
        drop(shard);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert or replace an entry, evicting the shard's LRU entry when full
    pub fn insert_at(&self, key: u64, value: V, now: Instant) {
        self.shard(key).lock().put(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Insert only if no live entry exists. Returns the live value when one
    /// was already present, so concurrent inserters agree on a single value.
    pub fn get_or_insert_at(&self, key: u64, value: V, now: Instant) -> Option<V> {
        let mut shard = self.shard(key).lock();
        if let Some(entry) = shard.get_mut(&key) {
            if entry.expires_at > now {
                if self.refresh_on_hit {
                    entry.expires_at = now + self.ttl;
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        shard.put(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
        None
    }

    /// Remove expired entries from every shard
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let stale: Vec<u64> = shard
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                shard.pop(&key);
                removed += 1;
            }
        }
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Total entries across shards, including not yet purged expired ones
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// True when every shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity across all shards
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.lock().cap().get()).sum()
    }

    /// Snapshot of the hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_within_ttl() {
        let now = Instant::now();
        let cache = DecisionCache::new(16, 4, Duration::from_secs(60));
        cache.insert_at(42, true, now);

        assert_eq!(cache.get_at(42, now + Duration::from_secs(30)), Some(true));
        assert_eq!(cache.get_at(7, now), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_is_removed() {
        let now = Instant::now();
        let cache = DecisionCache::new(16, 1, Duration::from_secs(10)).without_refresh();
        cache.insert_at(1, "keep", now);

        assert_eq!(cache.get_at(1, now + Duration::from_secs(5)), Some("keep"));
        assert_eq!(cache.get_at(1, now + Duration::from_secs(10)), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn test_hit_refreshes_expiry() {
        let now = Instant::now();
        let cache = DecisionCache::new(16, 1, Duration::from_secs(10));
        cache.insert_at(1, 1u8, now);

        assert!(cache.get_at(1, now + Duration::from_secs(8)).is_some());
        assert!(cache.get_at(1, now + Duration::from_secs(15)).is_some());
        assert!(cache.get_at(1, now + Duration::from_secs(26)).is_none());
    }

    #[test]
    fn test_lru_eviction_bounds_size() {
        let now = Instant::now();
        let cache = DecisionCache::new(4, 1, Duration::from_secs(60));
        for key in 0..10u64 {
            cache.insert_at(key, key, now);
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get_at(0, now), None);
        assert_eq!(cache.get_at(9, now), Some(9));
    }

    #[test]
    fn test_get_or_insert_keeps_first_value() {
        let now = Instant::now();
        let cache = DecisionCache::new(8, 2, Duration::from_secs(60));
        assert_eq!(cache.get_or_insert_at(5, 'a', now), None);
        assert_eq!(cache.get_or_insert_at(5, 'b', now), Some('a'));
    }

    #[test]
    fn test_purge_expired() {
        let now = Instant::now();
        let cache = DecisionCache::new(8, 2, Duration::from_secs(10));
        cache.insert_at(1u64 << 40, (), now);
        cache.insert_at(2, (), now + Duration::from_secs(8));
        assert_eq!(cache.purge_expired_at(now + Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
    }
}
