//! TTL memoization with single-flight builds
//!
//! Each key owns a slot holding a `OnceCell`. Concurrent misses on the same
//! key await the one build in flight instead of racing their own. Slots
//! expire `ttl` after creation; a failed build leaves the slot empty so the
//! next caller retries.

use super::lru::LruTracker;
use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

struct Slot<V> {
    cell: OnceCell<V>,
    created: Instant,
}

impl<V> Slot<V> {
    fn new(now: Instant) -> Self {
        Slot {
            cell: OnceCell::new(),
            created: now,
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.created) >= ttl
    }
}

/// Counters for one cache namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Keyed TTL cache with LRU capacity bound
pub struct TtlCache<K: Clone + Eq + Hash, V> {
    ttl: Duration,
    max_entries: usize,
    slots: DashMap<K, Arc<Slot<V>>>,
    lru: Mutex<LruTracker<K>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create a cache; a zero `ttl` disables caching entirely
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        TtlCache {
            ttl,
            max_entries: max_entries.max(1),
            slots: DashMap::new(),
            lru: Mutex::new(LruTracker::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Live slot for `key`, replacing an expired one
    fn slot(&self, key: &K) -> Arc<Slot<V>> {
        let now = Instant::now();
        let mut entry = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new(now)));
        if entry.is_expired(self.ttl, now) {
            *entry = Arc::new(Slot::new(now));
        }
        entry.clone()
    }

    /// Return the cached value for `key`, running `build` on a miss
    pub async fn get_or_try_init<F, Fut>(&self, key: &K, build: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if !self.enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return build().await;
        }

        let slot = self.slot(key);
        let mut built = false;
        let value = match slot
            .cell
            .get_or_try_init(|| {
                built = true;
                build()
            })
            .await
        {
            Ok(value) => value.clone(),
            Err(e) => {
                // Keep failed lookups from piling up as empty slots
                self.slots
                    .remove_if(key, |_, s| Arc::ptr_eq(s, &slot) && s.cell.get().is_none());
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if built {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        self.track(key);
        Ok(value)
    }

    /// Cached value if present and fresh
    pub fn get(&self, key: &K) -> Option<V> {
        let slot = self.slots.get(key)?.clone();
        if slot.is_expired(self.ttl, Instant::now()) {
            return None;
        }
        slot.cell.get().cloned()
    }

    fn track(&self, key: &K) {
        let mut lru = self.lru.lock();
        lru.touch(key);
        while lru.len() > self.max_entries {
            match lru.pop_oldest() {
                Some(old) => {
                    self.slots.remove(&old);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Drop the entry for `key`
    pub fn invalidate(&self, key: &K) {
        self.slots.remove(key);
        self.lru.lock().remove(key);
    }

    /// Drop everything
    pub fn clear(&self) {
        self.slots.clear();
        self.lru.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.slots.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_hit_after_miss() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 10);
        let key = "a".to_string();

        let v = cache.get_or_try_init(&key, || async { Ok(1) }).await.unwrap();
        assert_eq!(v, 1);
        let v = cache.get_or_try_init(&key, || async { Ok(2) }).await.unwrap();
        assert_eq!(v, 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(cache.get(&key), Some(1));
    }

    #[tokio::test]
    async fn test_single_build_under_concurrency() {
        let cache: Arc<TtlCache<String, u32>> =
            Arc::new(TtlCache::new(Duration::from_secs(60), 10));
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_init(&"k".to_string(), || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(7)
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 10);
        let key = "a".to_string();

        let err = cache
            .get_or_try_init(&key, || async { Err(Error::NotFound("a".to_string())) })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.stats().entries, 0);

        let v = cache.get_or_try_init(&key, || async { Ok(3) }).await.unwrap();
        assert_eq!(v, 3);
    }

    #[tokio::test]
    async fn test_expiry() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(30), 10);
        let key = "a".to_string();

        cache.get_or_try_init(&key, || async { Ok(1) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&key), None);

        let v = cache.get_or_try_init(&key, || async { Ok(2) }).await.unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 2);

        cache.get_or_try_init(&1, || async { Ok(10) }).await.unwrap();
        cache.get_or_try_init(&2, || async { Ok(20) }).await.unwrap();
        // Touch 1 so 2 becomes the oldest
        cache.get_or_try_init(&1, || async { Ok(0) }).await.unwrap();
        cache.get_or_try_init(&3, || async { Ok(30) }).await.unwrap();

        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_disabled_always_builds() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::ZERO, 2);
        assert_eq!(cache.get_or_try_init(&1, || async { Ok(1) }).await.unwrap(), 1);
        assert_eq!(cache.get_or_try_init(&1, || async { Ok(2) }).await.unwrap(), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.get_or_try_init(&1, || async { Ok(1) }).await.unwrap();
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get_or_try_init(&1, || async { Ok(5) }).await.unwrap(), 5);
    }
}
