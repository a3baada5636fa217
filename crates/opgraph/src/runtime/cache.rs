//! Capacity-bounded, thread-safe LRU cache.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Key → shared value store with least-recently-used eviction.
///
/// Values are stored as `Arc<V>` so a lookup hands out the whole entry or nothing. The mutex only
/// guards the index; callers build values (e.g. compile programs) before calling [`Cache::add`].
pub struct Cache<K, V> {
    entries: Mutex<LruCache<K, Arc<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq, V> Cache<K, V> {
    /// Creates a cache holding at most `capacity` entries; zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, marking it most recently used on a hit.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let found = self.lock().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Looks up `key` without touching recency or statistics.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    /// Inserts or replaces `key`, evicting the least recently used entry when full.
    pub fn add(&self, key: K, value: Arc<V>) -> Arc<V> {
        let mut entries = self.lock();
        if !entries.contains(&key) && entries.len() == entries.cap().get() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            crate::profiling::cache_event("cache::evict");
        }
        entries.put(key, Arc::clone(&value));
        value
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Arc<V>>> {
        // Entries are whole `Arc`s, so a panic while holding the lock cannot leave a torn entry.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
