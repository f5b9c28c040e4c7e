//! Time-bounded cache over a pluggable backing store
//!
//! [`TtlCache`] exposes `get` / `set` / `invalidate` and stamps every entry
//! with the injected [`Clock`]. Entries older than the TTL are treated as
//! absent and evicted on read. The backing store decides capacity and
//! eviction order; [`LruStore`] keeps a bounded LRU in memory.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use crate::clock::SharedClock;

/// A cached value and the time it was stored
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: DateTime<Utc>,
}

/// Backing store for [`TtlCache`]
pub trait CacheStore<K, V>: Send + Sync {
    fn load(&self, key: &K) -> Option<CacheEntry<V>>;
    fn store(&self, key: K, entry: CacheEntry<V>);
    fn remove(&self, key: &K) -> Option<CacheEntry<V>>;
    fn clear(&self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory LRU store
pub struct LruStore<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, CacheEntry<V>>>,
}

impl<K: Hash + Eq, V> LruStore<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl<K, V> CacheStore<K, V> for LruStore<K, V>
where
    K: Hash + Eq + Send,
    V: Clone + Send,
{
    fn load(&self, key: &K) -> Option<CacheEntry<V>> {
        self.inner.lock().get(key).cloned()
    }

    fn store(&self, key: K, entry: CacheEntry<V>) {
        self.inner.lock().put(key, entry);
    }

    fn remove(&self, key: &K) -> Option<CacheEntry<V>> {
        self.inner.lock().pop(key)
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Cache whose entries expire after a fixed TTL
pub struct TtlCache<K, V> {
    store: Arc<dyn CacheStore<K, V>>,
    clock: SharedClock,
    ttl: Duration,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            ttl: self.ttl,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Cache backed by a bounded in-memory LRU
    pub fn in_memory(capacity: usize, clock: SharedClock, ttl: Duration) -> Self {
        Self::new(Arc::new(LruStore::new(capacity)), clock, ttl)
    }
}

impl<K, V> TtlCache<K, V>
where
    K: 'static,
    V: Clone + 'static,
{
    pub fn new(store: Arc<dyn CacheStore<K, V>>, clock: SharedClock, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.store.load(key)?;
        if self.clock.now() - entry.stored_at >= self.ttl {
            self.store.remove(key);
            return None;
        }
        Some(entry.value)
    }

    pub fn set(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now(),
        };
        self.store.store(key, entry);
    }

    /// Drop a single entry. Returns whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.store.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
