// Path: crates/state/src/cache.rs
//! A bounded LRU keyed by node identity, scoped to one node database.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// A thread-safe LRU. A capacity of zero disables caching entirely.
#[derive(Debug)]
pub struct Cache<K: Hash + Eq, V: Clone> {
    inner: Option<Mutex<LruCache<K, V>>>,
}

impl<K: Hash + Eq, V: Clone> Cache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.as_ref()?.lock().get(key).cloned()
    }

    pub fn has(&self, key: &K) -> bool {
        self.inner
            .as_ref()
            .map_or(false, |c| c.lock().contains(key))
    }

    pub fn add(&self, key: K, value: V) {
        if let Some(c) = &self.inner {
            c.lock().put(key, value);
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.as_ref()?.lock().pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(c) = &self.inner {
            c.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = Cache::new(2);
        cache.add(1, "a");
        cache.add(2, "b");
        assert_eq!(cache.get(&1), Some("a")); // 2 is now the oldest
        cache.add(3, "c");
        assert!(!cache.has(&2));
        assert!(cache.has(&1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.remove(&3), Some("c"));
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let cache = Cache::new(0);
        cache.add(1u8, 1u8);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }
}
