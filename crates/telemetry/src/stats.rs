// Path: crates/telemetry/src/stats.rs
//! Cache hit/miss counters shared between a node database and its owner.

use std::sync::atomic::{AtomicU64, Ordering};

/// Node and fast-node cache statistics. All counters are updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct Statistics {
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,
    fast_cache_hit: AtomicU64,
    fast_cache_miss: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fast_cache_hit(&self) {
        self.fast_cache_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fast_cache_miss(&self) {
        self.fast_cache_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) -> u64 {
        self.cache_hit.load(Ordering::Relaxed)
    }

    pub fn cache_miss(&self) -> u64 {
        self.cache_miss.load(Ordering::Relaxed)
    }

    pub fn fast_cache_hit(&self) -> u64 {
        self.fast_cache_hit.load(Ordering::Relaxed)
    }

    pub fn fast_cache_miss(&self) -> u64 {
        self.fast_cache_miss.load(Ordering::Relaxed)
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.cache_hit.store(0, Ordering::Relaxed);
        self.cache_miss.store(0, Ordering::Relaxed);
        self.fast_cache_hit.store(0, Ordering::Relaxed);
        self.fast_cache_miss.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_accumulate_across_threads() {
        let stats = Arc::new(Statistics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.inc_cache_hit();
                        stats.inc_fast_cache_miss();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.cache_hit(), 400);
        assert_eq!(stats.fast_cache_miss(), 400);
        assert_eq!(stats.cache_miss(), 0);

        stats.reset();
        assert_eq!(stats.cache_hit(), 0);
        assert_eq!(stats.fast_cache_miss(), 0);
    }
}
