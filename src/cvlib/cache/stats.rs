use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a cache, safe to update through `&self`.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
    /// Between 0 and 1, 0 if nothing was requested yet.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

#[test]
fn test_stats() {
    let stats = CacheStats::default();
    assert_eq!(stats.hit_ratio(), 0.0);
    stats.record_hit();
    stats.record_hit();
    stats.record_miss();
    stats.record_insert();
    assert_eq!(stats.hit_ratio(), 2.0 / 3.0);
    assert_eq!(stats.inserts(), 1);
    stats.reset();
    assert_eq!(stats.hits(), 0);
    assert_eq!(stats.evictions(), 0);
}
