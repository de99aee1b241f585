//! Cache Statistics Module
//!
//! Tracks cache performance metrics. Counters are atomics so the concurrent
//! engine can record from any thread without locking.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Live performance counters for a cache engine.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the hit counter.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the miss counter.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the eviction counter.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_entries: 0,
            current_size: 0,
        }
    }
}

// == Stats Snapshot ==
/// A consistent-enough view of the counters, enriched by the engine with
/// table size figures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Number of entries evicted by expiration or capacity pressure
    pub evictions: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
    /// Current running size total (0 when no size limit is configured)
    pub current_size: i64,
}

impl StatsSnapshot {
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
