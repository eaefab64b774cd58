//! Cache Statistics
//!
//! Per-segment event counters and the aggregated snapshot returned by
//! [`SegmentedTable::stats`](super::SegmentedTable::stats).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Event counters owned by one segment
#[derive(Debug, Default)]
pub struct SegmentMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    put_adds: AtomicU64,
    put_replaces: AtomicU64,
    put_fails: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
    rehashes: AtomicU64,
}

impl SegmentMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put_add(&self) {
        self.put_adds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put_replace(&self) {
        self.put_replaces.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put_fail(&self) {
        self.put_fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rehash(&self) {
        self.rehashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn rehashes(&self) -> u64 {
        self.rehashes.load(Ordering::Relaxed)
    }

    /// Add this segment's counters into an aggregate
    pub fn accumulate(&self, stats: &mut CacheStats) {
        stats.hits += self.hits.load(Ordering::Relaxed);
        stats.misses += self.misses.load(Ordering::Relaxed);
        stats.put_adds += self.put_adds.load(Ordering::Relaxed);
        stats.put_replaces += self.put_replaces.load(Ordering::Relaxed);
        stats.put_fails += self.put_fails.load(Ordering::Relaxed);
        stats.removes += self.removes.load(Ordering::Relaxed);
        stats.evictions += self.evictions.load(Ordering::Relaxed);
        stats.rehashes += self.rehashes.load(Ordering::Relaxed);
    }

    /// Zero all event counters
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.put_adds.store(0, Ordering::Relaxed);
        self.put_replaces.store(0, Ordering::Relaxed);
        self.put_fails.store(0, Ordering::Relaxed);
        self.removes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.rehashes.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the whole table.
///
/// Each segment is read independently, so under concurrent mutation the fields
/// may be skewed relative to each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub put_adds: u64,
    pub put_replaces: u64,
    pub put_fails: u64,
    pub removes: u64,
    pub evictions: u64,
    pub rehashes: u64,
    /// Number of entries
    pub size: u64,
    /// Configured capacity in bytes
    pub capacity: u64,
    /// Bytes held by entries
    pub mem_used: u64,
    /// `capacity - mem_used`
    pub free_capacity: u64,
    /// Bytes outstanding in the allocator (entries and stream buffers)
    pub total_allocated: u64,
    /// Entries per segment
    pub segment_sizes: Vec<u64>,
}

impl CacheStats {
    /// Fraction of lookups that hit
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total put operations attempted
    pub fn put_count(&self) -> u64 {
        self.put_adds + self.put_replaces + self.put_fails
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "size={} mem_used={} capacity={} hits={} misses={} hit_ratio={:.2}% evictions={} puts(add={}, replace={}, fail={}) removes={} rehashes={}",
            self.size,
            self.mem_used,
            self.capacity,
            self.hits,
            self.misses,
            self.hit_ratio() * 100.0,
            self.evictions,
            self.put_adds,
            self.put_replaces,
            self.put_fails,
            self.removes,
            self.rehashes
        )
    }
}
