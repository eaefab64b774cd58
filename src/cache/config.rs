//! Table Configuration
//!
//! Resolved once at construction and passed to [`SegmentedTable::with_config`](super::SegmentedTable::with_config).

use serde::{Deserialize, Serialize};

use super::alloc::AllocatorKind;
use super::segment::MAX_BUCKETS;
use crate::error::{Error, Result};

/// Default total capacity (64 MiB)
pub const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default bucket directory size per segment
pub const DEFAULT_BUCKETS_PER_SEGMENT: usize = 256;

/// Default directory load factor
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// Upper bound on the number of segments
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Configuration for a [`SegmentedTable`](super::SegmentedTable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total capacity in bytes, split across segments
    pub capacity: u64,
    /// Number of segments (0 = derive from available parallelism)
    pub segment_count: usize,
    /// Initial bucket count of each segment (power of two)
    pub initial_buckets_per_segment: usize,
    /// Entries per bucket that trigger a directory resize
    pub load_factor: f32,
    /// Allocation strategy
    pub allocator: AllocatorKind,
    /// Track every allocation and report leaks on close
    pub debug_tracking: bool,
    /// Validate entry checksums on every read
    pub integrity_checks: bool,
    /// Largest accepted entry footprint (0 = segment capacity)
    pub max_entry_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            segment_count: 0,
            initial_buckets_per_segment: DEFAULT_BUCKETS_PER_SEGMENT,
            load_factor: DEFAULT_LOAD_FACTOR,
            allocator: AllocatorKind::default(),
            debug_tracking: false,
            integrity_checks: false,
            max_entry_size: 0,
        }
    }
}

impl CacheConfig {
    /// Configuration with the given capacity and defaults otherwise
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Total capacity in bytes across all segments
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Segment count, a power of two (0 derives it from available parallelism)
    pub fn with_segment_count(mut self, segment_count: usize) -> Self {
        self.segment_count = segment_count;
        self
    }

    /// Directory buckets each segment starts with
    pub fn with_initial_buckets(mut self, buckets: usize) -> Self {
        self.initial_buckets_per_segment = buckets;
        self
    }

    /// Entries per bucket before a segment doubles its directory
    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Allocator strategy for entries and stream buffers
    pub fn with_allocator(mut self, allocator: AllocatorKind) -> Self {
        self.allocator = allocator;
        self
    }

    /// Wrap the allocator in a leak and double-free tracker
    pub fn with_debug_tracking(mut self, enabled: bool) -> Self {
        self.debug_tracking = enabled;
        self
    }

    /// Verify entry checksums on every read
    pub fn with_integrity_checks(mut self, enabled: bool) -> Self {
        self.integrity_checks = enabled;
        self
    }

    /// Largest accepted entry footprint in bytes (0 caps it at the segment capacity)
    pub fn with_max_entry_size(mut self, bytes: u64) -> Self {
        self.max_entry_size = bytes;
        self
    }

    /// Check the configuration for values the table cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("capacity must be greater than zero".into()));
        }
        if self.segment_count != 0 {
            if !self.segment_count.is_power_of_two() {
                return Err(Error::Config(format!(
                    "segment count {} is not a power of two",
                    self.segment_count
                )));
            }
            if self.segment_count > MAX_SEGMENTS {
                return Err(Error::Config(format!(
                    "segment count {} exceeds the maximum of {}",
                    self.segment_count, MAX_SEGMENTS
                )));
            }
        }
        if !self.initial_buckets_per_segment.is_power_of_two()
            || self.initial_buckets_per_segment > MAX_BUCKETS
        {
            return Err(Error::Config(format!(
                "initial bucket count {} must be a power of two no larger than {}",
                self.initial_buckets_per_segment, MAX_BUCKETS
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(Error::Config(format!(
                "load factor {} must be in (0, 1]",
                self.load_factor
            )));
        }
        Ok(())
    }

    /// Segment count actually used by the table
    pub fn effective_segment_count(&self) -> usize {
        if self.segment_count != 0 {
            return self.segment_count;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus * 2).next_power_of_two().min(MAX_SEGMENTS)
    }
}
