//! Segmented Table - The Cache Front Door
//!
//! Routes every key to exactly one [`Segment`] by the high bits of its hash and
//! aggregates capacity and statistics across segments.
//!
//! # Design
//!
//! - Power-of-two segment count fixed at construction; only segment capacities and
//!   per-segment directories change at runtime
//! - Entries are encoded outside any lock, then handed to the routed segment
//! - Aggregates (`size`, `mem_used`) sum per-segment mirrors without a global lock,
//!   so they may be skewed under concurrent mutation
//! - Eviction is strict LRU per segment, approximate across the table

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::alloc::{Allocator, ResolvedAllocator, TrackingAllocator};
use super::config::CacheConfig;
use super::entry::{footprint, hash_key, Entry};
use super::metrics::CacheStats;
use super::persist::{SnapshotReader, SnapshotWriter, DEFAULT_BLOCK_SIZE};
use super::segment::{InsertMode, PutOutcome, Segment};
use crate::error::{Error, Result};

/// Split `total` bytes over `segments`; the first `total % segments` get one extra byte
pub fn split_capacity(total: u64, segments: usize) -> Vec<u64> {
    let n = segments.max(1) as u64;
    let base = total / n;
    let remainder = total % n;
    (0..n).map(|i| base + u64::from(i < remainder)).collect()
}

/// Off-heap, segmented LRU key/value table
pub struct SegmentedTable {
    segments: Box<[Segment]>,
    segment_bits: u32,
    allocator: Arc<dyn Allocator>,
    tracker: Option<Arc<TrackingAllocator>>,
    capacity: AtomicU64,
    /// Serializes capacity redistribution
    resize_lock: Mutex<()>,
    closed: AtomicBool,
    config: CacheConfig,
}

impl SegmentedTable {
    /// Create a table with `capacity` bytes and defaults otherwise
    pub fn new(capacity: u64) -> Result<Self> {
        Self::with_config(CacheConfig::new(capacity))
    }

    /// Create a table, resolving the configured allocator strategy
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let resolved = ResolvedAllocator::resolve(config.allocator, config.debug_tracking)?;
        Self::build(config, resolved)
    }

    /// Create a table on a caller-supplied allocator
    pub fn with_allocator(config: CacheConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;
        let resolved = ResolvedAllocator::from_allocator(allocator, config.debug_tracking);
        Self::build(config, resolved)
    }

    fn build(config: CacheConfig, resolved: ResolvedAllocator) -> Result<Self> {
        let count = config.effective_segment_count();
        let segments: Box<[Segment]> = split_capacity(config.capacity, count)
            .into_iter()
            .map(|share| {
                Segment::new(
                    share,
                    config.initial_buckets_per_segment,
                    config.load_factor,
                    config.integrity_checks,
                )
            })
            .collect();

        tracing::info!(
            segments = count,
            capacity = config.capacity,
            allocator = resolved.allocator.name(),
            debug_tracking = config.debug_tracking,
            "off-heap table created"
        );

        Ok(Self {
            segment_bits: count.trailing_zeros(),
            segments,
            allocator: resolved.allocator,
            tracker: resolved.tracker,
            capacity: AtomicU64::new(config.capacity),
            resize_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            config,
        })
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Segment index for a hash (high bits)
    #[inline]
    pub fn segment_index(&self, hash: u64) -> usize {
        let mask = self.segments.len() - 1;
        (hash.checked_shr(64 - self.segment_bits).unwrap_or(0) as usize) & mask
    }

    #[inline]
    fn route(&self, hash: u64) -> &Segment {
        &self.segments[self.segment_index(hash)]
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("table"));
        }
        Ok(())
    }

    // =========================================================================
    // Key operations
    // =========================================================================

    /// Look up a key, marking it most-recently-used in its segment
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_open()?;
        let hash = hash_key(key);
        self.route(hash).get(hash, key)
    }

    /// Check if a key is present without touching LRU order
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        let hash = hash_key(key);
        Ok(self.route(hash).contains(hash, key))
    }

    /// Add or replace a mapping.
    ///
    /// Fails with `CapacityExhausted` when the entry cannot fit its segment even
    /// after evicting everything else; the previous mapping is left in place.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<PutOutcome> {
        self.insert(key, value, InsertMode::Always)
    }

    /// Add a mapping only if the key is absent; true if added
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        Ok(self.insert(key, value, InsertMode::IfAbsent)?.is_stored())
    }

    /// Store `value` if the key is absent and `old` is `None`, or if the current
    /// value equals `old`; true if stored
    pub fn add_or_replace(&self, key: &[u8], old: Option<&[u8]>, value: &[u8]) -> Result<bool> {
        let mode = match old {
            Some(old) => InsertMode::IfValueEquals(old),
            None => InsertMode::IfAbsent,
        };
        Ok(self.insert(key, value, mode)?.is_stored())
    }

    fn insert(&self, key: &[u8], value: &[u8], mode: InsertMode<'_>) -> Result<PutOutcome> {
        self.check_open()?;
        let hash = hash_key(key);
        let segment = self.route(hash);
        let size = footprint(key.len(), value.len())?;

        let limit = match self.config.max_entry_size {
            0 => segment.capacity(),
            max => max.min(segment.capacity()),
        };
        if size as u64 > limit {
            segment.metrics().record_put_fail();
            return Err(Error::CapacityExhausted {
                required: size as u64,
                capacity: limit,
            });
        }

        let entry = match Entry::try_encode(&self.allocator, hash, key, value) {
            Some(entry) => entry,
            None => {
                // allocator exhausted before the cache bound: make room and retry once
                let freed = segment.evict_bytes(size as u64);
                tracing::warn!(
                    requested = size,
                    freed,
                    allocator = self.allocator.name(),
                    "allocation failed, evicted to make room"
                );
                match Entry::try_encode(&self.allocator, hash, key, value) {
                    Some(entry) => entry,
                    None => {
                        segment.metrics().record_put_fail();
                        return Err(Error::OutOfMemory {
                            requested: size,
                            allocator: self.allocator.name(),
                        });
                    }
                }
            }
        };

        segment.insert(entry, mode)
    }

    /// Remove a key; false if it was not present
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        let hash = hash_key(key);
        Ok(self.route(hash).remove(hash, key))
    }

    /// Put every pair, returning how many were stored.
    ///
    /// Stops at the first error other than capacity exhaustion.
    pub fn put_all<I, K, V>(&self, pairs: I) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut stored = 0;
        for (key, value) in pairs {
            match self.put(key.as_ref(), value.as_ref()) {
                Ok(_) => stored += 1,
                Err(e) if e.is_capacity_exhausted() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stored)
    }

    /// Remove every key, returning how many were present
    pub fn remove_all<I, K>(&self, keys: I) -> Result<usize>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut removed = 0;
        for key in keys {
            if self.remove(key.as_ref())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Free every entry; the table stays usable
    pub fn clear(&self) -> Result<()> {
        self.check_open()?;
        let freed: usize = self.segments.iter().map(Segment::clear).sum();
        tracing::debug!(entries = freed, "table cleared");
        Ok(())
    }

    /// Free every entry and refuse further operations. Idempotent.
    ///
    /// With debug tracking, reports outstanding allocations as `MemoryLeak`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let freed: usize = self.segments.iter().map(Segment::clear).sum();
        tracing::info!(entries = freed, "off-heap table closed");

        if let Some(tracker) = &self.tracker {
            tracker.check_violations()?;
            tracker.report_leaks()?;
        }
        Ok(())
    }

    /// True once [`SegmentedTable::close`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Capacity and statistics
    // =========================================================================

    /// Number of entries
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    /// Configured capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Bytes held by entries
    pub fn mem_used(&self) -> u64 {
        self.segments.iter().map(Segment::used_bytes).sum()
    }

    /// `capacity - mem_used`
    pub fn free_capacity(&self) -> u64 {
        self.capacity().saturating_sub(self.mem_used())
    }

    /// Redistribute a new total capacity over the segments, evicting as needed
    pub fn set_capacity(&self, total: u64) -> Result<()> {
        self.check_open()?;
        let _guard = self.resize_lock.lock();

        // the published total never drops below what the segments may hold: grow it
        // before the segments, shrink it after them
        let previous = self.capacity.load(Ordering::Acquire);
        if total >= previous {
            self.capacity.store(total, Ordering::Release);
        }
        let evicted: usize = split_capacity(total, self.segments.len())
            .into_iter()
            .zip(self.segments.iter())
            .map(|(share, segment)| segment.set_capacity(share))
            .sum();
        if total < previous {
            self.capacity.store(total, Ordering::Release);
        }

        tracing::info!(previous, capacity = total, evicted, "table capacity changed");
        Ok(())
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Entries per segment
    pub fn per_segment_sizes(&self) -> Vec<usize> {
        self.segments.iter().map(Segment::len).collect()
    }

    /// Bytes held by entries per segment
    pub fn per_segment_mem_used(&self) -> Vec<u64> {
        self.segments.iter().map(Segment::used_bytes).collect()
    }

    /// Capacity share per segment
    pub fn per_segment_capacities(&self) -> Vec<u64> {
        self.segments.iter().map(Segment::capacity).collect()
    }

    /// Directory size per segment
    pub fn bucket_counts(&self) -> Vec<usize> {
        self.segments.iter().map(Segment::bucket_count).collect()
    }

    /// Configured directory load factor
    pub fn load_factor(&self) -> f32 {
        self.config.load_factor
    }

    /// Configuration the table was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Allocator backing entries and snapshot buffers
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Aggregated statistics snapshot
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for segment in self.segments.iter() {
            segment.metrics().accumulate(&mut stats);
            stats.size += segment.len() as u64;
            stats.mem_used += segment.used_bytes();
            stats.segment_sizes.push(segment.len() as u64);
        }
        stats.capacity = self.capacity();
        stats.free_capacity = stats.capacity.saturating_sub(stats.mem_used);
        stats.total_allocated = self.allocator.total_allocated();
        stats
    }

    /// Zero event counters (sizes and usage are unaffected)
    pub fn reset_statistics(&self) {
        for segment in self.segments.iter() {
            segment.metrics().reset();
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Lazy iterator over all keys, snapshotting one segment at a time
    pub fn key_iterator(&self) -> KeyIter<'_> {
        KeyIter::new(self, None)
    }

    /// Lazy iterator over up to `n` hot keys.
    ///
    /// Each segment contributes its most-recently-used keys (`n / segments + 1` at
    /// most); there is no ordering across segments.
    pub fn hot_key_iterator(&self, n: usize) -> KeyIter<'_> {
        KeyIter::new(self, Some(n))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Write every entry to a snapshot stream, returning the record count
    pub fn save_entries<W: Write>(&self, writer: W, compressed: bool) -> Result<u64> {
        self.check_open()?;
        self.save_keys(self.key_iterator(), writer, compressed)
    }

    /// Write up to `n` hot entries to a snapshot stream, returning the record count
    pub fn save_hot_entries<W: Write>(&self, n: usize, writer: W, compressed: bool) -> Result<u64> {
        self.check_open()?;
        self.save_keys(self.hot_key_iterator(n), writer, compressed)
    }

    fn save_keys<W: Write>(&self, keys: KeyIter<'_>, writer: W, compressed: bool) -> Result<u64> {
        let mut snapshot = SnapshotWriter::new(writer, &self.allocator, compressed, DEFAULT_BLOCK_SIZE)?;
        for key in keys {
            let hash = hash_key(&key);
            // entries removed since the key snapshot are skipped
            if let Some(value) = self.route(hash).peek(hash, &key) {
                snapshot.write_record(hash, &key, &value)?;
            }
        }
        let records = snapshot.records_written();
        snapshot.finish()?;
        tracing::info!(records, compressed, "entries saved");
        Ok(records)
    }

    /// Load entries from a snapshot stream, returning how many were stored.
    ///
    /// Entries that no longer fit are skipped; any stream or checksum failure aborts
    /// the whole restore.
    pub fn restore_entries<R: Read>(&self, reader: R) -> Result<u64> {
        self.check_open()?;
        let mut snapshot = SnapshotReader::open(reader, &self.allocator)?;
        let mut stored = 0u64;
        let mut skipped = 0u64;
        while let Some(record) = snapshot.next_record()? {
            match self.put(&record.key, &record.value) {
                Ok(_) => stored += 1,
                Err(e) if e.is_capacity_exhausted() => skipped += 1,
                Err(e) => return Err(e),
            }
        }
        snapshot.close();
        tracing::info!(stored, skipped, "entries restored");
        Ok(stored)
    }

    /// Write one entry as a plain single-record snapshot.
    ///
    /// Returns false and writes nothing if the key is absent.
    pub fn save_entry<W: Write>(&self, key: &[u8], writer: W) -> Result<bool> {
        self.check_open()?;
        let hash = hash_key(key);
        let value = match self.route(hash).peek(hash, key) {
            Some(value) => value,
            None => return Ok(false),
        };
        let mut snapshot = SnapshotWriter::new(writer, &self.allocator, false, DEFAULT_BLOCK_SIZE)?;
        snapshot.write_record(hash, key, &value)?;
        snapshot.finish()?;
        Ok(true)
    }

    /// Store the first record of a snapshot stream.
    ///
    /// Returns false for an empty stream or an entry that no longer fits.
    pub fn restore_entry<R: Read>(&self, reader: R) -> Result<bool> {
        self.check_open()?;
        let mut snapshot = SnapshotReader::open(reader, &self.allocator)?;
        let record = snapshot.next_record()?;
        snapshot.close();
        let record = match record {
            Some(record) => record,
            None => return Ok(false),
        };
        match self.put(&record.key, &record.value) {
            Ok(outcome) => Ok(outcome.is_stored()),
            Err(e) if e.is_capacity_exhausted() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write up to `n` hot keys as key-only records, returning the record count
    pub fn save_hot_keys<W: Write>(&self, n: usize, writer: W, compressed: bool) -> Result<u64> {
        self.check_open()?;
        let mut snapshot = SnapshotWriter::new(writer, &self.allocator, compressed, DEFAULT_BLOCK_SIZE)?;
        for key in self.hot_key_iterator(n) {
            snapshot.write_key(hash_key(&key), &key)?;
        }
        let records = snapshot.records_written();
        snapshot.finish()?;
        tracing::info!(records, compressed, "hot keys saved");
        Ok(records)
    }

    /// Lazily read the keys of a snapshot stream, ignoring any values.
    ///
    /// The stream header is checked here; record errors surface from the iterator,
    /// which ends after the first one.
    pub fn load_keys<R: Read>(&self, reader: R) -> Result<impl Iterator<Item = Result<Bytes>>> {
        self.check_open()?;
        let snapshot = SnapshotReader::open(reader, &self.allocator)?;
        Ok(snapshot.map(|record| record.map(|record| record.key)))
    }

    #[cfg(test)]
    pub(crate) fn segment_for(&self, key: &[u8]) -> &Segment {
        self.route(hash_key(key))
    }
}

impl Drop for SegmentedTable {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "off-heap table closed with errors");
        }
    }
}

impl std::fmt::Debug for SegmentedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedTable")
            .field("segments", &self.segments.len())
            .field("size", &self.size())
            .field("mem_used", &self.mem_used())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Key Iterator
// =============================================================================

/// Lazy key iterator; see [`SegmentedTable::key_iterator`]
pub struct KeyIter<'a> {
    table: &'a SegmentedTable,
    next_segment: usize,
    current: std::vec::IntoIter<Bytes>,
    per_segment: Option<usize>,
    remaining: usize,
}

impl<'a> KeyIter<'a> {
    fn new(table: &'a SegmentedTable, hot: Option<usize>) -> Self {
        let per_segment = hot.map(|n| (n / table.segments.len()).saturating_add(1));
        Self {
            table,
            next_segment: 0,
            current: Vec::new().into_iter(),
            per_segment,
            remaining: hot.unwrap_or(usize::MAX),
        }
    }
}

impl Iterator for KeyIter<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            if let Some(key) = self.current.next() {
                self.remaining -= 1;
                return Some(key);
            }
            let segment = self.table.segments.get(self.next_segment)?;
            self.next_segment += 1;
            let keys = match self.per_segment {
                Some(n) => segment.hot_keys(n),
                None => segment.keys(),
            };
            self.current = keys.into_iter();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
