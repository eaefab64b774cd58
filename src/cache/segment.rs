//! Segment - One Independently Locked Shard
//!
//! # Design
//!
//! - A power-of-two bucket directory; each bucket heads a chain of entries
//! - A doubly linked LRU list from most- to least-recently-used
//! - Links are slot indices into a per-segment arena with a free list, so moving
//!   an entry between chains or LRU positions never touches its payload
//! - Entry payloads are [`Entry`] blocks owned by their slot; taking a block out of
//!   its slot is the only way to free it
//! - Every operation, including lookups (they reorder the LRU list), runs under the
//!   segment's mutex; size/usage mirrors are atomics for lock-free aggregation
//! - Cache-line alignment between segments prevents false sharing

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::entry::Entry;
use super::metrics::SegmentMetrics;
use crate::error::{Error, Result};

const NIL: u32 = u32::MAX;

/// Largest bucket directory a segment grows to
pub const MAX_BUCKETS: usize = 1 << 30;

/// Result of a successful insert call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Key was not present and has been added
    Added,
    /// Key was present and its entry has been replaced
    Replaced,
    /// Insert condition not met; nothing changed
    Skipped,
}

impl PutOutcome {
    /// True if the call changed the mapping
    pub fn is_stored(&self) -> bool {
        !matches!(self, PutOutcome::Skipped)
    }
}

/// Condition attached to an insert
#[derive(Debug, Clone, Copy)]
pub enum InsertMode<'a> {
    /// Add or replace unconditionally
    Always,
    /// Add only if the key is absent
    IfAbsent,
    /// Replace only if the current value equals the given bytes
    IfValueEquals(&'a [u8]),
}

// =============================================================================
// Directory (state under the lock)
// =============================================================================

#[derive(Debug)]
struct Slot {
    entry: Option<Entry>,
    chain_next: u32,
    lru_prev: u32,
    lru_next: u32,
}

#[derive(Debug)]
struct Directory {
    buckets: Vec<u32>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    len: usize,
    used_bytes: u64,
    capacity: u64,
}

impl Directory {
    fn new(bucket_count: usize, capacity: u64) -> Self {
        Self {
            buckets: vec![NIL; bucket_count],
            slots: Vec::new(),
            free_slots: Vec::new(),
            lru_head: NIL,
            lru_tail: NIL,
            len: 0,
            used_bytes: 0,
            capacity,
        }
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    #[inline]
    fn entry(&self, idx: u32) -> &Entry {
        match &self.slots[idx as usize].entry {
            Some(entry) => entry,
            None => unreachable!("linked slot {} has no entry", idx),
        }
    }

    /// Find `(slot, previous slot in chain)` for a key
    fn find(&self, hash: u64, key: &[u8]) -> Option<(u32, u32)> {
        let mut prev = NIL;
        let mut cur = self.buckets[self.bucket_of(hash)];
        while cur != NIL {
            if self.entry(cur).matches(hash, key) {
                return Some((cur, prev));
            }
            prev = cur;
            cur = self.slots[cur as usize].chain_next;
        }
        None
    }

    fn chain_prev(&self, idx: u32) -> u32 {
        let hash = self.entry(idx).hash();
        let mut prev = NIL;
        let mut cur = self.buckets[self.bucket_of(hash)];
        while cur != idx {
            debug_assert!(cur != NIL, "slot {} missing from its chain", idx);
            prev = cur;
            cur = self.slots[cur as usize].chain_next;
        }
        prev
    }

    fn alloc_slot(&mut self, entry: Entry) -> u32 {
        let slot = Slot {
            entry: Some(entry),
            chain_next: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        };
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn release_slot(&mut self, idx: u32) -> Entry {
        let slot = &mut self.slots[idx as usize];
        slot.chain_next = NIL;
        slot.lru_prev = NIL;
        slot.lru_next = NIL;
        let entry = match slot.entry.take() {
            Some(entry) => entry,
            None => unreachable!("released slot {} twice", idx),
        };
        self.free_slots.push(idx);
        entry
    }

    fn chain_unlink(&mut self, idx: u32, prev: u32) {
        let next = self.slots[idx as usize].chain_next;
        if prev == NIL {
            let bucket = self.bucket_of(self.entry(idx).hash());
            self.buckets[bucket] = next;
        } else {
            self.slots[prev as usize].chain_next = next;
        }
    }

    fn lru_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.lru_prev, slot.lru_next)
        };
        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slots[prev as usize].lru_next = next;
        }
        if next == NIL {
            self.lru_tail = prev;
        } else {
            self.slots[next as usize].lru_prev = prev;
        }
        let slot = &mut self.slots[idx as usize];
        slot.lru_prev = NIL;
        slot.lru_next = NIL;
    }

    fn lru_push_front(&mut self, idx: u32) {
        let old_head = self.lru_head;
        {
            let slot = &mut self.slots[idx as usize];
            slot.lru_prev = NIL;
            slot.lru_next = old_head;
        }
        if old_head == NIL {
            self.lru_tail = idx;
        } else {
            self.slots[old_head as usize].lru_prev = idx;
        }
        self.lru_head = idx;
    }

    fn lru_touch(&mut self, idx: u32) {
        if self.lru_head != idx {
            self.lru_unlink(idx);
            self.lru_push_front(idx);
        }
    }

    /// Unlink and take out the entry at `idx`
    fn unlink(&mut self, idx: u32, prev: u32) -> Entry {
        self.chain_unlink(idx, prev);
        self.lru_unlink(idx);
        let entry = self.release_slot(idx);
        self.len -= 1;
        self.used_bytes -= entry.size_of() as u64;
        entry
    }

    /// Remove the least-recently-used entry
    fn evict_tail(&mut self) -> Option<Entry> {
        let tail = self.lru_tail;
        if tail == NIL {
            return None;
        }
        let prev = self.chain_prev(tail);
        Some(self.unlink(tail, prev))
    }

    /// Double the bucket directory, relinking chains only
    fn rehash(&mut self) -> bool {
        let new_count = self.buckets.len() * 2;
        if new_count > MAX_BUCKETS {
            return false;
        }
        let mask = new_count - 1;
        let mut buckets = vec![NIL; new_count];
        for idx in 0..self.slots.len() {
            let Some(entry) = &self.slots[idx].entry else {
                continue;
            };
            let bucket = (entry.hash() as usize) & mask;
            self.slots[idx].chain_next = buckets[bucket];
            buckets[bucket] = idx as u32;
        }
        self.buckets = buckets;
        true
    }

    /// Drop every link and hand back all entries
    fn drain(&mut self, bucket_count: usize) -> Vec<Entry> {
        let entries = self
            .slots
            .drain(..)
            .filter_map(|slot| slot.entry)
            .collect();
        self.free_slots.clear();
        self.buckets = vec![NIL; bucket_count];
        self.lru_head = NIL;
        self.lru_tail = NIL;
        self.len = 0;
        self.used_bytes = 0;
        entries
    }
}

// =============================================================================
// Segment
// =============================================================================

/// One shard of the table with its own lock and capacity share
#[repr(C, align(64))]
pub struct Segment {
    /// Directory, LRU list and accounting
    state: Mutex<Directory>,
    /// Number of entries (mirror)
    size: AtomicU64,
    /// Bytes held by entries (mirror)
    used_bytes: AtomicU64,
    /// Capacity share in bytes (mirror)
    capacity: AtomicU64,
    /// Bucket count (mirror)
    buckets: AtomicU64,
    /// Event counters
    metrics: SegmentMetrics,
    initial_buckets: usize,
    load_factor: f32,
    integrity_checks: bool,
}

impl Segment {
    /// Create an empty segment
    pub fn new(
        capacity: u64,
        initial_buckets: usize,
        load_factor: f32,
        integrity_checks: bool,
    ) -> Self {
        let initial_buckets = initial_buckets.clamp(1, MAX_BUCKETS).next_power_of_two();
        Self {
            state: Mutex::new(Directory::new(initial_buckets, capacity)),
            size: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
            capacity: AtomicU64::new(capacity),
            buckets: AtomicU64::new(initial_buckets as u64),
            metrics: SegmentMetrics::new(),
            initial_buckets,
            load_factor,
            integrity_checks,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    /// Check if the segment is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by entries
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Capacity share in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Current bucket count
    pub fn bucket_count(&self) -> usize {
        self.buckets.load(Ordering::Relaxed) as usize
    }

    /// Event counters
    pub fn metrics(&self) -> &SegmentMetrics {
        &self.metrics
    }

    fn publish(&self, dir: &Directory) {
        self.size.store(dir.len as u64, Ordering::Relaxed);
        self.used_bytes.store(dir.used_bytes, Ordering::Relaxed);
        self.capacity.store(dir.capacity, Ordering::Relaxed);
        self.buckets
            .store(dir.buckets.len() as u64, Ordering::Relaxed);
    }

    /// Look up a key and mark it most-recently-used.
    ///
    /// With integrity checks enabled, a checksum mismatch is reported instead of
    /// returning the damaged value.
    pub fn get(&self, hash: u64, key: &[u8]) -> Result<Option<Bytes>> {
        let mut dir = self.state.lock();
        let Some((idx, _)) = dir.find(hash, key) else {
            self.metrics.record_miss();
            return Ok(None);
        };

        if self.integrity_checks {
            dir.entry(idx).verify()?;
        }
        dir.lru_touch(idx);
        self.metrics.record_hit();
        Ok(Some(dir.entry(idx).decode_value()))
    }

    /// Copy a value out without touching LRU order or statistics
    pub fn peek(&self, hash: u64, key: &[u8]) -> Option<Bytes> {
        let dir = self.state.lock();
        dir.find(hash, key)
            .map(|(idx, _)| dir.entry(idx).decode_value())
    }

    /// Check if a key is present (LRU order unchanged)
    pub fn contains(&self, hash: u64, key: &[u8]) -> bool {
        self.state.lock().find(hash, key).is_some()
    }

    /// Link an encoded entry into the directory.
    ///
    /// A replaced entry is unlinked only after its successor is linked, and both the
    /// replaced entry and any evicted ones are freed after the lock is released.
    /// Fails with `CapacityExhausted` if the entry exceeds the segment capacity.
    pub fn insert(&self, entry: Entry, mode: InsertMode<'_>) -> Result<PutOutcome> {
        let size = entry.size_of() as u64;
        let hash = entry.hash();
        let mut retired: Vec<Entry> = Vec::new();

        let outcome = {
            let mut guard = self.state.lock();
            let dir = &mut *guard;
            let existing = dir.find(hash, entry.key());

            let allowed = match (mode, existing) {
                (InsertMode::Always, _) => true,
                (InsertMode::IfAbsent, found) => found.is_none(),
                (InsertMode::IfValueEquals(_), None) => false,
                (InsertMode::IfValueEquals(old), Some((idx, _))) => dir.entry(idx).value() == old,
            };
            if !allowed {
                return Ok(PutOutcome::Skipped);
            }

            if size > dir.capacity {
                self.metrics.record_put_fail();
                return Err(Error::CapacityExhausted {
                    required: size,
                    capacity: dir.capacity,
                });
            }

            let bucket = dir.bucket_of(hash);
            let new_idx = dir.alloc_slot(entry);
            let outcome = match existing {
                Some((old_idx, prev)) => {
                    // splice the new slot into the old one's chain position
                    let next = dir.slots[old_idx as usize].chain_next;
                    dir.slots[new_idx as usize].chain_next = next;
                    if prev == NIL {
                        dir.buckets[bucket] = new_idx;
                    } else {
                        dir.slots[prev as usize].chain_next = new_idx;
                    }
                    dir.lru_push_front(new_idx);

                    dir.lru_unlink(old_idx);
                    let old = dir.release_slot(old_idx);
                    dir.used_bytes = dir.used_bytes - old.size_of() as u64 + size;
                    retired.push(old);
                    self.metrics.record_put_replace();
                    PutOutcome::Replaced
                }
                None => {
                    let head = dir.buckets[bucket];
                    dir.slots[new_idx as usize].chain_next = head;
                    dir.buckets[bucket] = new_idx;
                    dir.lru_push_front(new_idx);
                    dir.len += 1;
                    dir.used_bytes += size;
                    self.metrics.record_put_add();
                    PutOutcome::Added
                }
            };

            while dir.used_bytes > dir.capacity {
                match dir.evict_tail() {
                    Some(victim) => {
                        self.metrics.record_eviction();
                        retired.push(victim);
                    }
                    None => break,
                }
            }

            let threshold = dir.buckets.len() as f64 * self.load_factor as f64;
            if dir.len as f64 > threshold && dir.rehash() {
                self.metrics.record_rehash();
                tracing::debug!(buckets = dir.buckets.len(), entries = dir.len, "segment directory resized");
            }

            self.publish(dir);
            outcome
        };

        if !retired.is_empty() {
            tracing::trace!(count = retired.len(), "retiring entries after insert");
        }
        drop(retired);
        Ok(outcome)
    }

    /// Remove a key; false if it was not present
    pub fn remove(&self, hash: u64, key: &[u8]) -> bool {
        let removed = {
            let mut dir = self.state.lock();
            let Some((idx, prev)) = dir.find(hash, key) else {
                return false;
            };
            let entry = dir.unlink(idx, prev);
            self.metrics.record_remove();
            self.publish(&dir);
            entry
        };
        drop(removed);
        true
    }

    /// Change the capacity share, evicting down to the new bound
    pub fn set_capacity(&self, capacity: u64) -> usize {
        let evicted = {
            let mut dir = self.state.lock();
            dir.capacity = capacity;
            let mut evicted = Vec::new();
            while dir.used_bytes > dir.capacity {
                match dir.evict_tail() {
                    Some(victim) => {
                        self.metrics.record_eviction();
                        evicted.push(victim);
                    }
                    None => break,
                }
            }
            self.publish(&dir);
            evicted
        };
        let count = evicted.len();
        drop(evicted);
        count
    }

    /// Evict least-recently-used entries until at least `bytes` have been released.
    ///
    /// Used when the allocator is exhausted before the cache capacity is reached.
    pub fn evict_bytes(&self, bytes: u64) -> u64 {
        let evicted = {
            let mut dir = self.state.lock();
            let mut freed = 0u64;
            let mut evicted = Vec::new();
            while freed < bytes {
                match dir.evict_tail() {
                    Some(victim) => {
                        freed += victim.size_of() as u64;
                        self.metrics.record_eviction();
                        evicted.push(victim);
                    }
                    None => break,
                }
            }
            self.publish(&dir);
            evicted
        };
        evicted.iter().map(|e| e.size_of() as u64).sum()
    }

    /// Free every entry and shrink the directory back to its initial size
    pub fn clear(&self) -> usize {
        let entries = {
            let mut dir = self.state.lock();
            let entries = dir.drain(self.initial_buckets);
            self.publish(&dir);
            entries
        };
        entries.len()
    }

    /// Snapshot of all keys in directory traversal order
    pub fn keys(&self) -> Vec<Bytes> {
        let dir = self.state.lock();
        let mut keys = Vec::with_capacity(dir.len);
        for &head in &dir.buckets {
            let mut cur = head;
            while cur != NIL {
                keys.push(dir.entry(cur).decode_key());
                cur = dir.slots[cur as usize].chain_next;
            }
        }
        keys
    }

    /// Snapshot of up to `n` keys, most-recently-used first
    pub fn hot_keys(&self, n: usize) -> Vec<Bytes> {
        let dir = self.state.lock();
        let mut keys = Vec::with_capacity(n.min(dir.len));
        let mut cur = dir.lru_head;
        while cur != NIL && keys.len() < n {
            keys.push(dir.entry(cur).decode_key());
            cur = dir.slots[cur as usize].lru_next;
        }
        keys
    }

    /// Damage the stored value of a key, for integrity tests
    #[cfg(test)]
    pub(crate) fn corrupt_value(&self, hash: u64, key: &[u8]) -> bool {
        let mut dir = self.state.lock();
        let Some((idx, _)) = dir.find(hash, key) else {
            return false;
        };
        let Some(entry) = dir.slots[idx as usize].entry.as_mut() else {
            return false;
        };
        let block = entry.block_mut();
        let last = block.len() - 1;
        block[last] ^= 0x80;
        true
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("len", &self.len())
            .field("used_bytes", &self.used_bytes())
            .field("capacity", &self.capacity())
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
