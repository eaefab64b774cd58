//! Differential Tests
//!
//! Drives the off-heap table and a plain in-memory reference model with identical
//! operation sequences and asserts equal results after every call.
//!
//! The reference mirrors routing (high hash bits), entry footprint and per-segment
//! capacity shares, and keeps an explicit most-recently-used-first list per segment.

use bytes::Bytes;
use proptest::prelude::*;
use std::collections::{HashSet, VecDeque};

use ohcache::cache::entry::{footprint, hash_key};
use ohcache::cache::table::split_capacity;
use ohcache::{CacheConfig, Error, PutOutcome, SegmentedTable};

// =============================================================================
// Reference Model
// =============================================================================

#[derive(Debug, Default)]
struct ModelSegment {
    capacity: u64,
    used: u64,
    /// Most-recently-used first
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl ModelSegment {
    fn position(&self, key: &[u8]) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    fn evict(&mut self) {
        while self.used > self.capacity {
            match self.entries.pop_back() {
                Some((k, v)) => self.used -= size_of(&k, &v),
                None => break,
            }
        }
    }
}

fn size_of(key: &[u8], value: &[u8]) -> u64 {
    footprint(key.len(), value.len()).unwrap() as u64
}

/// Obviously-correct LRU model of a segmented table
#[derive(Debug)]
struct ReferenceCache {
    segments: Vec<ModelSegment>,
    bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelPut {
    Added,
    Replaced,
    Skipped,
    TooLarge,
}

impl ReferenceCache {
    fn new(capacity: u64, segments: usize) -> Self {
        Self {
            segments: split_capacity(capacity, segments)
                .into_iter()
                .map(|capacity| ModelSegment {
                    capacity,
                    ..Default::default()
                })
                .collect(),
            bits: segments.trailing_zeros(),
        }
    }

    fn segment(&mut self, key: &[u8]) -> &mut ModelSegment {
        let hash = hash_key(key);
        let index = if self.bits == 0 {
            0
        } else {
            (hash >> (64 - self.bits)) as usize
        };
        &mut self.segments[index]
    }

    fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let seg = self.segment(key);
        let pos = seg.position(key)?;
        let entry = seg.entries.remove(pos)?;
        let value = entry.1.clone();
        seg.entries.push_front(entry);
        Some(value)
    }

    fn contains(&mut self, key: &[u8]) -> bool {
        self.segment(key).position(key).is_some()
    }

    fn put(&mut self, key: &[u8], value: &[u8], only_if_absent: bool) -> ModelPut {
        let size = size_of(key, value);
        let seg = self.segment(key);
        if size > seg.capacity {
            return ModelPut::TooLarge;
        }
        let existing = seg.position(key);
        if only_if_absent && existing.is_some() {
            return ModelPut::Skipped;
        }
        let outcome = match existing {
            Some(pos) => {
                if let Some((k, v)) = seg.entries.remove(pos) {
                    seg.used -= size_of(&k, &v);
                }
                ModelPut::Replaced
            }
            None => ModelPut::Added,
        };
        seg.entries.push_front((key.to_vec(), value.to_vec()));
        seg.used += size;
        seg.evict();
        outcome
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        let seg = self.segment(key);
        match seg.position(key) {
            Some(pos) => {
                if let Some((k, v)) = seg.entries.remove(pos) {
                    seg.used -= size_of(&k, &v);
                }
                true
            }
            None => false,
        }
    }

    fn set_capacity(&mut self, total: u64) {
        let shares = split_capacity(total, self.segments.len());
        for (seg, share) in self.segments.iter_mut().zip(shares) {
            seg.capacity = share;
            seg.evict();
        }
    }

    fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.entries.len() as u64).sum()
    }

    fn mem_used(&self) -> u64 {
        self.segments.iter().map(|s| s.used).sum()
    }

    fn keys(&self) -> HashSet<Vec<u8>> {
        self.segments
            .iter()
            .flat_map(|s| s.entries.iter().map(|(k, _)| k.clone()))
            .collect()
    }

    fn hot_keys(&self, n: usize) -> Vec<Vec<u8>> {
        let per_segment = n / self.segments.len() + 1;
        self.segments
            .iter()
            .flat_map(|s| s.entries.iter().take(per_segment).map(|(k, _)| k.clone()))
            .take(n)
            .collect()
    }
}

// =============================================================================
// Checked Pair
// =============================================================================

/// Production table and reference model driven in lockstep
struct DoubleCheck {
    table: SegmentedTable,
    model: ReferenceCache,
}

impl DoubleCheck {
    fn new(capacity: u64, segments: usize) -> Self {
        let config = CacheConfig::new(capacity)
            .with_segment_count(segments)
            .with_initial_buckets(4)
            .with_integrity_checks(true);
        Self {
            table: SegmentedTable::with_config(config).unwrap(),
            model: ReferenceCache::new(capacity, segments),
        }
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::Put(k, v) => {
                let expected = self.model.put(k, v, false);
                let actual = self.table.put(k, v);
                match (expected, actual) {
                    (ModelPut::Added, Ok(PutOutcome::Added)) => {}
                    (ModelPut::Replaced, Ok(PutOutcome::Replaced)) => {}
                    (ModelPut::TooLarge, Err(Error::CapacityExhausted { .. })) => {}
                    (e, a) => panic!("put {:?}: model {:?}, table {:?}", k, e, a),
                }
            }
            Op::PutIfAbsent(k, v) => {
                let expected = self.model.put(k, v, true);
                let actual = self.table.put_if_absent(k, v);
                match (expected, actual) {
                    (ModelPut::Added, Ok(true)) => {}
                    (ModelPut::Skipped, Ok(false)) => {}
                    (ModelPut::TooLarge, Err(Error::CapacityExhausted { .. })) => {}
                    (e, a) => panic!("put_if_absent {:?}: model {:?}, table {:?}", k, e, a),
                }
            }
            Op::Get(k) => {
                let expected = self.model.get(k);
                let actual = self.table.get(k).unwrap().map(|b| b.to_vec());
                assert_eq!(actual, expected, "get {:?}", k);
            }
            Op::Contains(k) => {
                assert_eq!(self.table.contains_key(k).unwrap(), self.model.contains(k));
            }
            Op::Remove(k) => {
                let before = self.table.mem_used();
                let expected = self.model.remove(k);
                assert_eq!(self.table.remove(k).unwrap(), expected, "remove {:?}", k);
                if !expected {
                    assert_eq!(self.table.mem_used(), before);
                }
            }
            Op::SetCapacity(total) => {
                self.model.set_capacity(*total);
                self.table.set_capacity(*total).unwrap();
            }
        }
        self.check();
    }

    fn check(&self) {
        assert_eq!(self.table.size(), self.model.size());
        assert_eq!(self.table.mem_used(), self.model.mem_used());
        assert!(self.table.mem_used() <= self.table.capacity());
        for (segment, model) in self
            .table
            .per_segment_capacities()
            .iter()
            .zip(&self.model.segments)
        {
            assert_eq!(*segment, model.capacity);
        }
    }

    fn check_iteration(&self) {
        let keys: HashSet<Vec<u8>> = self.table.key_iterator().map(|b: Bytes| b.to_vec()).collect();
        assert_eq!(keys, self.model.keys());

        for n in [0, 1, 5, 50] {
            let hot: Vec<Vec<u8>> = self.table.hot_key_iterator(n).map(|b| b.to_vec()).collect();
            assert_eq!(hot, self.model.hot_keys(n), "hot keys n={}", n);
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    PutIfAbsent(Vec<u8>, Vec<u8>),
    Get(Vec<u8>),
    Contains(Vec<u8>),
    Remove(Vec<u8>),
    SetCapacity(u64),
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Small key space so operations collide often
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    (0u8..40).prop_map(|k| format!("key-{}", k).into_bytes())
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..300)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
        3 => key_strategy().prop_map(Op::Get),
        1 => key_strategy().prop_map(Op::Contains),
        2 => key_strategy().prop_map(Op::Remove),
        1 => (500u64..8000).prop_map(Op::SetCapacity),
    ]
}

fn segments_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), Just(2), Just(4)]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_table_matches_reference(
        capacity in 1000u64..6000,
        segments in segments_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..300),
    ) {
        let mut pair = DoubleCheck::new(capacity, segments);
        for op in &ops {
            pair.apply(op);
        }
        pair.check_iteration();
        pair.table.close().unwrap();
    }

    #[test]
    fn prop_capacity_invariant(
        capacity in 200u64..4000,
        ops in prop::collection::vec((key_strategy(), value_strategy(), any::<bool>()), 1..400),
    ) {
        let table = SegmentedTable::with_config(
            CacheConfig::new(capacity).with_segment_count(2),
        ).unwrap();
        for (key, value, remove) in &ops {
            if *remove {
                table.remove(key).unwrap();
            } else {
                let _ = table.put(key, value);
            }
            prop_assert!(table.mem_used() <= table.capacity());
            let used = table.per_segment_mem_used();
            let caps = table.per_segment_capacities();
            for (used, cap) in used.iter().zip(&caps) {
                prop_assert!(used <= cap);
            }
        }
    }
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_lru_evicts_exactly_first_key() {
    // C divisible by S, C/S + 1 never-re-touched keys
    let entry = size_of(b"key-00", &[0u8; 20]);
    let per_segment = 16u64;
    let mut pair = DoubleCheck::new(entry * per_segment, 1);

    for i in 0..=per_segment {
        pair.apply(&Op::Put(format!("key-{:02}", i).into_bytes(), vec![0u8; 20]));
    }
    assert!(!pair.table.contains_key(b"key-00").unwrap());
    for i in 1..=per_segment {
        assert!(pair
            .table
            .contains_key(format!("key-{:02}", i).as_bytes())
            .unwrap());
    }
    pair.check_iteration();
}

#[test]
fn test_touch_protects_from_eviction() {
    let entry = size_of(b"key-00", &[0u8; 20]);
    let mut pair = DoubleCheck::new(entry * 4, 1);
    for i in 0..4 {
        pair.apply(&Op::Put(format!("key-{:02}", i).into_bytes(), vec![0u8; 20]));
    }
    pair.apply(&Op::Get(b"key-00".to_vec()));
    pair.apply(&Op::Put(b"key-04".to_vec(), vec![0u8; 20]));

    assert!(pair.table.contains_key(b"key-00").unwrap());
    assert!(!pair.table.contains_key(b"key-01").unwrap());
}

#[test]
fn test_idempotent_remove() {
    let mut pair = DoubleCheck::new(1 << 16, 4);
    pair.apply(&Op::Put(b"present".to_vec(), b"v".to_vec()));
    let used = pair.table.mem_used();

    pair.apply(&Op::Remove(b"absent".to_vec()));
    assert_eq!(pair.table.mem_used(), used);

    pair.apply(&Op::Remove(b"present".to_vec()));
    assert!(!pair.table.remove(b"present").unwrap());
    assert_eq!(pair.table.mem_used(), 0);
}

#[test]
fn test_shrink_then_grow_capacity() {
    let mut pair = DoubleCheck::new(20_000, 4);
    for i in 0..40u32 {
        pair.apply(&Op::Put(format!("key-{}", i).into_bytes(), vec![i as u8; 200]));
    }
    pair.apply(&Op::SetCapacity(1_001));
    pair.apply(&Op::SetCapacity(0));
    assert_eq!(pair.table.size(), 0);
    pair.apply(&Op::SetCapacity(20_003));
    pair.apply(&Op::Put(b"after".to_vec(), vec![1u8; 10]));
    pair.check_iteration();
}
