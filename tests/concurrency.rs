//! Concurrency Tests
//!
//! Many threads against one shared table: disjoint writers, contended keys,
//! capacity bounds under churn and a clean tracked close afterwards.

use assert_matches::assert_matches;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use ohcache::{CacheConfig, Error, SegmentedTable};

const THREADS: usize = 8;

fn shared(config: CacheConfig) -> Arc<SegmentedTable> {
    Arc::new(SegmentedTable::with_config(config).unwrap())
}

#[test]
fn test_disjoint_writers_all_visible() {
    let table = shared(
        CacheConfig::new(64 << 20)
            .with_segment_count(16)
            .with_initial_buckets(2),
    );
    let per_thread = 1000;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{}-k{}", t, i);
                    let value = format!("value-{}-{}", t, i);
                    table.put(key.as_bytes(), value.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.size(), (THREADS * per_thread) as u64);
    for t in 0..THREADS {
        for i in 0..per_thread {
            let key = format!("t{}-k{}", t, i);
            let value = table.get(key.as_bytes()).unwrap().unwrap();
            assert_eq!(value.as_ref(), format!("value-{}-{}", t, i).as_bytes());
        }
    }
    // buckets grew from 2 under load
    assert!(table.bucket_counts().iter().all(|&b| b > 2));
}

#[test]
fn test_contended_key_never_tears() {
    let table = shared(CacheConfig::new(8 << 20).with_integrity_checks(true));
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let value = vec![t as u8; 256];
                for _ in 0..2000 {
                    table.put(b"contended", &value).unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Some(value) = table.get(b"contended").unwrap() {
                    assert_eq!(value.len(), 256);
                    assert!(value.iter().all(|&b| b == value[0]), "torn value");
                }
            }
        })
    };

    for handle in writers {
        handle.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    assert_eq!(table.size(), 1);
    let last = table.get(b"contended").unwrap().unwrap();
    assert!((last[0] as usize) < THREADS);
}

#[test]
fn test_put_if_absent_has_single_winner() {
    let table = shared(CacheConfig::new(1 << 20));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || table.put_if_absent(b"once", &[t as u8]).unwrap())
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&won| won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(table.size(), 1);
}

#[test]
fn test_capacity_bound_under_churn() {
    let table = shared(CacheConfig::new(64 * 1024).with_segment_count(4));
    let stop = Arc::new(AtomicBool::new(false));

    let monitor = {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let used = table.per_segment_mem_used();
                let caps = table.per_segment_capacities();
                for (used, cap) in used.iter().zip(&caps) {
                    assert!(used <= cap, "segment holds {} of {}", used, cap);
                }
            }
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..3000usize {
                    let key = format!("k{}", (t * 7919 + i) % 1500);
                    if i % 5 == 0 {
                        table.remove(key.as_bytes()).unwrap();
                    } else {
                        table.put(key.as_bytes(), &vec![i as u8; 64 + i % 200]).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in workers {
        handle.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    monitor.join().unwrap();

    assert!(table.mem_used() <= table.capacity());
    let stats = table.stats();
    assert!(stats.evictions > 0);
}

#[test]
fn test_resize_while_writing() {
    let table = shared(CacheConfig::new(256 * 1024).with_segment_count(8));

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..5000usize {
                    let key = format!("w{}-{}", t, i);
                    table.put(key.as_bytes(), &[0xAB; 100]).unwrap();
                }
            })
        })
        .collect();

    let resizer = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for round in 0..50u64 {
                let capacity = if round % 2 == 0 { 32 * 1024 } else { 256 * 1024 };
                table.set_capacity(capacity).unwrap();
            }
        })
    };

    for handle in writers {
        handle.join().unwrap();
    }
    resizer.join().unwrap();

    // last round sets the large capacity
    assert_eq!(table.capacity(), 256 * 1024);
    assert!(table.mem_used() <= table.capacity());
    let caps: u64 = table.per_segment_capacities().iter().sum();
    assert_eq!(caps, table.capacity());
}

#[test]
fn test_capacity_never_below_usage_while_resizing() {
    let table = shared(CacheConfig::new(8 << 20).with_segment_count(16));
    for i in 0..30_000u32 {
        table.put(&i.to_be_bytes(), &[7u8; 200]).unwrap();
    }
    assert!(table.mem_used() > 4 << 20);

    let stop = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicU64::new(0));
    let observer = {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let violations = Arc::clone(&violations);
        thread::spawn(move || {
            // no writers run, so usage only falls after the capacity is read
            while !stop.load(Ordering::Relaxed) {
                let capacity = table.capacity();
                if table.mem_used() > capacity {
                    violations.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    for _ in 0..5 {
        for mib in [6u64, 4, 2, 1] {
            table.set_capacity(mib << 20).unwrap();
        }
        table.set_capacity(8 << 20).unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    observer.join().unwrap();

    assert_eq!(violations.load(Ordering::Relaxed), 0);
    assert!(table.mem_used() <= 1 << 20);
    assert_eq!(table.capacity(), 8 << 20);
}

#[test]
fn test_tracked_close_after_concurrent_use() {
    let table = shared(
        CacheConfig::new(1 << 20)
            .with_segment_count(4)
            .with_debug_tracking(true),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..500usize {
                    let key = format!("{}:{}", t, i % 50);
                    match i % 3 {
                        0 => {
                            table.put(key.as_bytes(), &[t as u8; 300]).unwrap();
                        }
                        1 => {
                            table.get(key.as_bytes()).unwrap();
                        }
                        _ => {
                            table.remove(key.as_bytes()).unwrap();
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // every replaced, evicted and removed entry was freed exactly once
    table.close().unwrap();
    assert!(table.is_closed());
    assert_eq!(table.mem_used(), 0);
    assert_matches!(table.get(b"0:0"), Err(Error::Closed(_)));
    table.close().unwrap();
}

#[test]
fn test_concurrent_snapshot_while_writing() {
    let table = shared(CacheConfig::new(4 << 20).with_segment_count(4));
    for i in 0..1000 {
        table.put(format!("seed-{}", i).as_bytes(), b"seed").unwrap();
    }

    let writer = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for i in 0..2000 {
                let key = format!("seed-{}", i % 1000);
                if i % 2 == 0 {
                    table.remove(key.as_bytes()).unwrap();
                } else {
                    table.put(key.as_bytes(), b"fresh").unwrap();
                }
            }
        })
    };

    let mut snapshot = Vec::new();
    let saved = table.save_entries(&mut snapshot, true).unwrap();
    writer.join().unwrap();

    let restored = SegmentedTable::with_config(CacheConfig::new(4 << 20)).unwrap();
    assert_eq!(restored.restore_entries(&snapshot[..]).unwrap(), saved);
    for key in restored.key_iterator() {
        let value = restored.get(&key).unwrap().unwrap();
        assert!(value.as_ref() == b"seed" || value.as_ref() == b"fresh");
    }
}
