//! ohcache - Off-Heap Segmented LRU Cache
//!
//! A concurrent key/value cache whose entries live in explicitly allocated memory
//! blocks outside Rust collections, sharded into independently locked segments
//! with per-segment LRU eviction, plus a checksummed, optionally LZ4-compressed
//! snapshot format for saving and restoring contents.
//!
//! # Example
//!
//! ```
//! use ohcache::{CacheConfig, SegmentedTable};
//!
//! let table = SegmentedTable::with_config(CacheConfig::new(1 << 20)).unwrap();
//! table.put(b"user:42", b"Alice").unwrap();
//! assert_eq!(table.get(b"user:42").unwrap().unwrap().as_ref(), b"Alice");
//!
//! let mut snapshot = Vec::new();
//! table.save_entries(&mut snapshot, true).unwrap();
//!
//! let restored = SegmentedTable::with_config(CacheConfig::new(1 << 20)).unwrap();
//! assert_eq!(restored.restore_entries(&snapshot[..]).unwrap(), 1);
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Allocators, entry layout, segments, table and persistence stream
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    AllocatorKind, CacheConfig, CacheStats, PutOutcome, SegmentedTable, SnapshotReader,
    SnapshotWriter, TypedCache,
};
pub use error::{Error, Result};
