//! Off-Heap Segmented Cache
//!
//! Key/value bytes live outside Rust-managed collections in allocator-provided
//! blocks; a power-of-two array of independently locked segments indexes them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          SegmentedTable                                  │
//! │          hash(key) ──high bits──▶ segment index                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Segment 0          │  Segment 1          │ ... │  Segment N-1          │
//! │  ┌───────────────┐  │  ┌───────────────┐  │     │  ┌───────────────┐    │
//! │  │ Mutex         │  │  │ Mutex         │  │     │  │ Mutex         │    │
//! │  │ buckets+chains│  │  │ buckets+chains│  │     │  │ buckets+chains│    │
//! │  │ LRU list      │  │  │ LRU list      │  │     │  │ LRU list      │    │
//! │  └───────────────┘  │  └───────────────┘  │     │  └───────────────┘    │
//! │         │                    │                           │               │
//! │         └────────────────────┴─────────┬─────────────────┘               │
//! │                                   Allocator                              │
//! │                     (heap / malloc / debug tracking)                     │
//! └──────────────────────────────────────────────────────────────────────────┘
//!            │ save/restore
//!            ▼
//!   Persistence stream: header + LZ4 (or plain) blocks of checksummed records
//! ```
//!
//! # Design Principles
//!
//! - One lock per segment; different segments never contend
//! - Entry memory is owned by exactly one slot and freed exactly once on drop
//! - Cache-line aligned segments (64 bytes)
//! - Corruption is always reported, never returned as data

pub mod alloc;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod entry;
pub mod metrics;
pub mod persist;
pub mod segment;
pub mod serializer;
pub mod table;
pub mod typed;

pub use alloc::{
    Allocator, AllocatorKind, HeapAllocator, OffHeapBlock, ResolvedAllocator, TrackingAllocator,
};
#[cfg(unix)]
pub use alloc::MallocAllocator;
pub use compression::{CompressionAlgorithm, Compressor};
pub use config::CacheConfig;
pub use entry::{hash_key, Entry};
pub use metrics::CacheStats;
pub use persist::{BlockReader, BlockWriter, Record, SnapshotReader, SnapshotWriter, StreamHeader};
pub use segment::{PutOutcome, Segment};
pub use serializer::{BytesSerializer, CacheSerializer, StringSerializer};
pub use table::{KeyIter, SegmentedTable};
pub use typed::TypedCache;

/// Cache line size for alignment (x86-64)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Tests
// =============================================================================
