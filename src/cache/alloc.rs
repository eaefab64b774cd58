//! Native Memory Allocation
//!
//! Raw byte-range allocation outside the Rust-managed heap objects, plus the
//! owning [`OffHeapBlock`] handle every cache entry and stream buffer lives in.
//!
//! # Strategies
//!
//! - [`HeapAllocator`] - global allocator with 8-byte alignment, optional hard limit
//! - [`MallocAllocator`] - OS `malloc`/`free` via libc (unix only)
//! - [`TrackingAllocator`] - debug wrapper recording every outstanding allocation
//!
//! The strategy is picked once from [`AllocatorKind`] when a table is built; nothing
//! below probes the platform at runtime.
//!
//! # Ownership
//!
//! An [`OffHeapBlock`] is the only handle to its address. It is not `Clone`, and it
//! frees its memory in `Drop`, so a block is released exactly once no matter which
//! path (replace, evict, remove, close, error) lets go of it.

use std::alloc::{alloc, dealloc, Layout};
use std::backtrace::Backtrace;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Alignment of every off-heap allocation (entry headers start with a u64)
pub const BLOCK_ALIGNMENT: usize = 8;

// =============================================================================
// Allocator Trait
// =============================================================================

/// Raw allocation over a native memory space.
///
/// Implementations must be safe under concurrent `allocate`/`free` from many
/// segments. Exhaustion is signalled by `None`, never by panicking, so the caller
/// can evict and retry.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Short identifier used in logs and errors
    fn name(&self) -> &'static str;

    /// Allocate `bytes` bytes, or `None` if the substrate is exhausted.
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Release a region.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate(bytes)` on this allocator and
    /// must not have been freed already.
    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize);

    /// Bytes currently outstanding
    fn total_allocated(&self) -> u64;
}

/// Allocator strategy selected in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// Rust global allocator
    #[default]
    Heap,
    /// libc `malloc`/`free`
    Malloc,
}

impl AllocatorKind {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            AllocatorKind::Heap => "heap",
            AllocatorKind::Malloc => "malloc",
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for AllocatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "heap" | "unsafe" => Ok(AllocatorKind::Heap),
            "malloc" | "jna" | "native" => Ok(AllocatorKind::Malloc),
            other => Err(Error::Config(format!("unknown allocator '{}'", other))),
        }
    }
}

// =============================================================================
// Heap Allocator
// =============================================================================

/// Allocator backed by the Rust global allocator.
///
/// An optional `limit` caps the outstanding bytes, which models a native memory
/// space smaller than the configured cache capacity.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    allocated: AtomicU64,
    limit: Option<u64>,
}

impl HeapAllocator {
    /// Create an unbounded heap allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a heap allocator that refuses to hold more than `limit` bytes
    pub fn with_limit(limit: u64) -> Self {
        Self {
            allocated: AtomicU64::new(0),
            limit: Some(limit),
        }
    }

    fn reserve(&self, bytes: u64) -> bool {
        let Some(limit) = self.limit else {
            self.allocated.fetch_add(bytes, Ordering::Relaxed);
            return true;
        };
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= limit)
            })
            .is_ok()
    }
}

impl Allocator for HeapAllocator {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, BLOCK_ALIGNMENT).ok()?;
        if layout.size() == 0 || !self.reserve(bytes as u64) {
            return None;
        }

        // SAFETY: layout has a non-zero size (checked above).
        let ptr = unsafe { alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Some(ptr),
            None => {
                self.allocated.fetch_sub(bytes as u64, Ordering::Relaxed);
                None
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: the caller guarantees `ptr` came from `allocate(bytes)`, which used
        // exactly this layout.
        let layout = Layout::from_size_align_unchecked(bytes, BLOCK_ALIGNMENT);
        dealloc(ptr.as_ptr(), layout);
        self.allocated.fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    fn total_allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Malloc Allocator
// =============================================================================

/// Allocator backed by the C library's `malloc`/`free`.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct MallocAllocator {
    allocated: AtomicU64,
}

#[cfg(unix)]
impl MallocAllocator {
    /// Create a new malloc allocator
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
impl Allocator for MallocAllocator {
    fn name(&self) -> &'static str {
        "malloc"
    }

    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        // SAFETY: malloc accepts any size and returns NULL on failure, which we check.
        // glibc/musl/macOS malloc return 16-byte aligned memory, above BLOCK_ALIGNMENT.
        let ptr = unsafe { libc::malloc(bytes) } as *mut u8;
        let ptr = NonNull::new(ptr)?;
        self.allocated.fetch_add(bytes as u64, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: the caller guarantees `ptr` came from `malloc` above.
        libc::free(ptr.as_ptr() as *mut libc::c_void);
        self.allocated.fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    fn total_allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tracking Allocator (debug)
// =============================================================================

/// Where and how large an outstanding allocation is
#[derive(Debug)]
pub struct AllocationSite {
    /// Size in bytes
    pub size: usize,
    /// Name of the allocating thread
    pub thread: String,
    /// Captured backtrace (honours `RUST_BACKTRACE`)
    pub backtrace: Backtrace,
}

/// Debug wrapper that records every outstanding `(address -> size, site)` pair.
///
/// Frees of addresses it does not know about are refused (not forwarded to the
/// inner allocator) and counted as violations. Noticeably slower than the plain
/// strategies, so it is only built when `debug_tracking` is configured.
#[derive(Debug)]
pub struct TrackingAllocator {
    inner: Arc<dyn Allocator>,
    outstanding: DashMap<usize, AllocationSite>,
    violations: AtomicUsize,
    last_violation: AtomicUsize,
}

impl TrackingAllocator {
    /// Wrap an allocator
    pub fn new(inner: Arc<dyn Allocator>) -> Self {
        Self {
            inner,
            outstanding: DashMap::with_capacity(16384),
            violations: AtomicUsize::new(0),
            last_violation: AtomicUsize::new(0),
        }
    }

    /// Number of allocations not yet freed
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Bytes held by allocations not yet freed
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding.iter().map(|e| e.value().size as u64).sum()
    }

    /// Number of frees of untracked addresses seen so far
    pub fn violation_count(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }

    /// Fail if any free of an untracked address was attempted
    pub fn check_violations(&self) -> Result<()> {
        if self.violation_count() == 0 {
            return Ok(());
        }
        Err(Error::UntrackedFree {
            address: self.last_violation.load(Ordering::Relaxed),
        })
    }

    /// Report every outstanding allocation.
    ///
    /// Each leak is logged with its allocation site; a non-empty set is an error.
    /// Reported allocations stay tracked, so a late free still reaches the inner
    /// allocator.
    pub fn report_leaks(&self) -> Result<()> {
        if self.outstanding.is_empty() {
            return Ok(());
        }

        let mut allocations = 0;
        let mut bytes = 0u64;
        for entry in self.outstanding.iter() {
            allocations += 1;
            bytes += entry.value().size as u64;
            tracing::error!(
                address = format_args!("{:#x}", entry.key()),
                size = entry.value().size,
                thread = %entry.value().thread,
                "still allocated:\n{}",
                entry.value().backtrace
            );
        }

        Err(Error::MemoryLeak { allocations, bytes })
    }
}

impl Allocator for TrackingAllocator {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate(bytes)?;
        let site = AllocationSite {
            size: bytes,
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            backtrace: Backtrace::capture(),
        };
        if self.outstanding.insert(ptr.as_ptr() as usize, site).is_some() {
            tracing::error!(
                address = format_args!("{:#x}", ptr.as_ptr() as usize),
                "allocator returned an address that is still outstanding"
            );
        }
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) {
        let address = ptr.as_ptr() as usize;
        match self.outstanding.remove(&address) {
            Some((_, site)) if site.size == bytes => {
                // SAFETY: the address was handed out by `inner` with this size.
                self.inner.free(ptr, bytes);
            }
            Some((_, site)) => {
                tracing::error!(
                    address = format_args!("{:#x}", address),
                    allocated = site.size,
                    freed = bytes,
                    "free with mismatched size"
                );
                self.violations.fetch_add(1, Ordering::Relaxed);
                self.last_violation.store(address, Ordering::Relaxed);
                // SAFETY: release with the size it was allocated with.
                self.inner.free(ptr, site.size);
            }
            None => {
                tracing::error!(
                    address = format_args!("{:#x}", address),
                    "free of unallocated region"
                );
                self.violations.fetch_add(1, Ordering::Relaxed);
                self.last_violation.store(address, Ordering::Relaxed);
            }
        }
    }

    fn total_allocated(&self) -> u64 {
        self.inner.total_allocated()
    }
}

// =============================================================================
// Strategy Resolution
// =============================================================================

/// Allocator chosen for one table, with the debug tracker when enabled
#[derive(Debug, Clone)]
pub struct ResolvedAllocator {
    /// Allocator handed to segments and streams
    pub allocator: Arc<dyn Allocator>,
    /// Same allocator viewed as a tracker, if debug tracking is on
    pub tracker: Option<Arc<TrackingAllocator>>,
}

impl ResolvedAllocator {
    /// Build the configured strategy
    pub fn resolve(kind: AllocatorKind, debug_tracking: bool) -> Result<Self> {
        let base: Arc<dyn Allocator> = match kind {
            AllocatorKind::Heap => Arc::new(HeapAllocator::new()),
            #[cfg(unix)]
            AllocatorKind::Malloc => Arc::new(MallocAllocator::new()),
            #[cfg(not(unix))]
            AllocatorKind::Malloc => {
                return Err(Error::Config(
                    "malloc allocator is only available on unix targets".into(),
                ))
            }
        };
        Ok(Self::from_allocator(base, debug_tracking))
    }

    /// Use a caller-supplied allocator
    pub fn from_allocator(base: Arc<dyn Allocator>, debug_tracking: bool) -> Self {
        if !debug_tracking {
            return Self {
                allocator: base,
                tracker: None,
            };
        }

        tracing::warn!(
            allocator = base.name(),
            "Degraded performance: off-heap allocations are tracked by debug code"
        );
        let tracker = Arc::new(TrackingAllocator::new(base));
        Self {
            allocator: tracker.clone(),
            tracker: Some(tracker),
        }
    }
}

// =============================================================================
// Off-Heap Block
// =============================================================================

/// Exclusively owned off-heap byte range.
///
/// Freed through its allocator when dropped.
pub struct OffHeapBlock {
    ptr: NonNull<u8>,
    len: usize,
    allocator: Arc<dyn Allocator>,
}

// SAFETY: OffHeapBlock owns its memory exclusively; shared access is read-only and
// mutation requires `&mut self`.
unsafe impl Send for OffHeapBlock {}
unsafe impl Sync for OffHeapBlock {}

impl OffHeapBlock {
    /// Allocate a block, returning `None` if the allocator is exhausted.
    ///
    /// The contents are zeroed.
    pub fn allocate(allocator: &Arc<dyn Allocator>, len: usize) -> Option<Self> {
        let ptr = allocator.allocate(len)?;
        // SAFETY: ptr is valid for `len` writable bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Some(Self {
            ptr,
            len,
            allocator: Arc::clone(allocator),
        })
    }

    /// Allocate a block or fail with `Error::OutOfMemory`
    pub fn allocate_or_err(allocator: &Arc<dyn Allocator>, len: usize) -> Result<Self> {
        Self::allocate(allocator, len).ok_or(Error::OutOfMemory {
            requested: len,
            allocator: allocator.name(),
        })
    }

    /// Size of the block in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false for an allocated block
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start address, for diagnostics only
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for self.len bytes and initialized (zeroed on allocation).
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for self.len bytes and we have exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for OffHeapBlock {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `allocator.allocate(self.len)` and this is
        // the only handle to it.
        unsafe { self.allocator.free(self.ptr, self.len) };
    }
}

impl Deref for OffHeapBlock {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for OffHeapBlock {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl fmt::Debug for OffHeapBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffHeapBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn heap() -> Arc<dyn Allocator> {
        Arc::new(HeapAllocator::new())
    }

    #[test]
    fn test_block_allocation_tracks_total() {
        let allocator = heap();
        let block = OffHeapBlock::allocate(&allocator, 128).unwrap();
        assert_eq!(block.len(), 128);
        assert_eq!(allocator.total_allocated(), 128);
        assert!(block.iter().all(|&b| b == 0));

        drop(block);
        assert_eq!(allocator.total_allocated(), 0);
    }

    #[test]
    fn test_block_alignment() {
        let allocator = heap();
        let block = OffHeapBlock::allocate(&allocator, 24).unwrap();
        assert_eq!(block.address() % BLOCK_ALIGNMENT, 0);
    }

    #[test]
    fn test_block_read_write() {
        let allocator = heap();
        let mut block = OffHeapBlock::allocate(&allocator, 8).unwrap();
        block.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&block[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_zero_size_allocation_refused() {
        let allocator = heap();
        assert!(allocator.allocate(0).is_none());
    }

    #[test]
    fn test_heap_limit_returns_none() {
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::with_limit(100));
        let a = OffHeapBlock::allocate(&allocator, 60).unwrap();
        assert!(OffHeapBlock::allocate(&allocator, 60).is_none());
        assert_eq!(allocator.total_allocated(), 60);

        drop(a);
        assert!(OffHeapBlock::allocate(&allocator, 60).is_some());
    }

    #[test]
    fn test_allocate_or_err_reports_oom() {
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::with_limit(10));
        let err = OffHeapBlock::allocate_or_err(&allocator, 11).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfMemory {
                requested: 11,
                allocator: "heap"
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_malloc_allocator() {
        let allocator: Arc<dyn Allocator> = Arc::new(MallocAllocator::new());
        let mut block = OffHeapBlock::allocate(&allocator, 4096).unwrap();
        block.fill(0xAB);
        assert_eq!(allocator.total_allocated(), 4096);
        drop(block);
        assert_eq!(allocator.total_allocated(), 0);
    }

    #[test]
    fn test_tracking_reports_leaks() {
        let resolved = ResolvedAllocator::resolve(AllocatorKind::Heap, true).unwrap();
        let tracker = resolved.tracker.clone().unwrap();

        let block = OffHeapBlock::allocate(&resolved.allocator, 64).unwrap();
        assert_eq!(tracker.outstanding_count(), 1);
        assert_eq!(tracker.outstanding_bytes(), 64);

        // Leak it deliberately; the tracker must notice.
        std::mem::forget(block);
        let err = tracker.report_leaks().unwrap_err();
        assert!(matches!(
            err,
            Error::MemoryLeak {
                allocations: 1,
                bytes: 64
            }
        ));
        assert_eq!(tracker.outstanding_count(), 1);
    }

    #[test]
    fn test_reported_leak_freed_later_is_forwarded() {
        let resolved = ResolvedAllocator::resolve(AllocatorKind::Heap, true).unwrap();
        let tracker = resolved.tracker.clone().unwrap();

        let block = OffHeapBlock::allocate(&resolved.allocator, 128).unwrap();
        assert_matches!(
            tracker.report_leaks(),
            Err(Error::MemoryLeak {
                allocations: 1,
                bytes: 128
            })
        );
        assert_eq!(resolved.allocator.total_allocated(), 128);

        drop(block);
        assert_eq!(tracker.violation_count(), 0);
        assert_eq!(tracker.outstanding_count(), 0);
        assert_eq!(resolved.allocator.total_allocated(), 0);
        assert!(tracker.check_violations().is_ok());
        assert!(tracker.report_leaks().is_ok());
    }

    #[test]
    fn test_tracking_clean_shutdown() {
        let resolved = ResolvedAllocator::resolve(AllocatorKind::Heap, true).unwrap();
        let tracker = resolved.tracker.clone().unwrap();

        let blocks: Vec<_> = (1..=10)
            .map(|i| OffHeapBlock::allocate(&resolved.allocator, i * 8).unwrap())
            .collect();
        assert_eq!(tracker.outstanding_count(), 10);
        drop(blocks);

        tracker.report_leaks().unwrap();
        tracker.check_violations().unwrap();
    }

    #[test]
    fn test_tracking_refuses_untracked_free() {
        let inner = heap();
        let tracker = TrackingAllocator::new(inner.clone());
        let foreign = inner.allocate(16).unwrap();

        // SAFETY: the tracker does not forward untracked frees, so `foreign`
        // stays valid and is released through `inner` below.
        unsafe { tracker.free(foreign, 16) };
        assert_eq!(tracker.violation_count(), 1);
        assert!(matches!(
            tracker.check_violations(),
            Err(Error::UntrackedFree { .. })
        ));

        unsafe { inner.free(foreign, 16) };
        assert_eq!(inner.total_allocated(), 0);
    }

    #[test]
    fn test_allocator_kind_parse() {
        assert_eq!("heap".parse::<AllocatorKind>().unwrap(), AllocatorKind::Heap);
        assert_eq!(
            "MALLOC".parse::<AllocatorKind>().unwrap(),
            AllocatorKind::Malloc
        );
        assert!("arena".parse::<AllocatorKind>().is_err());
    }
}
