//! # Raw Allocation
//!
//! Backing storage for slot + payload regions comes from a [`RawAllocator`].
//! The runtime never returns these regions: after teardown the back-link
//! stays readable (and null) so that later use is detected rather than
//! reading reused memory.
//!
//! The default allocator is [`SystemAllocator`], which forwards to the global
//! Rust allocator and enforces the optional `max_heap_size` limit from
//! [`crate::config::MemoryConfig`]. A different allocator can be installed
//! once, before the first allocation, with [`install_allocator`].

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Source of uninitialized memory for indirect objects.
pub trait RawAllocator: Send + Sync {
    /// Allocate a region satisfying `layout`, or `None` if exhausted.
    ///
    /// `layout` always has a non-zero size.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;
}

/// Allocator backed by `std::alloc` with an optional byte limit.
#[derive(Debug)]
pub struct SystemAllocator {
    /// Byte limit; 0 means unlimited.
    max_heap_size: AtomicU64,
    /// Bytes handed out so far.
    bytes_allocated: AtomicU64,
    /// Regions handed out so far.
    allocations: AtomicU64,
}

impl SystemAllocator {
    /// Create an allocator with no limit.
    pub const fn new() -> Self {
        Self::with_limit(0)
    }

    /// Create an allocator that refuses to exceed `max_heap_size` bytes.
    pub const fn with_limit(max_heap_size: u64) -> Self {
        Self {
            max_heap_size: AtomicU64::new(max_heap_size),
            bytes_allocated: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    /// Set the byte limit (0 = unlimited).
    pub fn set_max_heap_size(&self, limit: u64) {
        self.max_heap_size.store(limit, Ordering::Relaxed);
    }

    /// Current byte limit.
    pub fn max_heap_size(&self) -> u64 {
        self.max_heap_size.load(Ordering::Relaxed)
    }

    /// Total bytes handed out.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Total regions handed out.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Reserve `size` bytes against the limit.
    fn reserve(&self, size: u64) -> bool {
        let limit = self.max_heap_size();
        self.bytes_allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| limit == 0 || total <= limit)
            })
            .is_ok()
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RawAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let size = layout.size() as u64;
        if !self.reserve(size) {
            return None;
        }

        let ptr = NonNull::new(unsafe { alloc::alloc(layout) });
        match ptr {
            Some(_) => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.bytes_allocated.fetch_sub(size, Ordering::Relaxed);
            }
        }
        ptr
    }
}

/// Error returned when an allocator is already installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorAlreadyInstalled;

impl fmt::Display for AllocatorAlreadyInstalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a raw allocator has already been installed")
    }
}

impl std::error::Error for AllocatorAlreadyInstalled {}

static SYSTEM_ALLOCATOR: SystemAllocator = SystemAllocator::new();

static INSTALLED: OnceLock<&'static dyn RawAllocator> = OnceLock::new();

/// The built-in system allocator.
pub fn system_allocator() -> &'static SystemAllocator {
    &SYSTEM_ALLOCATOR
}

/// Install the process-wide allocator. Only the first call succeeds.
pub fn install_allocator(allocator: &'static dyn RawAllocator) -> Result<(), AllocatorAlreadyInstalled> {
    INSTALLED.set(allocator).map_err(|_| AllocatorAlreadyInstalled)
}

/// The process-wide allocator used by [`crate::refcount::allocate`].
pub fn global_allocator() -> &'static dyn RawAllocator {
    match INSTALLED.get() {
        Some(allocator) => *allocator,
        None => &SYSTEM_ALLOCATOR,
    }
}
