//! Process-wide counters of refcount activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct RefCountStats {
    /// Objects allocated.
    pub allocations: AtomicU64,
    /// Objects torn down.
    pub deallocations: AtomicU64,
    /// Payload bytes requested across all allocations.
    pub payload_bytes: AtomicU64,
    /// Successful retains.
    pub retains: AtomicU64,
    /// Successful releases (including the final one).
    pub releases: AtomicU64,
}

/// Point-in-time copy of [`RefCountStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Objects allocated.
    pub allocations: u64,
    /// Objects torn down.
    pub deallocations: u64,
    /// Payload bytes requested.
    pub payload_bytes: u64,
    /// Successful retains.
    pub retains: u64,
    /// Successful releases.
    pub releases: u64,
}

impl StatsSnapshot {
    /// Objects allocated but not yet torn down.
    pub fn live_objects(&self) -> u64 {
        self.allocations.saturating_sub(self.deallocations)
    }
}

impl RefCountStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
            retains: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            retains: self.retains.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_allocation(&self, payload_size: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes.fetch_add(payload_size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retain(&self) {
        self.retains.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}

static STATS: RefCountStats = RefCountStats::new();

/// The global counters.
pub fn stats() -> &'static RefCountStats {
    &STATS
}
