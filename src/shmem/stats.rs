//! Pool manager statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for the pool manager
#[derive(Debug, Default)]
pub struct ShmemStats {
    /// `alloc`/`alloc_ext` calls
    pub alloc_requests: AtomicU64,
    /// Blocks created and mapped fresh
    pub blocks_created: AtomicU64,
    /// Requests satisfied from the free list
    pub blocks_reused: AtomicU64,
    /// Blocks unmapped and released to the OS
    pub blocks_released: AtomicU64,
    /// Remote map operations issued
    pub remote_maps: AtomicU64,
    /// Remote unmap operations issued
    pub remote_unmaps: AtomicU64,
    /// Allocation failures
    pub failures: AtomicU64,
}

/// Point-in-time copy of [`ShmemStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShmemStatsSnapshot {
    pub alloc_requests: u64,
    pub blocks_created: u64,
    pub blocks_reused: u64,
    pub blocks_released: u64,
    pub remote_maps: u64,
    pub remote_unmaps: u64,
    pub failures: u64,
}

impl ShmemStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> ShmemStatsSnapshot {
        ShmemStatsSnapshot {
            alloc_requests: self.alloc_requests.load(Ordering::Relaxed),
            blocks_created: self.blocks_created.load(Ordering::Relaxed),
            blocks_reused: self.blocks_reused.load(Ordering::Relaxed),
            blocks_released: self.blocks_released.load(Ordering::Relaxed),
            remote_maps: self.remote_maps.load(Ordering::Relaxed),
            remote_unmaps: self.remote_unmaps.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl ShmemStatsSnapshot {
    /// Fraction of requests served from the free list (0.0 to 1.0)
    pub fn reuse_rate(&self) -> f64 {
        if self.alloc_requests == 0 {
            return 0.0;
        }
        self.blocks_reused as f64 / self.alloc_requests as f64
    }
}
