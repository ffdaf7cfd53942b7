//! Configuration types for the shared-memory pool

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{GslError, Result};

/// Types of host-side backing for pool blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingType {
    /// Private anonymous mapping (no descriptor to hand to a mapper)
    Anonymous,
    /// File-backed shared memory under `ShmemPoolConfig::file_dir`
    FileBacked,
    /// Anonymous memory file descriptor (Linux-specific)
    #[cfg(target_os = "linux")]
    MemFd,
}

impl Default for BackingType {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::MemFd
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::Anonymous
        }
    }
}

impl BackingType {
    /// Get a human-readable name for the backing type
    pub fn name(&self) -> &'static str {
        match self {
            BackingType::Anonymous => "anonymous",
            BackingType::FileBacked => "file-backed",
            #[cfg(target_os = "linux")]
            BackingType::MemFd => "memfd",
        }
    }
}

/// What to do with memory-map packets queued while a domain was down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PendingPolicy {
    /// Hand map requests back for replay, drop unmap requests
    #[default]
    Replay,
    /// Drop everything that was queued
    Discard,
}

/// Configuration of the shared-memory pool manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmemPoolConfig {
    /// Allocation granularity; every block is a multiple of this
    pub frame_size: usize,
    /// Upper bound on bytes kept mapped in the free list for reuse
    pub max_cached_bytes: usize,
    /// Upper bound on host bytes owned by the pool (in use + cached)
    pub max_pool_bytes: usize,
    /// Host backing for new blocks
    pub backing_type: BackingType,
    /// Directory for file-backed blocks
    pub file_dir: Option<PathBuf>,
    /// Replay policy for memory-map packets cached during SSR
    pub pending_policy: PendingPolicy,
    /// Maximum queued memory-map packets per domain
    pub max_pending_packets: usize,
}

impl Default for ShmemPoolConfig {
    fn default() -> Self {
        Self {
            frame_size: crate::config::DEFAULT_FRAME_SIZE,
            max_cached_bytes: 4 * 1024 * 1024,
            max_pool_bytes: 64 * 1024 * 1024,
            backing_type: BackingType::default(),
            file_dir: None,
            pending_policy: PendingPolicy::default(),
            max_pending_packets: 32,
        }
    }
}

impl ShmemPoolConfig {
    /// Set the frame size
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Set the free-list budget
    pub fn with_max_cached_bytes(mut self, bytes: usize) -> Self {
        self.max_cached_bytes = bytes;
        self
    }

    /// Set the total pool budget
    pub fn with_max_pool_bytes(mut self, bytes: usize) -> Self {
        self.max_pool_bytes = bytes;
        self
    }

    /// Set the backing type
    pub fn with_backing_type(mut self, backing_type: BackingType) -> Self {
        self.backing_type = backing_type;
        self
    }

    /// Set the directory for file-backed blocks
    pub fn with_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_dir = Some(dir.into());
        self
    }

    /// Set the pending-packet policy
    pub fn with_pending_policy(mut self, policy: PendingPolicy) -> Self {
        self.pending_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 || !self.frame_size.is_power_of_two() {
            return Err(GslError::bad_parameter(
                "frame_size",
                "Frame size must be a non-zero power of two",
            ));
        }

        if self.max_pool_bytes < self.frame_size {
            return Err(GslError::bad_parameter(
                "max_pool_bytes",
                "Pool budget must hold at least one frame",
            ));
        }

        if self.max_cached_bytes > self.max_pool_bytes {
            return Err(GslError::bad_parameter(
                "max_cached_bytes",
                "Cache budget cannot exceed the pool budget",
            ));
        }

        if self.backing_type == BackingType::FileBacked && self.file_dir.is_none() {
            return Err(GslError::bad_parameter(
                "file_dir",
                "File-backed pools need a directory",
            ));
        }

        Ok(())
    }

    /// Round a request up to the frame granularity; `None` on overflow
    pub fn round_to_frame(&self, size: usize) -> Option<usize> {
        size.checked_add(self.frame_size - 1)
            .map(|s| s & !(self.frame_size - 1))
    }
}

/// Allocation attributes, validated together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocFlags {
    /// Ownership is handed to the remote side for the session
    pub loaned: bool,
    /// The block is never shared with, or reused for, another allocation
    pub dedicated_page: bool,
    /// Remote mapping without caching
    pub uncached: bool,
    /// Contiguous (CMA) backing
    pub cma: bool,
}

impl AllocFlags {
    /// Flags for memory loaned to the remote side
    pub fn loaned() -> Self {
        Self {
            loaned: true,
            dedicated_page: true,
            ..Default::default()
        }
    }

    /// Set the uncached attribute
    pub fn with_uncached(mut self, uncached: bool) -> Self {
        self.uncached = uncached;
        self
    }

    /// Set the dedicated-page attribute
    pub fn with_dedicated_page(mut self, dedicated: bool) -> Self {
        self.dedicated_page = dedicated;
        self
    }

    /// Set the CMA attribute
    pub fn with_cma(mut self, cma: bool) -> Self {
        self.cma = cma;
        self
    }

    /// Validate the combination of attributes
    pub fn validate(&self) -> Result<()> {
        if self.loaned && !self.dedicated_page {
            return Err(GslError::bad_parameter(
                "flags",
                "Loaned memory must live on dedicated pages",
            ));
        }
        if self.cma && !self.dedicated_page {
            return Err(GslError::bad_parameter(
                "flags",
                "CMA memory must live on dedicated pages",
            ));
        }
        Ok(())
    }

    /// Whether a block with these flags may go back to the free list
    pub fn is_reusable(&self) -> bool {
        !(self.loaned || self.dedicated_page || self.cma)
    }
}

/// Platform data passed through to the remote mapper untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Heap the remote side should account the mapping to
    pub heap_id: Option<u32>,
    /// Hypervisor VM the memory is destined for
    pub vmid: Option<u32>,
}
