//! Shared-memory allocations handed out by the pool manager

use std::{
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::Arc,
};

use crate::{domain::DomainId, error::Result};

use super::{
    config::AllocFlags,
    manager::ShmemManager,
    mapper::RemoteMapping,
    region::HostRegion,
};

/// Opaque handle naming one outstanding allocation
pub type PoolHandle = u64;

/// Where an allocation's memory comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// A block owned by the pool
    Pool,
    /// Memory supplied by another subsystem
    Extern,
}

/// Bookkeeping carried alongside an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocMeta {
    pub kind: AllocKind,
    pub flags: AllocFlags,
    /// Domain the allocation was requested for
    pub domain: DomainId,
    /// Size of the underlying block (frame-rounded for pool memory)
    pub block_size: usize,
}

/// A region of shared memory exclusively owned by its holder
///
/// Not `Clone`: it must be handed back to exactly one
/// [`ShmemManager::free`] or [`ShmemManager::unmap_extern_mem`].
#[derive(Debug)]
pub struct Allocation {
    pub(crate) handle: PoolHandle,
    pub(crate) vaddr: NonNull<u8>,
    pub(crate) len: usize,
    pub(crate) mapping: RemoteMapping,
    pub(crate) meta: AllocMeta,
    pub(crate) _backing: Option<Arc<HostRegion>>,
}

impl Allocation {
    pub fn handle(&self) -> PoolHandle {
        self.handle
    }

    /// Host virtual address
    pub fn as_ptr(&self) -> *mut u8 {
        self.vaddr.as_ptr()
    }

    /// Requested length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Map handle on the home domain
    pub fn map_handle(&self) -> u32 {
        self.mapping.map_handle
    }

    /// Remote address on the home domain
    pub fn remote_addr(&self) -> u64 {
        self.mapping.remote_addr
    }

    /// Remote address of the byte at `offset`
    pub fn remote_addr_at(&self, offset: usize) -> u64 {
        self.mapping.remote_addr + offset as u64
    }

    pub fn metadata(&self) -> &AllocMeta {
        &self.meta
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.vaddr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.vaddr.as_ptr(), self.len) }
    }
}

unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Memory that originates outside the pool
#[derive(Debug)]
pub struct ExternMemory {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) len: usize,
    pub(crate) fd: Option<i32>,
}

impl ExternMemory {
    /// Describe foreign memory for [`ShmemManager::map_extern_mem`]
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// resulting allocation is passed to `unmap_extern_mem`.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, fd: Option<i32>) -> Self {
        Self { ptr, len, fd }
    }
}

unsafe impl Send for ExternMemory {}

/// Scoped allocation that is freed on drop unless released
#[derive(Debug)]
pub struct AllocationGuard<'a> {
    manager: &'a ShmemManager,
    alloc: Option<Allocation>,
}

impl<'a> AllocationGuard<'a> {
    pub fn new(manager: &'a ShmemManager, alloc: Allocation) -> Self {
        Self {
            manager,
            alloc: Some(alloc),
        }
    }

    /// Keep the allocation past the guard's scope
    pub fn into_inner(mut self) -> Allocation {
        match self.alloc.take() {
            Some(alloc) => alloc,
            None => unreachable!("guard emptied before into_inner"),
        }
    }

    /// Free now and report the outcome
    pub fn free(mut self) -> Result<()> {
        match self.alloc.take() {
            Some(alloc) => self.manager.free(alloc),
            None => Ok(()),
        }
    }
}

impl Deref for AllocationGuard<'_> {
    type Target = Allocation;

    fn deref(&self) -> &Allocation {
        match &self.alloc {
            Some(alloc) => alloc,
            None => unreachable!("guard emptied before drop"),
        }
    }
}

impl DerefMut for AllocationGuard<'_> {
    fn deref_mut(&mut self) -> &mut Allocation {
        match &mut self.alloc {
            Some(alloc) => alloc,
            None => unreachable!("guard emptied before drop"),
        }
    }
}

impl Drop for AllocationGuard<'_> {
    fn drop(&mut self) {
        if let Some(alloc) = self.alloc.take() {
            if let Err(e) = self.manager.free(alloc) {
                log::warn!("Failed to release scoped allocation: {}", e);
            }
        }
    }
}
