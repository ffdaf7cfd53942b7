//! Remote mapping boundary and an in-process simulation of it

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use crate::{
    domain::DomainId,
    error::{GslError, Result},
};

use super::config::{AllocFlags, PlatformInfo};

/// Host memory handed to a mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDesc {
    /// Host virtual address of the first byte
    pub host_addr: usize,
    /// Length in bytes
    pub len: usize,
    /// Importable descriptor, if the backing has one
    pub fd: Option<i32>,
}

/// A mapping as seen from the remote domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMapping {
    /// Handle the remote side uses to name the region
    pub map_handle: u32,
    /// Remote-visible address of the first byte
    pub remote_addr: u64,
}

/// Hypervisor virtual-machine identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(pub u32);

impl VmId {
    pub const HLOS: VmId = VmId(3);
    pub const LPASS: VmId = VmId(22);
    pub const ADSP_HEAP: VmId = VmId(37);
}

/// OS / FastRPC level mapping of host memory into remote domains
pub trait RemoteMapper: Send + Sync + fmt::Debug {
    /// Make `region` visible to `domain`
    fn map(
        &self,
        domain: DomainId,
        region: &RegionDesc,
        flags: &AllocFlags,
        platform: Option<&PlatformInfo>,
    ) -> Result<RemoteMapping>;

    /// Remove a mapping previously returned by `map`
    fn unmap(&self, domain: DomainId, mapping: &RemoteMapping) -> Result<()>;

    /// Reassign hypervisor ownership of `region` from `src` to `dest`
    fn hyp_assign(&self, region: &RegionDesc, dest: &[VmId], src: &[VmId]) -> Result<()>;
}

#[derive(Debug)]
struct SimMapping {
    domain: DomainId,
    remote_addr: u64,
    host_addr: usize,
    len: usize,
    uncached: bool,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: u32,
    iova_cursor: HashMap<DomainId, u64>,
    mappings: HashMap<u32, SimMapping>,
    hyp_owners: HashMap<usize, Vec<VmId>>,
}

/// In-process mapper with a per-domain IOVA space
///
/// Remote addresses are synthetic but can be translated back to host
/// memory with [`SimulatedMapper::resolve`], which lets a simulated DSP
/// touch the same bytes the host sees.
#[derive(Debug, Default)]
pub struct SimulatedMapper {
    state: Mutex<SimState>,
    fail_next_map: AtomicBool,
    map_calls: AtomicU64,
    unmap_calls: AtomicU64,
}

const IOVA_BASE: u64 = 0x8000_0000;
const IOVA_DOMAIN_SHIFT: u32 = 36;
const IOVA_ALIGN: u64 = 4096;

impl SimulatedMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `map` call fail with a resource error
    pub fn fail_next_map(&self) {
        self.fail_next_map.store(true, Ordering::SeqCst);
    }

    /// Number of `map` calls made so far
    pub fn map_calls(&self) -> u64 {
        self.map_calls.load(Ordering::Relaxed)
    }

    /// Number of `unmap` calls made so far
    pub fn unmap_calls(&self) -> u64 {
        self.unmap_calls.load(Ordering::Relaxed)
    }

    /// Live mappings on a domain
    pub fn live_mappings(&self, domain: DomainId) -> usize {
        self.state()
            .mappings
            .values()
            .filter(|m| m.domain == domain)
            .count()
    }

    /// Drop every mapping on a domain, as a remote crash would
    pub fn forget_domain(&self, domain: DomainId) {
        let mut state = self.state();
        state.mappings.retain(|_, m| m.domain != domain);
        state.iova_cursor.remove(&domain);
    }

    /// Translate a remote address on `domain` back to a host address
    pub fn resolve(&self, domain: DomainId, remote_addr: u64) -> Option<usize> {
        let state = self.state();
        state.mappings.values().find_map(|m| {
            let end = m.remote_addr + m.len as u64;
            if m.domain == domain && remote_addr >= m.remote_addr && remote_addr < end {
                Some(m.host_addr + (remote_addr - m.remote_addr) as usize)
            } else {
                None
            }
        })
    }

    /// Whether the mapping behind `map_handle` was made uncached
    pub fn is_uncached(&self, map_handle: u32) -> Option<bool> {
        self.state().mappings.get(&map_handle).map(|m| m.uncached)
    }

    /// Current hypervisor owners of the region starting at `host_addr`
    pub fn owners(&self, host_addr: usize) -> Option<Vec<VmId>> {
        self.state().hyp_owners.get(&host_addr).cloned()
    }
}

impl RemoteMapper for SimulatedMapper {
    fn map(
        &self,
        domain: DomainId,
        region: &RegionDesc,
        flags: &AllocFlags,
        _platform: Option<&PlatformInfo>,
    ) -> Result<RemoteMapping> {
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_next_map.swap(false, Ordering::SeqCst) {
            return Err(GslError::resource(format!(
                "simulated map failure on {}",
                domain
            )));
        }

        let mut state = self.state();
        state.next_handle = state.next_handle.wrapping_add(1).max(1);
        let map_handle = state.next_handle;

        let domain_base = IOVA_BASE + ((domain.0 as u64) << IOVA_DOMAIN_SHIFT);
        let cursor = state.iova_cursor.entry(domain).or_insert(domain_base);
        let remote_addr = *cursor;
        let span = (region.len as u64 + IOVA_ALIGN - 1) & !(IOVA_ALIGN - 1);
        *cursor += span;

        state.mappings.insert(
            map_handle,
            SimMapping {
                domain,
                remote_addr,
                host_addr: region.host_addr,
                len: region.len,
                uncached: flags.uncached,
            },
        );

        Ok(RemoteMapping {
            map_handle,
            remote_addr,
        })
    }

    fn unmap(&self, domain: DomainId, mapping: &RemoteMapping) -> Result<()> {
        self.unmap_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        match state.mappings.get(&mapping.map_handle) {
            Some(m) if m.domain == domain => {
                state.mappings.remove(&mapping.map_handle);
                Ok(())
            }
            _ => Err(GslError::bad_parameter(
                "map_handle",
                format!("{:#x} is not mapped on {}", mapping.map_handle, domain),
            )),
        }
    }

    fn hyp_assign(&self, region: &RegionDesc, dest: &[VmId], _src: &[VmId]) -> Result<()> {
        if dest.is_empty() {
            return Err(GslError::bad_parameter("dest_sys", "No destination VM"));
        }
        self.state()
            .hyp_owners
            .insert(region.host_addr, dest.to_vec());
        Ok(())
    }
}
