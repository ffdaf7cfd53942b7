//! Shared-memory pool manager

use std::{
    collections::{BTreeMap, HashMap},
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    apm::{
        SharedMemMapRegion, APM_MEMORY_MAP_BIT_MASK_IS_MEM_LOANED,
        APM_MEMORY_MAP_BIT_MASK_IS_UNCACHED, APM_MEMORY_MAP_SHMEM8_4K_POOL,
    },
    domain::DomainId,
    error::{GslError, Result},
    transport::Packet,
};

use super::{
    allocation::{AllocKind, AllocMeta, Allocation, ExternMemory, PoolHandle},
    config::{AllocFlags, PlatformInfo, ShmemPoolConfig},
    mapper::{RegionDesc, RemoteMapper, RemoteMapping, VmId},
    region::HostRegion,
    ssr::{DomainKind, DomainState, MemMapKind},
    stats::{ShmemStats, ShmemStatsSnapshot},
};

type BlockId = u64;

#[derive(Debug)]
enum BlockMemory {
    Pool(Arc<HostRegion>),
    Extern { ptr: NonNull<u8>, fd: Option<i32> },
}

// Extern memory validity is guaranteed by the `ExternMemory::new` contract.
unsafe impl Send for BlockMemory {}

#[derive(Debug, Clone, Copy)]
struct MappingEntry {
    mapping: RemoteMapping,
    /// The remote side lost this mapping in a subsystem restart
    stale: bool,
}

#[derive(Debug)]
struct Block {
    memory: BlockMemory,
    size: usize,
    home: DomainId,
    flags: AllocFlags,
    platform: Option<PlatformInfo>,
    mappings: BTreeMap<DomainId, MappingEntry>,
    owner: Option<PoolHandle>,
    vm_owners: Vec<VmId>,
}

impl Block {
    fn base(&self) -> NonNull<u8> {
        match &self.memory {
            BlockMemory::Pool(region) => region.base(),
            BlockMemory::Extern { ptr, .. } => *ptr,
        }
    }

    fn desc(&self) -> RegionDesc {
        let fd = match &self.memory {
            BlockMemory::Pool(region) => region.fd(),
            BlockMemory::Extern { fd, .. } => *fd,
        };
        RegionDesc {
            host_addr: self.base().as_ptr() as usize,
            len: self.size,
            fd,
        }
    }

    fn kind(&self) -> AllocKind {
        match self.memory {
            BlockMemory::Pool(_) => AllocKind::Pool,
            BlockMemory::Extern { .. } => AllocKind::Extern,
        }
    }

    fn live_mapping(&self, domain: DomainId) -> Option<RemoteMapping> {
        self.mappings
            .get(&domain)
            .filter(|entry| !entry.stale)
            .map(|entry| entry.mapping)
    }

    fn allocation(&self, handle: PoolHandle, len: usize) -> Result<Allocation> {
        let mapping = self
            .live_mapping(self.home)
            .ok_or(GslError::DomainDown { domain: self.home })?;
        let backing = match &self.memory {
            BlockMemory::Pool(region) => Some(Arc::clone(region)),
            BlockMemory::Extern { .. } => None,
        };
        Ok(Allocation {
            handle,
            vaddr: self.base(),
            len,
            mapping,
            meta: AllocMeta {
                kind: self.kind(),
                flags: self.flags,
                domain: self.home,
                block_size: self.size,
            },
            _backing: backing,
        })
    }
}

#[derive(Debug)]
struct PoolInner {
    active: bool,
    domains: HashMap<DomainId, DomainState>,
    blocks: HashMap<BlockId, Block>,
    free_list: Vec<BlockId>,
    outstanding: HashMap<PoolHandle, BlockId>,
    next_block: BlockId,
    next_handle: PoolHandle,
    cached_bytes: usize,
    pool_bytes: usize,
}

impl PoolInner {
    fn block_of(&self, handle: PoolHandle) -> Result<BlockId> {
        self.outstanding.get(&handle).copied().ok_or_else(|| {
            GslError::bad_parameter("allocation", format!("handle {} is not outstanding", handle))
        })
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks
            .get_mut(&id)
            .ok_or_else(|| GslError::platform(format!("pool block {} vanished", id)))
    }
}

/// Memory-map packets drained after a subsystem restart
#[derive(Debug, Default)]
pub struct PendingDrain {
    /// Requests to send now that the domain is back
    pub replay: Vec<Packet>,
    /// Requests dropped by policy; the caller still owns their packets
    pub discarded: Vec<Packet>,
}

/// Allocates, maps, reuses and releases memory shared with remote domains
///
/// All block-state mutation is serialized behind one lock. Blocks are
/// frame-granular; a freed block keeps its home-domain mapping and is handed
/// to the next compatible request for that domain.
#[derive(Debug)]
pub struct ShmemManager {
    config: ShmemPoolConfig,
    mapper: Arc<dyn RemoteMapper>,
    inner: Mutex<PoolInner>,
    stats: ShmemStats,
}

impl ShmemManager {
    /// Set up the pool for a fixed set of master domains
    pub fn init(
        domains: &[DomainId],
        config: ShmemPoolConfig,
        mapper: Arc<dyn RemoteMapper>,
    ) -> Result<Self> {
        config.validate()?;
        if domains.is_empty() {
            return Err(GslError::bad_parameter("domains", "At least one master domain is required"));
        }

        let domains = domains
            .iter()
            .map(|d| (*d, DomainState::new(DomainKind::Master)))
            .collect();

        log::debug!("Shared memory pool up, frame size {}", config.frame_size);

        Ok(Self {
            config,
            mapper,
            inner: Mutex::new(PoolInner {
                active: true,
                domains,
                blocks: HashMap::new(),
                free_list: Vec::new(),
                outstanding: HashMap::new(),
                next_block: 1,
                next_handle: 1,
                cached_bytes: 0,
                pool_bytes: 0,
            }),
            stats: ShmemStats::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, PoolInner>> {
        let inner = self.lock();
        if !inner.active {
            return Err(GslError::not_ready("shared memory pool is deinitialized"));
        }
        Ok(inner)
    }

    fn check_domain(inner: &PoolInner, domain: DomainId, kind: DomainKind) -> Result<()> {
        match inner.domains.get(&domain) {
            Some(state) if state.kind == kind => {
                if state.down {
                    Err(GslError::DomainDown { domain })
                } else {
                    Ok(())
                }
            }
            Some(_) if kind == DomainKind::Master => Err(GslError::bad_parameter(
                "domain",
                format!("{} is a dynamic PD, not a master domain", domain),
            )),
            Some(_) => Err(GslError::bad_parameter(
                "domain",
                format!("{} is a master domain, not a dynamic PD", domain),
            )),
            None => Err(GslError::bad_parameter(
                "domain",
                format!("{} is not known to the pool", domain),
            )),
        }
    }

    /// Release the pool; fails while allocations are outstanding
    pub fn deinit(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.active {
            return Ok(());
        }
        if !inner.outstanding.is_empty() {
            return Err(GslError::busy(format!(
                "{} allocations still outstanding",
                inner.outstanding.len()
            )));
        }
        self.release_free_list(&mut inner);
        inner.active = false;
        Ok(())
    }

    /// Allocate `size` bytes shared with `domain`, default attributes
    pub fn alloc(&self, size: usize, domain: DomainId) -> Result<Allocation> {
        self.alloc_ext(size, domain, AllocFlags::default(), None)
    }

    /// Allocate `size` bytes shared with `domain`
    pub fn alloc_ext(
        &self,
        size: usize,
        domain: DomainId,
        flags: AllocFlags,
        platform: Option<&PlatformInfo>,
    ) -> Result<Allocation> {
        ShmemStats::bump(&self.stats.alloc_requests);
        let result = self.alloc_inner(size, domain, flags, platform);
        if let Err(e) = &result {
            ShmemStats::bump(&self.stats.failures);
            log::warn!("Shared memory alloc of {} bytes on {} failed: {}", size, domain, e);
        }
        result
    }

    fn alloc_inner(
        &self,
        size: usize,
        domain: DomainId,
        flags: AllocFlags,
        platform: Option<&PlatformInfo>,
    ) -> Result<Allocation> {
        flags.validate()?;
        if size == 0 {
            return Err(GslError::bad_parameter("size", "Allocation size must be greater than 0"));
        }

        let mut inner = self.lock_active()?;
        if !inner.domains.contains_key(&domain) {
            return Err(GslError::resource(format!(
                "No shared memory pool for {}",
                domain
            )));
        }
        Self::check_domain(&inner, domain, DomainKind::Master)?;

        let rounded = match self.config.round_to_frame(size) {
            Some(rounded) => rounded,
            None => {
                return Err(GslError::resource(format!(
                    "{} bytes cannot be rounded to a {} byte frame",
                    size, self.config.frame_size
                )))
            }
        };
        if rounded > self.config.max_pool_bytes {
            return Err(GslError::resource(format!(
                "{} bytes exceeds the pool budget of {}",
                rounded, self.config.max_pool_bytes
            )));
        }

        let reusable = if flags.is_reusable() {
            Self::find_reusable(&inner, domain, rounded, &flags)
        } else {
            None
        };

        let block_id = match reusable {
            Some(pos) => {
                let id = inner.free_list.remove(pos);
                let block = inner.block_mut(id)?;
                if let BlockMemory::Pool(region) = &block.memory {
                    region.clear(size);
                }
                let block_size = block.size;
                inner.cached_bytes -= block_size;
                ShmemStats::bump(&self.stats.blocks_reused);
                log::trace!("Reusing block {} ({} bytes) for {}", id, block_size, domain);
                id
            }
            None => self.create_block(&mut inner, rounded, domain, flags, platform)?,
        };

        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.outstanding.insert(handle, block_id);

        let block = inner.block_mut(block_id)?;
        block.owner = Some(handle);
        block.allocation(handle, size)
    }

    fn find_reusable(
        inner: &PoolInner,
        domain: DomainId,
        rounded: usize,
        flags: &AllocFlags,
    ) -> Option<usize> {
        inner
            .free_list
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| inner.blocks.get(id).map(|b| (pos, b)))
            .filter(|(_, b)| {
                b.home == domain
                    && b.flags == *flags
                    && b.size >= rounded
                    && b.size <= rounded * 2
                    && b.live_mapping(domain).is_some()
            })
            .min_by_key(|(_, b)| b.size)
            .map(|(pos, _)| pos)
    }

    fn create_block(
        &self,
        inner: &mut PoolInner,
        rounded: usize,
        domain: DomainId,
        flags: AllocFlags,
        platform: Option<&PlatformInfo>,
    ) -> Result<BlockId> {
        while inner.pool_bytes + rounded > self.config.max_pool_bytes && !inner.free_list.is_empty()
        {
            let victim = inner.free_list.remove(0);
            if let Some(block) = inner.blocks.get(&victim) {
                inner.cached_bytes -= block.size;
            }
            self.release_block(inner, victim);
        }
        if inner.pool_bytes + rounded > self.config.max_pool_bytes {
            return Err(GslError::resource(format!(
                "pool exhausted: {} of {} bytes in use",
                inner.pool_bytes, self.config.max_pool_bytes
            )));
        }

        let id = inner.next_block;
        inner.next_block += 1;

        let region = HostRegion::new(
            &format!("gsl_shmem_{}", id),
            rounded,
            self.config.backing_type,
            self.config.file_dir.as_deref(),
        )?;
        let mut block = Block {
            memory: BlockMemory::Pool(Arc::new(region)),
            size: rounded,
            home: domain,
            flags,
            platform: platform.cloned(),
            mappings: BTreeMap::new(),
            owner: None,
            vm_owners: vec![VmId::HLOS],
        };

        let mapping = self.mapper.map(domain, &block.desc(), &flags, platform)?;
        ShmemStats::bump(&self.stats.remote_maps);
        block.mappings.insert(
            domain,
            MappingEntry {
                mapping,
                stale: false,
            },
        );

        inner.blocks.insert(id, block);
        inner.pool_bytes += rounded;
        ShmemStats::bump(&self.stats.blocks_created);
        log::debug!(
            "Created block {} ({} bytes) on {}, map handle {:#x}",
            id,
            rounded,
            domain,
            mapping.map_handle
        );
        Ok(id)
    }

    /// Unmap a remote mapping unless the domain is down or the mapping stale
    fn unmap_remote(
        &self,
        domains: &HashMap<DomainId, DomainState>,
        domain: DomainId,
        entry: &MappingEntry,
    ) -> Result<()> {
        let down = domains.get(&domain).map_or(false, |s| s.down);
        if entry.stale || down {
            log::debug!(
                "Dropping map handle {:#x} on {} without remote unmap",
                entry.mapping.map_handle,
                domain
            );
            return Ok(());
        }
        ShmemStats::bump(&self.stats.remote_unmaps);
        self.mapper.unmap(domain, &entry.mapping)
    }

    fn release_block(&self, inner: &mut PoolInner, id: BlockId) {
        let Some(block) = inner.blocks.remove(&id) else {
            return;
        };
        for (domain, entry) in &block.mappings {
            if let Err(e) = self.unmap_remote(&inner.domains, *domain, entry) {
                log::warn!("Failed to unmap block {} from {}: {}", id, domain, e);
            }
        }
        if block.kind() == AllocKind::Pool {
            inner.pool_bytes -= block.size;
            ShmemStats::bump(&self.stats.blocks_released);
        }
        Self::forget_idle_pds(inner);
    }

    fn release_free_list(&self, inner: &mut PoolInner) {
        let ids: Vec<BlockId> = inner.free_list.drain(..).collect();
        inner.cached_bytes = 0;
        for id in ids {
            self.release_block(inner, id);
        }
    }

    /// Drop dynamic PDs that no longer hold any mapping or queued request
    fn forget_idle_pds(inner: &mut PoolInner) {
        let blocks = &inner.blocks;
        inner.domains.retain(|domain, state| {
            state.kind == DomainKind::Master
                || state.down
                || state.pending_len() > 0
                || blocks.values().any(|b| b.mappings.contains_key(domain))
        });
    }

    fn restore_hlos_ownership(&self, block: &mut Block) {
        if block.vm_owners == [VmId::HLOS] {
            return;
        }
        let src = std::mem::replace(&mut block.vm_owners, vec![VmId::HLOS]);
        if let Err(e) = self.mapper.hyp_assign(&block.desc(), &[VmId::HLOS], &src) {
            log::error!("Failed to reclaim memory from {:?}: {}", src, e);
        }
    }

    /// Return an allocation to the pool
    ///
    /// Secondary mappings are torn down. Reusable blocks keep their home
    /// mapping and go to the free list while the cache budget allows.
    pub fn free(&self, alloc: Allocation) -> Result<()> {
        if alloc.meta.kind == AllocKind::Extern {
            log::warn!("Extern allocation {} released through free", alloc.handle);
            return self.unmap_extern_mem(alloc);
        }

        let mut inner = self.lock();
        let block_id = inner
            .outstanding
            .remove(&alloc.handle)
            .ok_or(GslError::DoubleFree {
                handle: alloc.handle,
            })?;

        let PoolInner {
            active,
            blocks,
            domains,
            cached_bytes,
            ..
        } = &mut *inner;
        let block = blocks
            .get_mut(&block_id)
            .ok_or_else(|| GslError::platform(format!("pool block {} vanished", block_id)))?;

        let home = block.home;
        let secondary: Vec<DomainId> = block
            .mappings
            .keys()
            .filter(|d| **d != home)
            .copied()
            .collect();
        for domain in secondary {
            if let Some(entry) = block.mappings.remove(&domain) {
                if let Err(e) = self.unmap_remote(domains, domain, &entry) {
                    log::warn!("Failed to unmap handle {} from {}: {}", alloc.handle, domain, e);
                }
            }
        }
        block.owner = None;
        self.restore_hlos_ownership(block);

        let keep = *active
            && block.flags.is_reusable()
            && block.live_mapping(home).is_some()
            && *cached_bytes + block.size <= self.config.max_cached_bytes;
        let block_size = block.size;

        if keep {
            inner.free_list.push(block_id);
            inner.cached_bytes += block_size;
        } else {
            self.release_block(&mut inner, block_id);
        }
        Self::forget_idle_pds(&mut inner);
        Ok(())
    }

    /// Map memory owned by another subsystem with the pool's bookkeeping
    pub fn map_extern_mem(&self, mem: ExternMemory, domain: DomainId) -> Result<Allocation> {
        if mem.len == 0 {
            return Err(GslError::bad_parameter("len", "Extern memory must not be empty"));
        }
        let mut inner = self.lock_active()?;
        Self::check_domain(&inner, domain, DomainKind::Master)?;

        let flags = AllocFlags::default().with_dedicated_page(true);
        let mut block = Block {
            memory: BlockMemory::Extern {
                ptr: mem.ptr,
                fd: mem.fd,
            },
            size: mem.len,
            home: domain,
            flags,
            platform: None,
            mappings: BTreeMap::new(),
            owner: None,
            vm_owners: vec![VmId::HLOS],
        };
        let mapping = self.mapper.map(domain, &block.desc(), &flags, None)?;
        ShmemStats::bump(&self.stats.remote_maps);
        block.mappings.insert(
            domain,
            MappingEntry {
                mapping,
                stale: false,
            },
        );

        let id = inner.next_block;
        inner.next_block += 1;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        block.owner = Some(handle);
        let alloc = block.allocation(handle, mem.len)?;
        inner.blocks.insert(id, block);
        inner.outstanding.insert(handle, id);
        Ok(alloc)
    }

    /// Undo [`map_extern_mem`](Self::map_extern_mem); the memory itself is not released
    pub fn unmap_extern_mem(&self, alloc: Allocation) -> Result<()> {
        if alloc.meta.kind != AllocKind::Extern {
            log::warn!("Pool allocation {} released through unmap_extern_mem", alloc.handle);
            return self.free(alloc);
        }
        let mut inner = self.lock();
        let block_id = inner
            .outstanding
            .remove(&alloc.handle)
            .ok_or(GslError::DoubleFree {
                handle: alloc.handle,
            })?;
        if let Some(block) = inner.blocks.get_mut(&block_id) {
            self.restore_hlos_ownership(block);
        }
        self.release_block(&mut inner, block_id);
        Ok(())
    }

    fn map_into(&self, inner: &mut PoolInner, block_id: BlockId, domain: DomainId) -> Result<RemoteMapping> {
        let block = inner.block_mut(block_id)?;
        if let Some(mapping) = block.live_mapping(domain) {
            return Ok(mapping);
        }
        let mapping = self
            .mapper
            .map(domain, &block.desc(), &block.flags, block.platform.as_ref())?;
        ShmemStats::bump(&self.stats.remote_maps);
        block.mappings.insert(
            domain,
            MappingEntry {
                mapping,
                stale: false,
            },
        );
        Ok(mapping)
    }

    fn unmap_from(&self, inner: &mut PoolInner, block_id: BlockId, domain: DomainId) -> Result<()> {
        let PoolInner { blocks, domains, .. } = &mut *inner;
        let block = blocks
            .get_mut(&block_id)
            .ok_or_else(|| GslError::platform(format!("pool block {} vanished", block_id)))?;
        if domain == block.home {
            return Err(GslError::bad_parameter(
                "domain",
                "The home mapping is released by free",
            ));
        }
        let entry = block.mappings.remove(&domain).ok_or_else(|| {
            GslError::bad_parameter("domain", format!("allocation is not mapped on {}", domain))
        })?;
        self.unmap_remote(domains, domain, &entry)
    }

    /// Map an existing allocation to another master domain
    pub fn map_allocation(&self, alloc: &Allocation, domain: DomainId) -> Result<RemoteMapping> {
        let mut inner = self.lock_active()?;
        let block_id = inner.block_of(alloc.handle)?;
        Self::check_domain(&inner, domain, DomainKind::Master)?;
        self.map_into(&mut inner, block_id, domain)
    }

    /// Map an allocation to `domain` and describe it for an SPF memory-map command
    pub fn map_allocation_to_spf(
        &self,
        alloc: &Allocation,
        domain: DomainId,
    ) -> Result<SharedMemMapRegion> {
        let mem_size_bytes = u32::try_from(alloc.meta.block_size).map_err(|_| {
            GslError::bad_parameter(
                "alloc",
                format!(
                    "{} byte block does not fit a memory-map region",
                    alloc.meta.block_size
                ),
            )
        })?;
        let mapping = self.map_allocation(alloc, domain)?;

        let mut property_flag = 0;
        if alloc.meta.flags.uncached {
            property_flag |= APM_MEMORY_MAP_BIT_MASK_IS_UNCACHED;
        }
        if alloc.meta.flags.loaned {
            property_flag |= APM_MEMORY_MAP_BIT_MASK_IS_MEM_LOANED;
        }
        let (lsw, msw) = crate::apm::wire::split_addr(mapping.remote_addr);
        Ok(SharedMemMapRegion {
            mem_pool_id: APM_MEMORY_MAP_SHMEM8_4K_POOL,
            property_flag,
            shm_addr_lsw: lsw,
            shm_addr_msw: msw,
            mem_size_bytes,
        })
    }

    /// Remove a secondary master-domain mapping
    pub fn unmap_allocation(&self, alloc: &Allocation, domain: DomainId) -> Result<()> {
        let mut inner = self.lock_active()?;
        let block_id = inner.block_of(alloc.handle)?;
        match inner.domains.get(&domain).map(|s| s.kind) {
            Some(DomainKind::Master) => {}
            _ => {
                return Err(GslError::bad_parameter(
                    "domain",
                    format!("{} is not a master domain", domain),
                ))
            }
        }
        self.unmap_from(&mut inner, block_id, domain)
    }

    /// Map an allocation into a dynamically loaded PD
    pub fn map_dynamic_pd(&self, alloc: &Allocation, pd: DomainId) -> Result<RemoteMapping> {
        let mut inner = self.lock_active()?;
        let block_id = inner.block_of(alloc.handle)?;
        inner
            .domains
            .entry(pd)
            .or_insert_with(|| DomainState::new(DomainKind::DynamicPd));
        Self::check_domain(&inner, pd, DomainKind::DynamicPd)?;
        let result = self.map_into(&mut inner, block_id, pd);
        if result.is_err() {
            Self::forget_idle_pds(&mut inner);
        }
        result
    }

    /// Remove a dynamic-PD mapping
    pub fn unmap_dynamic_pd(&self, alloc: &Allocation, pd: DomainId) -> Result<()> {
        let mut inner = self.lock_active()?;
        let block_id = inner.block_of(alloc.handle)?;
        match inner.domains.get(&pd).map(|s| s.kind) {
            Some(DomainKind::DynamicPd) => {}
            _ => {
                return Err(GslError::bad_parameter(
                    "pd",
                    format!("{} is not a dynamic PD", pd),
                ))
            }
        }
        let result = self.unmap_from(&mut inner, block_id, pd);
        Self::forget_idle_pds(&mut inner);
        result
    }

    /// Current live mapping of an allocation on `domain`
    pub fn mapping(&self, alloc: &Allocation, domain: DomainId) -> Option<RemoteMapping> {
        let inner = self.lock();
        let block_id = inner.outstanding.get(&alloc.handle)?;
        inner.blocks.get(block_id)?.live_mapping(domain)
    }

    /// Reload the home mapping of an allocation after SSR recovery
    pub fn refresh(&self, alloc: &mut Allocation) -> Result<()> {
        let inner = self.lock_active()?;
        let block_id = inner.block_of(alloc.handle)?;
        let block = inner
            .blocks
            .get(&block_id)
            .ok_or_else(|| GslError::platform(format!("pool block {} vanished", block_id)))?;
        alloc.mapping = block
            .live_mapping(block.home)
            .ok_or(GslError::DomainDown { domain: block.home })?;
        Ok(())
    }

    /// Mark `domain` as restarting; its remote mappings are gone
    pub fn signal_ssr(&self, domain: DomainId) -> Result<()> {
        let mut inner = self.lock_active()?;
        let state = inner.domains.get_mut(&domain).ok_or_else(|| {
            GslError::bad_parameter("domain", format!("{} is not known to the pool", domain))
        })?;
        if state.down {
            return Ok(());
        }
        state.down = true;

        let mut invalidated = 0;
        for block in inner.blocks.values_mut() {
            if let Some(entry) = block.mappings.get_mut(&domain) {
                entry.stale = true;
                invalidated += 1;
            }
        }
        log::warn!("SSR on {}: {} mappings invalidated", domain, invalidated);
        Ok(())
    }

    /// Lift the restart mark once `domain` has come back
    pub fn clear_ssr(&self, domain: DomainId) -> Result<()> {
        let mut inner = self.lock_active()?;
        let state = inner.domains.get_mut(&domain).ok_or_else(|| {
            GslError::bad_parameter("domain", format!("{} is not known to the pool", domain))
        })?;
        state.down = false;
        log::info!("{} recovered from SSR", domain);
        Ok(())
    }

    /// Re-establish remote mappings on `domain` for memory still held by the host
    ///
    /// Covers outstanding allocations and cached free blocks alike. Returns
    /// the number of mappings restored; on failure the block stays stale and
    /// the first error is reported after every block was tried.
    pub fn remap_pre_alloc(&self, domain: DomainId) -> Result<usize> {
        let mut inner = self.lock_active()?;
        match inner.domains.get(&domain) {
            Some(state) if state.down => return Err(GslError::DomainDown { domain }),
            Some(_) => {}
            None => {
                return Err(GslError::bad_parameter(
                    "domain",
                    format!("{} is not known to the pool", domain),
                ))
            }
        }

        let stale: Vec<BlockId> = inner
            .blocks
            .iter()
            .filter(|(_, b)| b.mappings.get(&domain).map_or(false, |e| e.stale))
            .map(|(id, _)| *id)
            .collect();

        let mut remapped = 0;
        let mut first_error = None;
        for id in stale {
            let block = inner.block_mut(id)?;
            match self
                .mapper
                .map(domain, &block.desc(), &block.flags, block.platform.as_ref())
            {
                Ok(mapping) => {
                    ShmemStats::bump(&self.stats.remote_maps);
                    block.mappings.insert(
                        domain,
                        MappingEntry {
                            mapping,
                            stale: false,
                        },
                    );
                    remapped += 1;
                }
                Err(e) => {
                    log::error!("Failed to remap block {} on {}: {}", id, domain, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        log::info!("Remapped {} allocations on {}", remapped, domain);
        match first_error {
            Some(e) => Err(e),
            None => Ok(remapped),
        }
    }

    /// Queue a memory-map request for a domain in SSR
    ///
    /// Returns the packet back when the domain is up and it can be sent
    /// right away, `None` once it has been queued. A full queue is an
    /// error and drops the packet.
    pub fn cache_pending_memmap_packets(
        &self,
        domain: DomainId,
        packet: Packet,
    ) -> Result<Option<Packet>> {
        let kind = MemMapKind::of(&packet)?;
        let mut inner = self.lock_active()?;
        let state = inner.domains.get_mut(&domain).ok_or_else(|| {
            GslError::bad_parameter("domain", format!("{} is not known to the pool", domain))
        })?;
        if !state.down {
            return Ok(Some(packet));
        }
        if state.pending_len() >= self.config.max_pending_packets {
            return Err(GslError::resource(format!(
                "pending memory-map queue for {} is full",
                domain
            )));
        }
        state.enqueue(kind, packet);
        log::debug!("Queued {:?} request for {} during SSR", kind, domain);
        Ok(None)
    }

    /// Drain the requests queued during SSR once the domain is back
    pub fn check_and_unmap_cache_pending_packets(&self, domain: DomainId) -> Result<PendingDrain> {
        let mut inner = self.lock_active()?;
        let state = inner.domains.get_mut(&domain).ok_or_else(|| {
            GslError::bad_parameter("domain", format!("{} is not known to the pool", domain))
        })?;
        if state.down {
            return Err(GslError::DomainDown { domain });
        }
        let (replay, discarded) = state.drain(self.config.pending_policy);
        if !replay.is_empty() || !discarded.is_empty() {
            log::info!(
                "{}: replaying {} and discarding {} queued memory-map requests",
                domain,
                replay.len(),
                discarded.len()
            );
        }
        Self::forget_idle_pds(&mut inner);
        Ok(PendingDrain { replay, discarded })
    }

    /// Reassign hypervisor ownership of an outstanding allocation
    pub fn hyp_assign(&self, handle: PoolHandle, dest_sys: &[VmId], src_sys: &[VmId]) -> Result<()> {
        if dest_sys.is_empty() {
            return Err(GslError::bad_parameter("dest_sys", "No destination VM"));
        }
        let mut inner = self.lock_active()?;
        let block_id = inner.block_of(handle)?;
        let block = inner.block_mut(block_id)?;

        let mut current = block.vm_owners.clone();
        let mut claimed = src_sys.to_vec();
        current.sort();
        claimed.sort();
        if current != claimed {
            return Err(GslError::bad_parameter(
                "src_sys",
                format!("memory is owned by {:?}, not {:?}", block.vm_owners, src_sys),
            ));
        }

        self.mapper.hyp_assign(&block.desc(), dest_sys, src_sys)?;
        block.vm_owners = dest_sys.to_vec();
        Ok(())
    }

    /// Whether `domain` is known and not in SSR
    pub fn is_domain_up(&self, domain: DomainId) -> bool {
        self.lock().domains.get(&domain).map_or(false, |s| !s.down)
    }

    /// Number of outstanding allocations
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Bytes held mapped in the free list
    pub fn cached_bytes(&self) -> usize {
        self.lock().cached_bytes
    }

    /// Host bytes owned by the pool (in use plus cached)
    pub fn pool_bytes(&self) -> usize {
        self.lock().pool_bytes
    }

    pub fn config(&self) -> &ShmemPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> ShmemStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for ShmemManager {
    fn drop(&mut self) {
        let mut inner = self.lock();
        if !inner.outstanding.is_empty() {
            log::warn!(
                "Shared memory pool dropped with {} allocations outstanding",
                inner.outstanding.len()
            );
        }
        self.release_free_list(&mut inner);
    }
}
