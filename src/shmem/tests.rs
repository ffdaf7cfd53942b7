//! Tests for the pool manager internals

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        apm::{APM_CMD_SHARED_MEM_MAP_REGIONS, APM_CMD_SHARED_MEM_UNMAP_REGIONS},
        domain::DomainId,
        error::GslError,
        shmem::*,
        transport::{Packet, PacketHeader},
    };

    fn pool(mapper: &Arc<SimulatedMapper>) -> ShmemManager {
        let config = ShmemPoolConfig::default().with_backing_type(BackingType::Anonymous);
        ShmemManager::init(&[DomainId::ADSP, DomainId::MODEM], config, mapper.clone()).unwrap()
    }

    fn memmap_packet(opcode: u32) -> Packet {
        Packet::new(
            PacketHeader {
                opcode,
                token: 7,
                src_domain: DomainId::APPS,
                dst_domain: DomainId::ADSP,
                src_port: 0x2001,
                dst_port: 1,
            },
            16,
        )
    }

    #[test]
    fn test_alloc_rounds_to_frame() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let alloc = pool.alloc(100, DomainId::ADSP).unwrap();
        assert_eq!(alloc.len(), 100);
        assert_eq!(alloc.metadata().block_size, 4096);
        assert_eq!(alloc.metadata().kind, AllocKind::Pool);
        assert_ne!(alloc.map_handle(), 0);
        assert_eq!(pool.pool_bytes(), 4096);

        pool.free(alloc).unwrap();
    }

    #[test]
    fn test_reuse_keeps_home_mapping() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let first = pool.alloc(5000, DomainId::ADSP).unwrap();
        let handle = first.map_handle();
        pool.free(first).unwrap();
        assert_eq!(pool.cached_bytes(), 8192);
        assert_eq!(mapper.unmap_calls(), 0);

        let second = pool.alloc(6000, DomainId::ADSP).unwrap();
        assert_eq!(second.map_handle(), handle);
        assert!(second.as_slice().iter().all(|b| *b == 0));
        assert_eq!(mapper.map_calls(), 1);
        assert_eq!(pool.stats().blocks_reused, 1);

        pool.free(second).unwrap();
    }

    #[test]
    fn test_reuse_respects_domain_and_fit() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let small = pool.alloc(4096, DomainId::ADSP).unwrap();
        pool.free(small).unwrap();

        // Different domain, then too large for the cached block
        let modem = pool.alloc(4096, DomainId::MODEM).unwrap();
        let big = pool.alloc(16384, DomainId::ADSP).unwrap();
        assert_eq!(pool.stats().blocks_reused, 0);
        assert_eq!(pool.stats().blocks_created, 3);

        pool.free(modem).unwrap();
        pool.free(big).unwrap();
    }

    #[test]
    fn test_reused_block_is_zeroed() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let mut alloc = pool.alloc(64, DomainId::ADSP).unwrap();
        alloc.as_mut_slice().fill(0xAB);
        pool.free(alloc).unwrap();

        let alloc = pool.alloc(64, DomainId::ADSP).unwrap();
        assert!(alloc.as_slice().iter().all(|b| *b == 0));
        pool.free(alloc).unwrap();
    }

    #[test]
    fn test_dedicated_blocks_are_released() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let alloc = pool
            .alloc_ext(4096, DomainId::ADSP, AllocFlags::loaned(), None)
            .unwrap();
        pool.free(alloc).unwrap();

        assert_eq!(pool.cached_bytes(), 0);
        assert_eq!(pool.pool_bytes(), 0);
        assert_eq!(mapper.live_mappings(DomainId::ADSP), 0);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let flags = AllocFlags {
            loaned: true,
            ..Default::default()
        };
        let err = pool.alloc_ext(4096, DomainId::ADSP, flags, None).unwrap_err();
        assert!(matches!(err, GslError::BadParameter { .. }));
        assert_eq!(pool.stats().failures, 1);
    }

    #[test]
    fn test_unknown_domain_and_zero_size() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        assert!(matches!(
            pool.alloc(64, DomainId::CDSP),
            Err(GslError::Resource { .. })
        ));
        assert!(matches!(
            pool.alloc(0, DomainId::ADSP),
            Err(GslError::BadParameter { .. })
        ));
    }

    #[test]
    fn test_oversized_request_fails_without_panic() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let err = pool.alloc(usize::MAX - 10, DomainId::ADSP).unwrap_err();
        assert!(matches!(err, GslError::Resource { .. }));
        assert_eq!(err.status(), crate::error::status::AR_ENOMEMORY);
        assert_eq!(pool.stats().failures, 1);

        // The pool is still usable afterwards
        let alloc = pool.alloc(100, DomainId::ADSP).unwrap();
        pool.free(alloc).unwrap();
    }

    #[test]
    fn test_cache_budget_releases_excess() {
        let mapper = Arc::new(SimulatedMapper::new());
        let config = ShmemPoolConfig::default()
            .with_backing_type(BackingType::Anonymous)
            .with_max_cached_bytes(4096);
        let pool = ShmemManager::init(&[DomainId::ADSP], config, mapper.clone()).unwrap();

        let a = pool.alloc(4096, DomainId::ADSP).unwrap();
        let b = pool.alloc(4096, DomainId::ADSP).unwrap();
        pool.free(a).unwrap();
        pool.free(b).unwrap();

        assert_eq!(pool.cached_bytes(), 4096);
        assert_eq!(pool.pool_bytes(), 4096);
        assert_eq!(mapper.unmap_calls(), 1);
    }

    #[test]
    fn test_pool_budget_evicts_then_fails() {
        let mapper = Arc::new(SimulatedMapper::new());
        let config = ShmemPoolConfig::default()
            .with_backing_type(BackingType::Anonymous)
            .with_max_cached_bytes(8192)
            .with_max_pool_bytes(8192);
        let pool = ShmemManager::init(&[DomainId::ADSP], config, mapper.clone()).unwrap();

        let small = pool.alloc(4096, DomainId::ADSP).unwrap();
        pool.free(small).unwrap();

        // The cached 4 KiB block is evicted to make room
        let big = pool.alloc(8192, DomainId::ADSP).unwrap();
        assert_eq!(pool.cached_bytes(), 0);
        assert_eq!(pool.stats().blocks_released, 1);

        assert!(matches!(
            pool.alloc(4096, DomainId::ADSP),
            Err(GslError::Resource { .. })
        ));
        pool.free(big).unwrap();
    }

    #[test]
    fn test_map_failure_leaves_no_block() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        mapper.fail_next_map();
        assert!(pool.alloc(4096, DomainId::ADSP).is_err());
        assert_eq!(pool.pool_bytes(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_secondary_mapping_lifecycle() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let alloc = pool.alloc(4096, DomainId::ADSP).unwrap();
        let first = pool.map_allocation(&alloc, DomainId::MODEM).unwrap();
        let again = pool.map_allocation(&alloc, DomainId::MODEM).unwrap();
        assert_eq!(first, again);
        assert_eq!(mapper.live_mappings(DomainId::MODEM), 1);

        assert!(pool.unmap_allocation(&alloc, DomainId::ADSP).is_err());
        pool.unmap_allocation(&alloc, DomainId::MODEM).unwrap();
        assert!(pool.mapping(&alloc, DomainId::MODEM).is_none());

        pool.map_allocation(&alloc, DomainId::MODEM).unwrap();
        pool.free(alloc).unwrap();
        // Secondary mappings never survive a free
        assert_eq!(mapper.live_mappings(DomainId::MODEM), 0);
        assert_eq!(mapper.live_mappings(DomainId::ADSP), 1);
    }

    #[test]
    fn test_map_to_spf_descriptor() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let flags = AllocFlags::default().with_uncached(true);
        let alloc = pool.alloc_ext(100, DomainId::ADSP, flags, None).unwrap();
        let region = pool.map_allocation_to_spf(&alloc, DomainId::ADSP).unwrap();

        assert_eq!(region.addr(), alloc.remote_addr());
        assert_eq!(region.mem_size_bytes, 4096);
        assert_ne!(region.property_flag & crate::apm::APM_MEMORY_MAP_BIT_MASK_IS_UNCACHED, 0);
        assert_eq!(mapper.is_uncached(alloc.map_handle()), Some(true));
        pool.free(alloc).unwrap();
    }

    #[test]
    fn test_map_to_spf_rejects_blocks_over_u32() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let mut alloc = pool.alloc(100, DomainId::ADSP).unwrap();
        let real_size = alloc.meta.block_size;
        alloc.meta.block_size = u32::MAX as usize + 1;

        let err = pool.map_allocation_to_spf(&alloc, DomainId::MODEM).unwrap_err();
        assert!(matches!(err, GslError::BadParameter { .. }));
        assert!(pool.mapping(&alloc, DomainId::MODEM).is_none());

        alloc.meta.block_size = real_size;
        pool.free(alloc).unwrap();
    }

    #[test]
    fn test_dynamic_pd_is_forgotten_with_last_mapping() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);
        let pd = DomainId(9);

        let alloc = pool.alloc(4096, DomainId::ADSP).unwrap();
        assert!(pool.map_dynamic_pd(&alloc, DomainId::MODEM).is_err());

        pool.map_dynamic_pd(&alloc, pd).unwrap();
        assert!(pool.is_domain_up(pd));
        assert!(pool.map_allocation(&alloc, pd).is_err());

        pool.unmap_dynamic_pd(&alloc, pd).unwrap();
        assert!(!pool.is_domain_up(pd));
        pool.free(alloc).unwrap();
    }

    #[test]
    fn test_ssr_marks_stale_and_remaps() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let mut held = pool.alloc(4096, DomainId::ADSP).unwrap();
        let cached = pool.alloc(4096, DomainId::ADSP).unwrap();
        pool.free(cached).unwrap();

        pool.signal_ssr(DomainId::ADSP).unwrap();
        mapper.forget_domain(DomainId::ADSP);
        assert!(matches!(
            pool.alloc(64, DomainId::ADSP),
            Err(GslError::DomainDown { .. })
        ));
        assert!(pool.refresh(&mut held).is_err());
        // Other domains keep working
        let modem = pool.alloc(64, DomainId::MODEM).unwrap();

        assert!(pool.remap_pre_alloc(DomainId::ADSP).is_err());
        pool.clear_ssr(DomainId::ADSP).unwrap();
        assert_eq!(pool.remap_pre_alloc(DomainId::ADSP).unwrap(), 2);
        assert_eq!(mapper.live_mappings(DomainId::ADSP), 2);

        pool.refresh(&mut held).unwrap();
        assert_eq!(pool.mapping(&held, DomainId::ADSP).unwrap().map_handle, held.map_handle());

        pool.free(held).unwrap();
        pool.free(modem).unwrap();
    }

    #[test]
    fn test_free_during_ssr_skips_remote_unmap() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let alloc = pool.alloc(4096, DomainId::ADSP).unwrap();
        pool.map_allocation(&alloc, DomainId::MODEM).unwrap();
        pool.signal_ssr(DomainId::MODEM).unwrap();

        pool.free(alloc).unwrap();
        assert_eq!(mapper.unmap_calls(), 0);
    }

    #[test]
    fn test_pending_memmap_queue() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let sent = pool
            .cache_pending_memmap_packets(DomainId::ADSP, memmap_packet(APM_CMD_SHARED_MEM_MAP_REGIONS))
            .unwrap();
        assert!(sent.is_some());

        pool.signal_ssr(DomainId::ADSP).unwrap();
        for opcode in [APM_CMD_SHARED_MEM_MAP_REGIONS, APM_CMD_SHARED_MEM_UNMAP_REGIONS] {
            let queued = pool
                .cache_pending_memmap_packets(DomainId::ADSP, memmap_packet(opcode))
                .unwrap();
            assert!(queued.is_none());
        }
        assert!(pool
            .cache_pending_memmap_packets(DomainId::ADSP, memmap_packet(0x0100_1006))
            .is_err());
        assert!(pool.check_and_unmap_cache_pending_packets(DomainId::ADSP).is_err());

        pool.clear_ssr(DomainId::ADSP).unwrap();
        let drained = pool.check_and_unmap_cache_pending_packets(DomainId::ADSP).unwrap();
        assert_eq!(drained.replay.len(), 1);
        assert_eq!(drained.replay[0].opcode(), APM_CMD_SHARED_MEM_MAP_REGIONS);
        assert_eq!(drained.discarded.len(), 1);
    }

    #[test]
    fn test_hyp_assign_tracks_owners() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let alloc = pool.alloc(4096, DomainId::ADSP).unwrap();
        let host = alloc.as_ptr() as usize;

        assert!(pool
            .hyp_assign(alloc.handle(), &[VmId::LPASS], &[VmId::LPASS])
            .is_err());
        pool.hyp_assign(alloc.handle(), &[VmId::LPASS, VmId::ADSP_HEAP], &[VmId::HLOS])
            .unwrap();
        assert_eq!(mapper.owners(host).unwrap(), vec![VmId::LPASS, VmId::ADSP_HEAP]);

        pool.free(alloc).unwrap();
        assert_eq!(mapper.owners(host).unwrap(), vec![VmId::HLOS]);
    }

    #[test]
    fn test_extern_memory() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);
        let mut backing = vec![0u8; 2048];

        let ptr = std::ptr::NonNull::new(backing.as_mut_ptr()).unwrap();
        let mem = unsafe { ExternMemory::new(ptr, backing.len(), None) };
        let alloc = pool.map_extern_mem(mem, DomainId::ADSP).unwrap();
        assert_eq!(alloc.metadata().kind, AllocKind::Extern);
        assert_eq!(alloc.len(), 2048);
        assert_eq!(pool.pool_bytes(), 0);

        pool.unmap_extern_mem(alloc).unwrap();
        assert_eq!(mapper.live_mappings(DomainId::ADSP), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_deinit_refuses_while_outstanding() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        let alloc = pool.alloc(4096, DomainId::ADSP).unwrap();
        assert!(matches!(pool.deinit(), Err(GslError::Busy { .. })));

        pool.free(alloc).unwrap();
        pool.deinit().unwrap();
        pool.deinit().unwrap();
        assert_eq!(mapper.live_mappings(DomainId::ADSP), 0);
        assert!(matches!(
            pool.alloc(64, DomainId::ADSP),
            Err(GslError::NotReady { .. })
        ));
    }

    #[test]
    fn test_allocation_guard_frees_on_drop() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = pool(&mapper);

        {
            let mut guard = AllocationGuard::new(&pool, pool.alloc(64, DomainId::ADSP).unwrap());
            guard.as_mut_slice()[0] = 1;
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);

        let guard = AllocationGuard::new(&pool, pool.alloc(64, DomainId::ADSP).unwrap());
        let kept = guard.into_inner();
        assert_eq!(pool.outstanding(), 1);
        pool.free(kept).unwrap();
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = Arc::new(pool(&mapper));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let alloc = pool.alloc(1 + i * 37, DomainId::ADSP).unwrap();
                        pool.free(alloc).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.stats().alloc_requests, 200);
    }
}
