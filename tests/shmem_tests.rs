//! Pool manager behaviour across backings, threads and remote restarts

use std::{
    sync::{Arc, Barrier},
    thread,
};

use gsl_host::{
    domain::DomainId,
    error::GslError,
    shmem::{
        AllocFlags, BackingType, PendingPolicy, ShmemManager, ShmemPoolConfig, SimulatedMapper,
    },
};
use tempfile::TempDir;

#[cfg(test)]
mod shmem_tests {
    use super::*;

    fn manager(config: ShmemPoolConfig) -> (Arc<SimulatedMapper>, ShmemManager) {
        let mapper = Arc::new(SimulatedMapper::new());
        let pool = ShmemManager::init(&[DomainId::ADSP, DomainId::MODEM], config, mapper.clone())
            .unwrap();
        (mapper, pool)
    }

    #[test]
    fn test_file_backed_pool_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config = ShmemPoolConfig::default()
            .with_backing_type(BackingType::FileBacked)
            .with_file_dir(temp_dir.path());
        let (mapper, pool) = manager(config);

        let mut alloc = pool.alloc(3000, DomainId::ADSP).unwrap();
        alloc.as_mut_slice()[..5].copy_from_slice(b"hello");

        let host = mapper.resolve(DomainId::ADSP, alloc.remote_addr()).unwrap();
        assert_eq!(host, alloc.as_ptr() as usize);
        assert_eq!(&alloc.as_slice()[..5], b"hello");

        pool.free(alloc).unwrap();
        assert_eq!(pool.outstanding(), 0);
        pool.deinit().unwrap();
    }

    #[test]
    fn test_file_backing_requires_directory() {
        let config = ShmemPoolConfig::default().with_backing_type(BackingType::FileBacked);
        let mapper = Arc::new(SimulatedMapper::new());
        let result = ShmemManager::init(&[DomainId::ADSP], config, mapper);
        assert!(matches!(result, Err(GslError::BadParameter { .. })));
    }

    #[test]
    fn test_uncached_blocks_are_not_shared_with_cached() {
        let config = ShmemPoolConfig::default().with_backing_type(BackingType::Anonymous);
        let (mapper, pool) = manager(config);

        let cached = pool.alloc(4096, DomainId::ADSP).unwrap();
        let cached_block = cached.metadata().block_size;
        pool.free(cached).unwrap();

        let uncached = pool
            .alloc_ext(4096, DomainId::ADSP, AllocFlags::default().with_uncached(true), None)
            .unwrap();
        assert_eq!(uncached.metadata().block_size, cached_block);
        assert_eq!(mapper.is_uncached(uncached.map_handle()), Some(true));

        let stats = pool.stats();
        assert_eq!(stats.blocks_created, 2);
        assert_eq!(stats.blocks_reused, 0);
        pool.free(uncached).unwrap();
    }

    #[test]
    fn test_remote_restart_recovery() {
        let config = ShmemPoolConfig::default()
            .with_backing_type(BackingType::Anonymous)
            .with_pending_policy(PendingPolicy::Replay);
        let (mapper, pool) = manager(config);

        let live = pool.alloc(4096, DomainId::ADSP).unwrap();
        let cached = pool.alloc(8192, DomainId::ADSP).unwrap();
        pool.free(cached).unwrap();
        let modem = pool.alloc(4096, DomainId::MODEM).unwrap();

        pool.signal_ssr(DomainId::ADSP).unwrap();
        mapper.forget_domain(DomainId::ADSP);
        assert!(!pool.is_domain_up(DomainId::ADSP));
        assert!(pool.is_domain_up(DomainId::MODEM));
        assert!(matches!(
            pool.alloc(4096, DomainId::ADSP),
            Err(GslError::DomainDown { .. })
        ));
        // Other domains keep working
        pool.free(modem).unwrap();

        pool.clear_ssr(DomainId::ADSP).unwrap();
        assert_eq!(pool.remap_pre_alloc(DomainId::ADSP).unwrap(), 2);
        assert_eq!(mapper.live_mappings(DomainId::ADSP), 2);

        let mut live = live;
        pool.refresh(&mut live).unwrap();
        assert_eq!(
            mapper.resolve(DomainId::ADSP, live.remote_addr()),
            Some(live.as_ptr() as usize)
        );
        pool.free(live).unwrap();

        // The cached block went through the remap too and is reusable
        let again = pool.alloc(8192, DomainId::ADSP).unwrap();
        assert_eq!(pool.stats().blocks_reused, 1);
        pool.free(again).unwrap();
    }

    #[test]
    fn test_concurrent_domains() {
        let config = ShmemPoolConfig::default().with_backing_type(BackingType::Anonymous);
        let (mapper, pool) = manager(config);
        let pool = Arc::new(pool);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                let domain = if i % 2 == 0 {
                    DomainId::ADSP
                } else {
                    DomainId::MODEM
                };
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..50 {
                        let mut alloc = pool.alloc(1024 * (1 + round % 3), domain).unwrap();
                        alloc.as_mut_slice()[0] = i as u8;
                        assert_eq!(alloc.as_slice()[0], i as u8);
                        pool.free(alloc).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.outstanding(), 0);
        let stats = pool.stats();
        assert_eq!(stats.alloc_requests, 200);
        assert!(stats.blocks_reused > 0);
        assert!(pool.cached_bytes() <= pool.config().max_cached_bytes);

        pool.deinit().unwrap();
        assert_eq!(mapper.live_mappings(DomainId::ADSP), 0);
        assert_eq!(mapper.live_mappings(DomainId::MODEM), 0);
    }
}
