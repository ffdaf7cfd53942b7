use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gsl_host::{
    apm::{ApmCmdHeader, WireFormat},
    dls::{BufferPoolConfig, DlsClient, DlsClientOptions, SimulatedDls},
    domain::DomainId,
    msg::{MessageBuilder, MsgSpec},
    shmem::{AllocFlags, BackingType, ShmemManager, ShmemPoolConfig, SimulatedMapper},
    transport::LoopbackTransport,
};
use std::{sync::Arc, time::Duration};

fn pool_config() -> ShmemPoolConfig {
    ShmemPoolConfig::default().with_backing_type(BackingType::Anonymous)
}

fn benchmark_pool_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("ShmemManager");

    for size in [256, 4096, 64 * 1024].iter() {
        group.bench_with_input(BenchmarkId::new("alloc_free_cached", size), size, |b, &size| {
            let mapper = Arc::new(SimulatedMapper::new());
            let pool = ShmemManager::init(&[DomainId::ADSP], pool_config(), mapper).unwrap();

            b.iter(|| {
                let alloc = pool.alloc(black_box(size), DomainId::ADSP).unwrap();
                pool.free(alloc).unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("alloc_free_dedicated", size), size, |b, &size| {
            let mapper = Arc::new(SimulatedMapper::new());
            let pool = ShmemManager::init(&[DomainId::ADSP], pool_config(), mapper).unwrap();
            let flags = AllocFlags::default().with_dedicated_page(true);

            b.iter(|| {
                let alloc = pool
                    .alloc_ext(black_box(size), DomainId::ADSP, flags, None)
                    .unwrap();
                pool.free(alloc).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_message_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("MessageBuilder");

    for shmem in [false, true].iter() {
        let name = if *shmem { "out_of_band" } else { "in_band" };
        group.bench_function(name, |b| {
            let domains: &[DomainId] = if *shmem { &[DomainId::ADSP] } else { &[] };
            let transport = Arc::new(LoopbackTransport::new(DomainId::APPS, domains).unwrap());
            let mapper = Arc::new(SimulatedMapper::new());
            let builder =
                MessageBuilder::init(&[DomainId::ADSP], transport, mapper, pool_config()).unwrap();
            let spec = MsgSpec {
                opcode: 0x0100_1006,
                src_port: 0x2003,
                dst_port: 1,
                header_size: ApmCmdHeader::SIZE,
                token: 1,
                dest_domain: DomainId::ADSP,
                oob_payload_size: 512,
                force_inband: false,
            };

            b.iter(|| {
                let mut msg = builder.alloc(&spec).unwrap();
                msg.payload_mut().unwrap()[0] = 1;
                msg.write_cmd_header().unwrap();
                msg.free().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_dls_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("DlsClient");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("commit_scan_return", |b| {
        let transport =
            Arc::new(LoopbackTransport::new(DomainId::APPS, &[DomainId::ADSP]).unwrap());
        let mapper = Arc::new(SimulatedMapper::new());
        let dsp = Arc::new(SimulatedDls::new(
            DomainId::ADSP,
            mapper.clone(),
            transport.injector(),
        ));
        transport.attach(DomainId::ADSP, dsp.clone());
        let builder = Arc::new(
            MessageBuilder::init(&[DomainId::ADSP], transport.clone(), mapper, pool_config())
                .unwrap(),
        );
        let client = DlsClient::init(
            builder,
            DlsClientOptions::default(),
            BufferPoolConfig::new(4096, 16),
            None,
        )
        .unwrap();
        let log = [0xA5u8; 512];
        let logs = vec![log.as_slice(); 16];

        b.iter(|| {
            dsp.commit(&logs).unwrap();
            let ready = client.get_ready_buffer_list();
            for index in &ready {
                black_box(client.get_log_buffer(*index).unwrap().log_data().len());
            }
            client.return_used_buffers(&ready).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_pool_alloc,
    benchmark_message_build,
    benchmark_dls_cycle
);
criterion_main!(benches);
