use clap::{App, Arg, ArgMatches, SubCommand};
use gsl_host::{
    dls::SimulatedDls,
    error::GslError,
    shmem::SimulatedMapper,
    transport::LoopbackTransport,
    BufferPoolConfig, DlsClient, DlsClientOptions, DomainId, MessageBuilder, Result,
    ShmemPoolConfig,
};
use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    time::Duration,
};

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("gsl-dls")
        .version(env!("CARGO_PKG_VERSION"))
        .about("DSP log buffer pool tool")
        .subcommand(
            SubCommand::with_name("validate")
                .about("Check a buffer pool configuration against the DSP limits")
                .arg(buffer_size_arg())
                .arg(buffer_count_arg()),
        )
        .subcommand(
            SubCommand::with_name("simulate")
                .about("Run a capture session against a simulated DSP")
                .arg(buffer_size_arg())
                .arg(buffer_count_arg())
                .arg(
                    Arg::with_name("logs")
                        .short("l")
                        .long("logs")
                        .value_name("LOGS")
                        .help("Number of log packets the DSP commits")
                        .default_value("16")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("log_code")
                        .long("log-code")
                        .value_name("CODE")
                        .help("Log code to enable for the session")
                        .default_value("0x1586")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("inband")
                        .long("inband")
                        .help("Pretend the DSP has no shared-memory support for commands"),
                ),
        )
        .subcommand(SubCommand::with_name("info").about("Show version and limits"))
        .get_matches();

    match matches.subcommand() {
        ("validate", Some(m)) => validate(m),
        ("simulate", Some(m)) => simulate(m),
        ("info", Some(_)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn buffer_size_arg() -> Arg<'static, 'static> {
    Arg::with_name("buffer_size")
        .short("b")
        .long("buffer-size")
        .value_name("SIZE")
        .help("Bytes per log buffer (power of two)")
        .default_value("4096")
        .takes_value(true)
}

fn buffer_count_arg() -> Arg<'static, 'static> {
    Arg::with_name("buffer_count")
        .short("c")
        .long("buffer-count")
        .value_name("COUNT")
        .help("Number of log buffers")
        .default_value("16")
        .takes_value(true)
}

fn parse_u32(matches: &ArgMatches, name: &str) -> Result<u32> {
    let raw = matches
        .value_of(name)
        .ok_or_else(|| GslError::bad_parameter(name, "missing value"))?;
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| GslError::bad_parameter(name, format!("'{}' is not a number", raw)))
}

fn pool_config(matches: &ArgMatches) -> Result<BufferPoolConfig> {
    Ok(BufferPoolConfig::new(
        parse_u32(matches, "buffer_size")?,
        parse_u32(matches, "buffer_count")?,
    ))
}

fn validate(matches: &ArgMatches) -> Result<()> {
    let config = pool_config(matches)?;
    config.validate()?;
    println!(
        "OK: {} buffers of {} bytes, {} bytes of shared memory, {} bytes of log data per buffer",
        config.buffer_count,
        config.buffer_size,
        config.total_size(),
        config.payload_capacity()
    );
    Ok(())
}

fn simulate(matches: &ArgMatches) -> Result<()> {
    let config = pool_config(matches)?;
    let logs = parse_u32(matches, "logs")?;
    let log_code = parse_u32(matches, "log_code")?;
    let shmem_domains: &[DomainId] = if matches.is_present("inband") {
        &[]
    } else {
        &[DomainId::ADSP]
    };

    let mapper = Arc::new(SimulatedMapper::new());
    let transport = Arc::new(LoopbackTransport::new(DomainId::APPS, shmem_domains)?);
    let dsp = Arc::new(SimulatedDls::new(
        DomainId::ADSP,
        mapper.clone(),
        transport.injector(),
    ));
    transport.attach(DomainId::ADSP, dsp.clone());

    let builder = Arc::new(MessageBuilder::init(
        &[DomainId::ADSP],
        transport.clone(),
        mapper.clone(),
        ShmemPoolConfig::default(),
    )?);

    let (ready_tx, ready_rx) = mpsc::sync_channel(64);
    let client = DlsClient::init(
        builder.clone(),
        DlsClientOptions::default().with_timeout(Some(Duration::from_secs(5))),
        config,
        Some(Box::new(move || {
            let _ = ready_tx.try_send(());
        })),
    )?;
    client.register_log_code(log_code, true)?;

    let (remote_base, map_handle) = client
        .pool_location()
        .ok_or_else(|| GslError::not_ready("pool not configured"))?;
    println!(
        "Pool configured: {} x {} bytes at remote {:#x} (map handle {})",
        config.buffer_count, config.buffer_size, remote_base, map_handle
    );

    let mut drained = 0u32;
    let mut bytes = 0usize;
    let mut remaining = logs;
    while remaining > 0 {
        let batch: Vec<Vec<u8>> = (0..remaining.min(config.buffer_count))
            .map(|i| format!("log {:#x} #{}", log_code, logs - remaining + i).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = batch.iter().map(Vec::as_slice).collect();
        let filled = dsp.commit(&refs)?;
        remaining -= filled.len() as u32;

        wait_ready(&ready_rx)?;
        let ready = client.get_ready_buffer_list();
        for index in &ready {
            let buffer = client.get_log_buffer(*index)?;
            log::debug!(
                "buffer {}: {}",
                index,
                String::from_utf8_lossy(buffer.log_data())
            );
            bytes += buffer.filled();
        }
        client.return_used_buffers(&ready)?;
        drained += ready.len() as u32;
    }

    client.register_log_code(log_code, false)?;
    let stats = client.stats();
    client.deinit()?;

    println!("Drained {} buffers, {} bytes of log data", drained, bytes);
    println!(
        "  Commands: {} sent, {} failed; commit events: {}",
        stats.commands_sent, stats.command_failures, stats.commit_events
    );
    let pool_stats = builder.pool().stats();
    println!(
        "  Shared memory: {} blocks created, reuse rate {:.1}%",
        pool_stats.blocks_created,
        pool_stats.reuse_rate() * 100.0
    );
    Ok(())
}

fn wait_ready(ready: &Receiver<()>) -> Result<()> {
    ready
        .recv_timeout(Duration::from_secs(5))
        .map_err(|_| GslError::Timeout { token: 0 })
}

fn show_info() -> Result<()> {
    use gsl_host::config::*;

    println!("gsl-dls {}", gsl_host::VERSION);
    println!("  Buffer size: {}..={} bytes, power of two", DLS_MIN_BUFFER_SIZE, DLS_MAX_BUFFER_SIZE);
    println!("  Buffer count: {}..={}", DLS_MIN_BUFFER_COUNT, DLS_MAX_BUFFER_COUNT);
    println!("  Buffer header: {} bytes", DLS_LOG_BUFFER_HEADER_SIZE);
    println!("  Client port: {:#x}", DLS_CLIENT_PORT);
    Ok(())
}
