//! Log buffer-pool client session

use std::{
    ops::Deref,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use crate::{
    apm::{
        ApmCmdHeader, DlsBufferConfig, DlsBufferEntry, DlsBufferReturn, DlsLogCode,
        ModuleParamData, ModuleRegisterEvent, WireFormat, WireWriter, APM_CMD_REGISTER_MODULE_EVENTS,
        APM_CMD_SET_CFG, APM_MODULE_INSTANCE_ID, DLS_DATA_CMD_BUFFER_RETURN,
        EVENT_ID_DLS_COMMIT_LOG_BUFFER, PARAM_ID_DLS_BUFFER_CONFIG, PARAM_ID_DLS_DISABLE_LOG_CODES,
        PARAM_ID_DLS_ENABLE_LOG_CODES,
    },
    error::{status, GslError, Result},
    msg::{MessageBuilder, MsgSpec},
    shmem::{AllocFlags, Allocation, AllocationGuard},
    transport::{send_and_wait, PacketHandler, PortRegistration},
};

use super::{
    config::{BufferPoolConfig, DlsClientOptions},
    events::{ClientEvents, DlsStatsSnapshot, ReadyCallback},
    layout::LogBufferRing,
};

#[derive(Debug, Default)]
struct PoolState {
    config: Option<BufferPoolConfig>,
    alloc: Option<Allocation>,
}

impl PoolState {
    fn configured(&self) -> Option<(&BufferPoolConfig, &Allocation)> {
        self.config.as_ref().zip(self.alloc.as_ref())
    }

    fn ring(&self) -> Option<Result<LogBufferRing<'_>>> {
        self.configured()
            .map(|(config, alloc)| LogBufferRing::new(alloc, config))
    }
}

/// A DSP log client bound to one shared buffer pool
///
/// Created with [`init`](Self::init) and torn down with
/// [`deinit`](Self::deinit) or on drop. Commands block the calling thread
/// until the DSP answers; the ready callback runs on the transport's
/// receive context and must stay short.
pub struct DlsClient {
    builder: Arc<MessageBuilder>,
    options: DlsClientOptions,
    events: Arc<ClientEvents>,
    pool: RwLock<PoolState>,
    // Serializes commands that change pool ownership
    ops: Mutex<()>,
    registration: Mutex<Option<PortRegistration>>,
    event_registered: AtomicBool,
    closed: AtomicBool,
}

impl DlsClient {
    /// Register the client port and configure the first buffer pool
    ///
    /// On failure every completed step is undone before returning.
    pub fn init(
        builder: Arc<MessageBuilder>,
        options: DlsClientOptions,
        config: BufferPoolConfig,
        ready: Option<ReadyCallback>,
    ) -> Result<Self> {
        let events = Arc::new(ClientEvents::new(ready));
        let handler: Arc<dyn PacketHandler> = events.clone();
        let registration =
            PortRegistration::new(Arc::clone(builder.transport()), options.src_port, handler)?;

        let client = Self {
            builder,
            options,
            events,
            pool: RwLock::new(PoolState::default()),
            ops: Mutex::new(()),
            registration: Mutex::new(Some(registration)),
            event_registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = client.create_buffer_pool(config) {
            log::error!("DLS client init failed: {}", e);
            // Dropping the client deregisters the port
            return Err(e);
        }

        log::info!(
            "DLS client up on port {:#x}, {} x {} byte buffers",
            client.options.src_port,
            config.buffer_count,
            config.buffer_size
        );
        Ok(client)
    }

    fn read_pool(&self) -> RwLockReadGuard<'_, PoolState> {
        self.pool.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_pool(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.pool.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GslError::not_ready("DLS client is deinitialized"));
        }
        Ok(())
    }

    pub fn options(&self) -> &DlsClientOptions {
        &self.options
    }

    pub fn is_configured(&self) -> bool {
        self.read_pool().configured().is_some()
    }

    /// Current pool geometry, once configured
    pub fn config(&self) -> Option<BufferPoolConfig> {
        self.read_pool().config
    }

    /// Remote address and map handle of the pool
    pub fn pool_location(&self) -> Option<(u64, u32)> {
        self.read_pool()
            .alloc
            .as_ref()
            .map(|a| (a.remote_addr(), a.map_handle()))
    }

    pub fn stats(&self) -> DlsStatsSnapshot {
        self.events.stats.snapshot()
    }

    /// Fail every command still waiting on the DSP after it restarted
    ///
    /// Waiters return [`GslError::Remote`] carrying `AR_ESUBSYSRESET`.
    /// Returns the number of commands woken.
    pub fn signal_ssr(&self) -> usize {
        let woken = self.events.responses.fail_all(status::AR_ESUBSYSRESET);
        if woken > 0 {
            log::warn!(
                "SSR on {}: {} pending DLS commands aborted",
                self.options.domain,
                woken
            );
        }
        woken
    }

    /// Build, send and await one APM command whose payload `fill` writes
    fn send_command<F>(&self, opcode: u32, dst_port: u32, payload_size: usize, fill: F) -> Result<()>
    where
        F: FnOnce(&mut WireWriter<'_>) -> Result<()>,
    {
        let token = self.events.responses.next_token();
        let mut msg = self.builder.alloc(&MsgSpec {
            opcode,
            src_port: self.options.src_port,
            dst_port,
            header_size: ApmCmdHeader::SIZE,
            token,
            dest_domain: self.options.domain,
            oob_payload_size: payload_size,
            force_inband: false,
        })?;
        fill(&mut WireWriter::new(msg.payload_mut()?))?;
        msg.write_cmd_header()?;

        let packet = msg.take_packet()?;
        self.events.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        let result = send_and_wait(
            self.builder.transport().as_ref(),
            &self.events.responses,
            packet,
            self.options.command_timeout,
        );
        if result.is_err() {
            self.events
                .stats
                .command_failures
                .fetch_add(1, Ordering::Relaxed);
        }

        // The payload must stay mapped until the DSP has answered
        let freed = msg.free();
        result.and(freed)
    }

    fn set_param(&self, param_id: u32, param_size: usize, fill: impl FnOnce(&mut WireWriter<'_>) -> Result<()>) -> Result<()> {
        let param = ModuleParamData {
            module_instance_id: self.options.dls_instance_id,
            param_id,
            param_size: param_size as u32,
            error_code: 0,
        };
        self.send_command(
            APM_CMD_SET_CFG,
            APM_MODULE_INSTANCE_ID,
            ModuleParamData::SIZE + param_size,
            |w| {
                param.encode(w)?;
                fill(w)
            },
        )
    }

    fn register_commit_event(&self, enable: bool) -> Result<()> {
        let event = ModuleRegisterEvent {
            module_instance_id: self.options.dls_instance_id,
            event_id: EVENT_ID_DLS_COMMIT_LOG_BUFFER,
            is_register: enable as u32,
            error_code: 0,
            event_config_payload_size: 0,
            reserved: 0,
        };
        self.send_command(
            APM_CMD_REGISTER_MODULE_EVENTS,
            APM_MODULE_INSTANCE_ID,
            ModuleRegisterEvent::SIZE,
            |w| event.encode(w),
        )?;
        self.event_registered.store(enable, Ordering::SeqCst);
        Ok(())
    }

    /// Configure a new buffer pool, replacing any current one
    ///
    /// An invalid `config` is rejected before anything is released, so the
    /// current pool stays in service.
    pub fn create_buffer_pool(&self, config: BufferPoolConfig) -> Result<()> {
        self.check_open()?;
        config.validate()?;
        let _ops = self.lock_ops();

        let previous = {
            let mut pool = self.write_pool();
            pool.config = None;
            pool.alloc.take()
        };
        if let Some(previous) = previous {
            log::debug!("Releasing previous log buffer pool of {} bytes", previous.len());
            if let Err(e) = self.builder.pool().free(previous) {
                log::warn!("Failed to release previous log buffer pool: {}", e);
            }
        }

        self.register_commit_event(true)?;

        let pool_manager = self.builder.pool();
        let alloc = AllocationGuard::new(
            pool_manager,
            pool_manager.alloc_ext(
                config.total_size(),
                self.options.domain,
                AllocFlags::default(),
                None,
            )?,
        );
        LogBufferRing::new(&alloc, &config)?.reset_all();

        let buffer_config = DlsBufferConfig::new(
            alloc.remote_addr(),
            alloc.map_handle(),
            config.buffer_size,
            config.total_size() as u32,
        );
        self.set_param(PARAM_ID_DLS_BUFFER_CONFIG, DlsBufferConfig::SIZE, |w| {
            buffer_config.encode(w)
        })?;

        let mut pool = self.write_pool();
        pool.alloc = Some(alloc.into_inner());
        pool.config = Some(config);
        log::debug!(
            "Log buffer pool configured at {:#x}, {} bytes",
            buffer_config.start_addr(),
            buffer_config.total_buf_size
        );
        Ok(())
    }

    /// Indices of buffers the DSP has filled, ascending
    ///
    /// Empty while no pool is configured.
    pub fn get_ready_buffer_list(&self) -> Vec<u32> {
        let pool = self.read_pool();
        match pool.ring() {
            Some(Ok(ring)) => ring.ready_indices(),
            _ => Vec::new(),
        }
    }

    /// Access buffer `index`; the pool cannot be replaced while it is held
    pub fn get_log_buffer(&self, index: u32) -> Result<LogBuffer<'_>> {
        let pool = self.read_pool();
        let ring = pool
            .ring()
            .ok_or_else(|| GslError::not_ready("log buffer pool not configured"))??;
        let index = index as usize;
        let offset = ring.offset_of(index)?;
        let ptr = ring.payload_ptr(index)?;
        let header = ring.header(index)?;
        let capacity = ring.capacity();
        let remote_addr = pool
            .alloc
            .as_ref()
            .map_or(0, |a| a.remote_addr_at(offset));

        Ok(LogBuffer {
            _pool: pool,
            index: index as u32,
            ptr,
            capacity,
            filled: (header.size as usize).min(capacity),
            remote_addr,
        })
    }

    /// Hand drained buffers back to the DSP
    pub fn return_used_buffers(&self, indices: &[u32]) -> Result<()> {
        self.check_open()?;
        let _ops = self.lock_ops();

        let entries = {
            let pool = self.read_pool();
            let (_, alloc) = pool
                .configured()
                .ok_or_else(|| GslError::not_ready("log buffer pool not configured"))?;
            let ring = pool
                .ring()
                .ok_or_else(|| GslError::not_ready("log buffer pool not configured"))??;

            let entries = indices
                .iter()
                .map(|i| {
                    let offset = ring.offset_of(*i as usize)?;
                    Ok(DlsBufferEntry::new(
                        alloc.remote_addr_at(offset),
                        alloc.map_handle(),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            for i in indices {
                ring.reset(*i as usize)?;
            }
            entries
        };

        // Nothing to hand back, so no command goes to the DSP
        if entries.is_empty() {
            return Ok(());
        }

        let count = entries.len();
        let payload = DlsBufferReturn { entries };
        self.send_command(
            DLS_DATA_CMD_BUFFER_RETURN,
            self.options.dls_instance_id,
            DlsBufferReturn::encoded_size(count),
            |w| payload.encode(w),
        )?;
        self.events
            .stats
            .buffers_returned
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Enable or disable capture of one log code
    pub fn register_log_code(&self, log_code: u32, enabled: bool) -> Result<()> {
        self.check_open()?;
        let param_id = if enabled {
            PARAM_ID_DLS_ENABLE_LOG_CODES
        } else {
            PARAM_ID_DLS_DISABLE_LOG_CODES
        };
        let payload = DlsLogCode::single(log_code);
        let result = self.set_param(param_id, DlsLogCode::SIZE, |w| payload.encode(w));
        match &result {
            Ok(()) => log::debug!(
                "Log code {:#x} {}",
                log_code,
                if enabled { "enabled" } else { "disabled" }
            ),
            Err(e) => log::error!(
                "Failed to {} log code {:#x}: {}",
                if enabled { "enable" } else { "disable" },
                log_code,
                e
            ),
        }
        result
    }

    /// Tear the session down; later calls are no-ops
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub fn deinit(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ops = self.lock_ops();
        let mut first_error = None;

        if self.event_registered.load(Ordering::SeqCst) {
            if let Err(e) = self.register_commit_event(false) {
                log::warn!("Failed to deregister commit event: {}", e);
                first_error.get_or_insert(e);
            }
        }

        // Deregister before freeing so no event can refer to a dead pool
        drop(
            self.registration
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );

        let alloc = {
            let mut pool = self.write_pool();
            pool.config = None;
            pool.alloc.take()
        };
        if let Some(alloc) = alloc {
            if let Err(e) = self.builder.pool().free(alloc) {
                log::warn!("Failed to release log buffer pool: {}", e);
                first_error.get_or_insert(e);
            }
        }

        log::debug!("DLS client on port {:#x} closed", self.options.src_port);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for DlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlsClient")
            .field("options", &self.options)
            .field("config", &self.config())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for DlsClient {
    fn drop(&mut self) {
        if let Err(e) = self.deinit() {
            log::warn!("DLS client teardown incomplete: {}", e);
        }
    }
}

/// One log buffer, borrowed from a configured pool
pub struct LogBuffer<'a> {
    _pool: RwLockReadGuard<'a, PoolState>,
    index: u32,
    ptr: NonNull<u8>,
    capacity: usize,
    filled: usize,
    remote_addr: u64,
}

impl LogBuffer<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// First byte after the buffer header
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Usable bytes: buffer size minus header
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes the DSP reported as written
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// DSP-visible address of the buffer start
    pub fn remote_addr(&self) -> u64 {
        self.remote_addr
    }

    /// The written part of the buffer
    pub fn log_data(&self) -> &[u8] {
        &self[..self.filled]
    }
}

impl Deref for LogBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }
}

impl std::fmt::Debug for LogBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .field("filled", &self.filled)
            .finish()
    }
}
