//! In-process DSP-side log service for the loopback router
//!
//! Consumes the same commands the real DLS module does, tracks which
//! buffers the DSP currently owns, and fills them on demand through
//! [`SimulatedMapper::resolve`] so the host sees the data in its own
//! mapping.

use std::{
    collections::BTreeSet,
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    apm::{
        ApmCmdHeader, BasicRsp, DlsBufferConfig, DlsBufferReturn, DlsLogCode, ModuleEvent,
        ModuleParamData, ModuleRegisterEvent, WireFormat, WireReader, WireWriter,
        APM_CMD_REGISTER_MODULE_EVENTS, APM_CMD_SET_CFG, APM_EVENT_MODULE_TO_CLIENT,
        DLS_DATA_CMD_BUFFER_RETURN, DLS_MODULE_INSTANCE_ID, EVENT_ID_DLS_COMMIT_LOG_BUFFER,
        GPR_IBASIC_RSP_RESULT, PARAM_ID_DLS_BUFFER_CONFIG, PARAM_ID_DLS_DISABLE_LOG_CODES,
        PARAM_ID_DLS_ENABLE_LOG_CODES,
    },
    domain::DomainId,
    error::{status, GslError, Result},
    shmem::SimulatedMapper,
    transport::{Injector, Packet, PacketHeader, RemoteEndpoint},
};

use super::layout::LogBufferRing;

#[derive(Debug, Default)]
struct SimState {
    client: Option<(DomainId, u32)>,
    event_registered: bool,
    pool: Option<DlsBufferConfig>,
    dsp_owned: BTreeSet<u32>,
    enabled_codes: BTreeSet<u32>,
    received: Vec<u32>,
    returned: Vec<Vec<u64>>,
    fail_next: Option<(u32, u32)>,
}

/// Simulated DLS module answering on one domain
#[derive(Debug)]
pub struct SimulatedDls {
    domain: DomainId,
    mapper: Arc<SimulatedMapper>,
    injector: Injector,
    state: Mutex<SimState>,
}

impl SimulatedDls {
    pub fn new(domain: DomainId, mapper: Arc<SimulatedMapper>, injector: Injector) -> Self {
        Self {
            domain,
            mapper,
            injector,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer the next command with `opcode` with `status`
    pub fn fail_next(&self, opcode: u32, status: u32) {
        self.state().fail_next = Some((opcode, status));
    }

    /// Opcodes received so far, in order
    pub fn received(&self) -> Vec<u32> {
        self.state().received.clone()
    }

    /// Last buffer configuration accepted
    pub fn pool_config(&self) -> Option<DlsBufferConfig> {
        self.state().pool
    }

    pub fn event_registered(&self) -> bool {
        self.state().event_registered
    }

    pub fn enabled_codes(&self) -> Vec<u32> {
        self.state().enabled_codes.iter().copied().collect()
    }

    /// Buffer addresses of every return command, in order
    pub fn returned(&self) -> Vec<Vec<u64>> {
        self.state().returned.clone()
    }

    /// Buffers currently owned by the DSP
    pub fn free_buffers(&self) -> usize {
        self.state().dsp_owned.len()
    }

    /// Write each log into a DSP-owned buffer and raise the commit event
    ///
    /// Returns the indices filled; logs beyond the free buffers are dropped.
    pub fn commit(&self, logs: &[&[u8]]) -> Result<Vec<u32>> {
        let mut state = self.state();
        let pool = state
            .pool
            .ok_or_else(|| GslError::not_ready("no buffer pool configured"))?;
        let (client_domain, client_port) = state
            .client
            .ok_or_else(|| GslError::not_ready("no client registered"))?;

        let host = self
            .mapper
            .resolve(self.domain, pool.start_addr())
            .and_then(|addr| NonNull::new(addr as *mut u8))
            .ok_or_else(|| GslError::transport("buffer pool is not mapped on the DSP"))?;
        let stride = pool.max_log_pkt_size as usize;
        let count = pool.total_buf_size as usize / stride;
        // Safety: the mapper resolved a live mapping of total_buf_size bytes
        let ring = unsafe { LogBufferRing::from_raw_parts(host, stride, count)? };

        let mut filled = Vec::new();
        for data in logs {
            let Some(index) = state.dsp_owned.iter().next().copied() else {
                log::warn!("DSP out of log buffers, dropping {} logs", logs.len() - filled.len());
                break;
            };
            ring.fill(index as usize, data)?;
            state.dsp_owned.remove(&index);
            filled.push(index);
        }
        let notify = state.event_registered && !filled.is_empty();
        drop(state);

        if notify {
            let event = ModuleEvent {
                event_id: EVENT_ID_DLS_COMMIT_LOG_BUFFER,
                event_payload_size: 0,
            };
            let mut payload = vec![0u8; ModuleEvent::SIZE];
            event.encode(&mut WireWriter::new(&mut payload))?;
            self.injector.inject(Packet::with_payload(
                PacketHeader {
                    opcode: APM_EVENT_MODULE_TO_CLIENT,
                    token: 0,
                    src_domain: self.domain,
                    dst_domain: client_domain,
                    src_port: DLS_MODULE_INSTANCE_ID,
                    dst_port: client_port,
                },
                payload,
            ))?;
        }
        Ok(filled)
    }

    /// Command payload, wherever the header says it lives
    fn payload(&self, packet: &Packet) -> Result<Vec<u8>> {
        let header = ApmCmdHeader::from_bytes(packet.payload())?;
        let size = header.payload_size as usize;
        if !header.is_out_of_band() {
            return packet
                .payload()
                .get(ApmCmdHeader::SIZE..ApmCmdHeader::SIZE + size)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| GslError::bad_parameter("payload_size", "exceeds packet"));
        }
        let host = self
            .mapper
            .resolve(self.domain, header.payload_address())
            .ok_or_else(|| GslError::bad_parameter("payload_address", "not mapped"))?;
        // Safety: resolve only returns addresses inside live host mappings
        Ok(unsafe { std::slice::from_raw_parts(host as *const u8, size) }.to_vec())
    }

    fn execute(&self, packet: &Packet) -> Result<()> {
        let payload = self.payload(packet)?;
        let mut r = WireReader::new(&payload);
        let mut state = self.state();

        match packet.opcode() {
            APM_CMD_REGISTER_MODULE_EVENTS => {
                let reg = ModuleRegisterEvent::decode(&mut r)?;
                if reg.event_id != EVENT_ID_DLS_COMMIT_LOG_BUFFER {
                    return Err(GslError::unsupported(format!("event {:#x}", reg.event_id)));
                }
                state.event_registered = reg.is_register != 0;
                state.client = Some((packet.header().src_domain, packet.header().src_port));
            }
            APM_CMD_SET_CFG => {
                let param = ModuleParamData::decode(&mut r)?;
                match param.param_id {
                    PARAM_ID_DLS_BUFFER_CONFIG => {
                        let config = DlsBufferConfig::decode(&mut r)?;
                        let count = config.total_buf_size / config.max_log_pkt_size.max(1);
                        state.dsp_owned = (0..count).collect();
                        state.pool = Some(config);
                    }
                    PARAM_ID_DLS_ENABLE_LOG_CODES => {
                        state.enabled_codes.insert(DlsLogCode::decode(&mut r)?.log_code);
                    }
                    PARAM_ID_DLS_DISABLE_LOG_CODES => {
                        state.enabled_codes.remove(&DlsLogCode::decode(&mut r)?.log_code);
                    }
                    other => return Err(GslError::unsupported(format!("param {:#x}", other))),
                }
            }
            DLS_DATA_CMD_BUFFER_RETURN => {
                let ret = DlsBufferReturn::decode(&mut r)?;
                let pool = state
                    .pool
                    .ok_or_else(|| GslError::not_ready("no buffer pool configured"))?;
                let mut addrs = Vec::new();
                for entry in &ret.entries {
                    let offset = entry.addr().wrapping_sub(pool.start_addr());
                    if entry.mem_map_handle != pool.mem_map_handle
                        || offset >= pool.total_buf_size as u64
                        || offset % pool.max_log_pkt_size as u64 != 0
                    {
                        return Err(GslError::bad_parameter(
                            "buffer",
                            format!("{:#x} is not a buffer of the pool", entry.addr()),
                        ));
                    }
                    state
                        .dsp_owned
                        .insert((offset / pool.max_log_pkt_size as u64) as u32);
                    addrs.push(entry.addr());
                }
                state.returned.push(addrs);
            }
            other => return Err(GslError::unsupported(format!("opcode {:#x}", other))),
        }
        Ok(())
    }
}

impl RemoteEndpoint for SimulatedDls {
    fn handle(&self, packet: &Packet) -> Vec<Packet> {
        let injected = {
            let mut state = self.state();
            state.received.push(packet.opcode());
            match state.fail_next {
                Some((opcode, status)) if opcode == packet.opcode() => {
                    state.fail_next = None;
                    Some(status)
                }
                _ => None,
            }
        };

        let result = match injected {
            Some(status) => status,
            None => match self.execute(packet) {
                Ok(()) => status::AR_EOK,
                Err(e) => {
                    log::warn!("Simulated DLS rejected {:#010x}: {}", packet.opcode(), e);
                    e.status()
                }
            },
        };

        let rsp = BasicRsp {
            opcode: packet.opcode(),
            status: result,
        };
        let mut payload = vec![0u8; BasicRsp::SIZE];
        if rsp.encode(&mut WireWriter::new(&mut payload)).is_err() {
            return Vec::new();
        }
        vec![Packet::with_payload(
            packet.reply_header(GPR_IBASIC_RSP_RESULT),
            payload,
        )]
    }
}
