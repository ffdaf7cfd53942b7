//! In-band / out-of-band placement of command payloads

use std::{collections::HashMap, sync::Arc};

use crate::{
    domain::{DomainId, SubsystemMask},
    error::{GslError, Result},
    shmem::{AllocFlags, PlatformInfo, RemoteMapper, ShmemManager, ShmemPoolConfig},
    transport::{PacketSpec, Transport},
};

use super::message::{GslMessage, PayloadLocation};

/// Shape of a message to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgSpec {
    pub opcode: u32,
    pub src_port: u32,
    pub dst_port: u32,
    /// Bytes reserved at the start of the packet for the command header
    pub header_size: usize,
    pub token: u32,
    pub dest_domain: DomainId,
    /// Payload bytes following the header
    pub oob_payload_size: usize,
    /// Keep the payload in the packet even when shared memory is available
    pub force_inband: bool,
}

/// Builds messages whose payload placement follows the destination's capability
///
/// Shared-memory support is queried once per domain at [`init`](Self::init)
/// and cached; domains outside the initial set are treated as in-band only.
pub struct MessageBuilder {
    transport: Arc<dyn Transport>,
    pool: Arc<ShmemManager>,
    shmem_support: HashMap<DomainId, bool>,
}

impl MessageBuilder {
    /// Probe `domains` and set up the pool manager for them
    pub fn init(
        domains: &[DomainId],
        transport: Arc<dyn Transport>,
        mapper: Arc<dyn RemoteMapper>,
        pool_config: ShmemPoolConfig,
    ) -> Result<Self> {
        let shmem_support: HashMap<DomainId, bool> = domains
            .iter()
            .map(|d| (*d, transport.supports_shmem(*d)))
            .collect();
        for (domain, supported) in &shmem_support {
            log::debug!("{}: shared memory {}", domain, if *supported { "supported" } else { "not supported" });
        }

        let pool = Arc::new(ShmemManager::init(domains, pool_config, mapper)?);
        Ok(Self {
            transport,
            pool,
            shmem_support,
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The pool manager backing out-of-band payloads
    pub fn pool(&self) -> &Arc<ShmemManager> {
        &self.pool
    }

    /// Cached shared-memory capability of `domain`
    pub fn supports_shmem(&self, domain: DomainId) -> bool {
        self.shmem_support.get(&domain).copied().unwrap_or(false)
    }

    /// Build a message with default shared-memory attributes
    pub fn alloc(&self, spec: &MsgSpec) -> Result<GslMessage> {
        self.alloc_ext(spec, SubsystemMask::NONE, AllocFlags::default(), None)
    }

    /// Build a message; out-of-band payloads are also mapped to every
    /// domain in `ss_mask`
    pub fn alloc_ext(
        &self,
        spec: &MsgSpec,
        ss_mask: SubsystemMask,
        flags: AllocFlags,
        platform: Option<&PlatformInfo>,
    ) -> Result<GslMessage> {
        let in_band = spec.force_inband || !self.supports_shmem(spec.dest_domain);
        let packet_size = if in_band {
            spec.header_size
                .checked_add(spec.oob_payload_size)
                .ok_or_else(|| {
                    GslError::bad_parameter(
                        "oob_payload_size",
                        format!(
                            "{} byte payload does not fit an in-band packet",
                            spec.oob_payload_size
                        ),
                    )
                })?
        } else {
            spec.header_size
        };

        let packet = self.transport.alloc_packet(&PacketSpec {
            opcode: spec.opcode,
            src_port: spec.src_port,
            dst_port: spec.dst_port,
            token: spec.token,
            dst_domain: spec.dest_domain,
            payload_size: packet_size,
        })?;

        let mut msg = GslMessage {
            packet: Some(packet),
            shmem: None,
            location: if in_band {
                PayloadLocation::InBand {
                    offset: spec.header_size,
                }
            } else {
                PayloadLocation::OutOfBand
            },
            header_size: spec.header_size,
            payload_size: spec.oob_payload_size,
            dest_domain: spec.dest_domain,
            transport: Arc::clone(&self.transport),
            pool: Arc::clone(&self.pool),
        };

        if in_band || spec.oob_payload_size == 0 {
            return Ok(msg);
        }

        // Dropping `msg` on any error below releases the packet and allocation
        let alloc = self
            .pool
            .alloc_ext(spec.oob_payload_size, spec.dest_domain, flags, platform)?;
        msg.shmem = Some(alloc);

        if let Some(alloc) = msg.shmem.as_ref() {
            for domain in ss_mask.domains().filter(|d| *d != spec.dest_domain) {
                self.pool.map_allocation(alloc, domain)?;
            }
        }
        Ok(msg)
    }

    /// Release a message's packet and allocation; repeat calls are no-ops
    pub fn free(&self, msg: Option<&mut GslMessage>) -> Result<()> {
        match msg {
            Some(msg) => msg.free(),
            None => Err(GslError::bad_parameter("msg", "No message to free")),
        }
    }
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("shmem_support", &self.shmem_support)
            .finish_non_exhaustive()
    }
}
