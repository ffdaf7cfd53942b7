//! Asynchronous packets addressed to the log client's port

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    apm::{
        BasicRsp, ModuleEvent, WireFormat, APM_EVENT_MODULE_TO_CLIENT,
        EVENT_ID_DLS_COMMIT_LOG_BUFFER, GPR_IBASIC_RSP_RESULT,
    },
    error::{status, Result},
    transport::{Packet, PacketHandler, ResponseTable},
};

/// Invoked on the receive context when the DSP commits buffers
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

/// Counters of the log client
#[derive(Debug, Default)]
pub struct DlsStats {
    pub commands_sent: AtomicU64,
    pub command_failures: AtomicU64,
    pub commit_events: AtomicU64,
    pub buffers_returned: AtomicU64,
}

/// Point-in-time copy of [`DlsStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlsStatsSnapshot {
    pub commands_sent: u64,
    pub command_failures: u64,
    pub commit_events: u64,
    pub buffers_returned: u64,
}

impl DlsStats {
    pub fn snapshot(&self) -> DlsStatsSnapshot {
        DlsStatsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            commit_events: self.commit_events.load(Ordering::Relaxed),
            buffers_returned: self.buffers_returned.load(Ordering::Relaxed),
        }
    }
}

/// Port handler shared between the client and the transport
pub(crate) struct ClientEvents {
    pub responses: ResponseTable,
    pub stats: DlsStats,
    ready: Option<ReadyCallback>,
}

impl ClientEvents {
    pub fn new(ready: Option<ReadyCallback>) -> Self {
        Self {
            responses: ResponseTable::new(),
            stats: DlsStats::default(),
            ready,
        }
    }
}

impl PacketHandler for ClientEvents {
    fn on_packet(&self, packet: Packet) -> Result<()> {
        match packet.opcode() {
            GPR_IBASIC_RSP_RESULT => {
                let rsp = BasicRsp::from_bytes(packet.payload())?;
                if rsp.status != status::AR_EOK {
                    log::error!(
                        "DLS command {:#010x} failed with status {:#x}",
                        rsp.opcode,
                        rsp.status
                    );
                }
                self.responses.complete(packet.token(), rsp.status);
            }
            APM_EVENT_MODULE_TO_CLIENT => {
                let event = ModuleEvent::from_bytes(packet.payload())?;
                if event.event_id == EVENT_ID_DLS_COMMIT_LOG_BUFFER {
                    self.stats.commit_events.fetch_add(1, Ordering::Relaxed);
                    if let Some(ready) = &self.ready {
                        ready();
                    }
                } else {
                    log::debug!("Ignoring module event {:#010x}", event.event_id);
                }
            }
            other => log::warn!("Unexpected opcode {:#010x} on DLS client port", other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apm::WireWriter,
        domain::DomainId,
        transport::PacketHeader,
    };
    use std::sync::{atomic::AtomicUsize, Arc};

    fn packet<T: WireFormat>(opcode: u32, token: u32, body: T) -> Packet {
        let mut payload = vec![0u8; T::SIZE];
        body.encode(&mut WireWriter::new(&mut payload)).unwrap();
        Packet::with_payload(
            PacketHeader {
                opcode,
                token,
                src_domain: DomainId::ADSP,
                dst_domain: DomainId::APPS,
                src_port: 9,
                dst_port: 0x2003,
            },
            payload,
        )
    }

    #[test]
    fn test_commit_event_invokes_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let events = ClientEvents::new(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let commit = ModuleEvent {
            event_id: EVENT_ID_DLS_COMMIT_LOG_BUFFER,
            event_payload_size: 0,
        };
        events
            .on_packet(packet(APM_EVENT_MODULE_TO_CLIENT, 0, commit))
            .unwrap();
        let other = ModuleEvent {
            event_id: 0x1234,
            event_payload_size: 0,
        };
        events
            .on_packet(packet(APM_EVENT_MODULE_TO_CLIENT, 0, other))
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(events.stats.snapshot().commit_events, 1);
    }

    #[test]
    fn test_response_completes_token() {
        let events = ClientEvents::new(None);
        let pending = events.responses.register(11);
        let rsp = BasicRsp {
            opcode: 0x0100_1006,
            status: status::AR_EFAILED,
        };
        events
            .on_packet(packet(GPR_IBASIC_RSP_RESULT, 11, rsp))
            .unwrap();
        assert_eq!(pending.wait(None).unwrap(), status::AR_EFAILED);
    }

    #[test]
    fn test_truncated_response_is_an_error() {
        let events = ClientEvents::new(None);
        let short = Packet::with_payload(
            PacketHeader {
                opcode: GPR_IBASIC_RSP_RESULT,
                token: 1,
                src_domain: DomainId::ADSP,
                dst_domain: DomainId::APPS,
                src_port: 9,
                dst_port: 0x2003,
            },
            vec![0; 3],
        );
        assert!(events.on_packet(short).is_err());
    }
}
