//! Per-domain subsystem-restart state and the pending memory-map queue

use std::collections::VecDeque;

use crate::{
    apm::{APM_CMD_SHARED_MEM_MAP_REGIONS, APM_CMD_SHARED_MEM_UNMAP_REGIONS},
    error::{GslError, Result},
    transport::Packet,
};

use super::config::PendingPolicy;

/// Kind of a queued memory-map request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMapKind {
    Map,
    Unmap,
}

impl MemMapKind {
    /// Classify a packet by opcode
    pub fn of(packet: &Packet) -> Result<Self> {
        match packet.opcode() {
            APM_CMD_SHARED_MEM_MAP_REGIONS => Ok(Self::Map),
            APM_CMD_SHARED_MEM_UNMAP_REGIONS => Ok(Self::Unmap),
            other => Err(GslError::bad_parameter(
                "packet",
                format!("opcode {:#010x} is not a memory-map request", other),
            )),
        }
    }
}

/// Whether a domain belongs to the fixed master set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DomainKind {
    Master,
    DynamicPd,
}

#[derive(Debug)]
pub(crate) struct DomainState {
    pub kind: DomainKind,
    pub down: bool,
    pending: VecDeque<(MemMapKind, Packet)>,
}

impl DomainState {
    pub fn new(kind: DomainKind) -> Self {
        Self {
            kind,
            down: false,
            pending: VecDeque::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn enqueue(&mut self, kind: MemMapKind, packet: Packet) {
        self.pending.push_back((kind, packet));
    }

    /// Empty the queue, returning what should be replayed and what was dropped
    pub fn drain(&mut self, policy: PendingPolicy) -> (Vec<Packet>, Vec<Packet>) {
        let mut replay = Vec::new();
        let mut dropped = Vec::new();
        for (kind, packet) in self.pending.drain(..) {
            match (policy, kind) {
                (PendingPolicy::Replay, MemMapKind::Map) => replay.push(packet),
                _ => dropped.push(packet),
            }
        }
        (replay, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::DomainId, transport::PacketHeader};

    fn packet(opcode: u32) -> Packet {
        Packet::new(
            PacketHeader {
                opcode,
                token: 0,
                src_domain: DomainId::APPS,
                dst_domain: DomainId::ADSP,
                src_port: 1,
                dst_port: 1,
            },
            0,
        )
    }

    #[test]
    fn test_drain_replays_maps_only() {
        let mut state = DomainState::new(DomainKind::Master);
        state.enqueue(MemMapKind::Map, packet(APM_CMD_SHARED_MEM_MAP_REGIONS));
        state.enqueue(MemMapKind::Unmap, packet(APM_CMD_SHARED_MEM_UNMAP_REGIONS));

        let (replay, dropped) = state.drain(PendingPolicy::Replay);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].opcode(), APM_CMD_SHARED_MEM_MAP_REGIONS);
        assert_eq!(dropped.len(), 1);
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_discard_policy_drops_everything() {
        let mut state = DomainState::new(DomainKind::Master);
        state.enqueue(MemMapKind::Map, packet(APM_CMD_SHARED_MEM_MAP_REGIONS));
        let (replay, dropped) = state.drain(PendingPolicy::Discard);
        assert!(replay.is_empty());
        assert_eq!(dropped.len(), 1);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            MemMapKind::of(&packet(APM_CMD_SHARED_MEM_UNMAP_REGIONS)).unwrap(),
            MemMapKind::Unmap
        );
        assert!(MemMapKind::of(&packet(0x1234)).is_err());
    }
}
