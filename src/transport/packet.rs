//! GPR packet representation

use crate::domain::DomainId;

/// Routing header of a GPR packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: u32,
    pub token: u32,
    pub src_domain: DomainId,
    pub dst_domain: DomainId,
    pub src_port: u32,
    pub dst_port: u32,
}

/// Parameters for [`Transport::alloc_packet`](super::Transport::alloc_packet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSpec {
    pub opcode: u32,
    pub src_port: u32,
    pub dst_port: u32,
    pub token: u32,
    pub dst_domain: DomainId,
    /// Bytes of payload area to reserve
    pub payload_size: usize,
}

/// A GPR packet: routing header plus payload area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet with a zeroed payload area
    pub fn new(header: PacketHeader, payload_size: usize) -> Self {
        Self {
            header,
            payload: vec![0; payload_size],
        }
    }

    /// Create a packet around an existing payload
    pub fn with_payload(header: PacketHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn opcode(&self) -> u32 {
        self.header.opcode
    }

    pub fn token(&self) -> u32 {
        self.header.token
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Header for a packet answering this one
    pub fn reply_header(&self, opcode: u32) -> PacketHeader {
        PacketHeader {
            opcode,
            token: self.header.token,
            src_domain: self.header.dst_domain,
            dst_domain: self.header.src_domain,
            src_port: self.header.dst_port,
            dst_port: self.header.src_port,
        }
    }
}
