//! A command under construction: packet plus optional shared payload

use std::sync::Arc;

use crate::{
    apm::{ApmCmdHeader, WireFormat, WireWriter},
    domain::DomainId,
    error::{GslError, Result},
    shmem::{Allocation, ShmemManager},
    transport::{Packet, Transport},
};

/// Where a message's payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLocation {
    /// Inside the packet, right after the header
    InBand { offset: usize },
    /// In a shared-memory allocation
    OutOfBand,
}

/// Packet and payload built by [`MessageBuilder`](super::MessageBuilder)
///
/// Owns its packet and allocation until [`free`](Self::free), which also
/// runs on drop. Taking the packet for sending leaves the allocation in
/// place so the remote side can still read it.
pub struct GslMessage {
    pub(crate) packet: Option<Packet>,
    pub(crate) shmem: Option<Allocation>,
    pub(crate) location: PayloadLocation,
    pub(crate) header_size: usize,
    pub(crate) payload_size: usize,
    pub(crate) dest_domain: DomainId,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pool: Arc<ShmemManager>,
}

impl GslMessage {
    pub fn location(&self) -> PayloadLocation {
        self.location
    }

    pub fn is_oob(&self) -> bool {
        self.location == PayloadLocation::OutOfBand
    }

    pub fn dest_domain(&self) -> DomainId {
        self.dest_domain
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// The packet, until it is taken or freed
    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    /// The shared-memory allocation backing an out-of-band payload
    pub fn allocation(&self) -> Option<&Allocation> {
        self.shmem.as_ref()
    }

    /// Header area at the start of the packet payload
    pub fn header_mut(&mut self) -> Result<&mut [u8]> {
        let header_size = self.header_size;
        let packet = self.packet.as_mut().ok_or_else(|| GslError::not_ready("message packet"))?;
        Ok(&mut packet.payload_mut()[..header_size])
    }

    pub fn payload(&self) -> Result<&[u8]> {
        match self.location {
            PayloadLocation::InBand { offset } => self
                .packet
                .as_ref()
                .map(|p| &p.payload()[offset..])
                .ok_or_else(|| GslError::not_ready("message packet")),
            PayloadLocation::OutOfBand => match &self.shmem {
                Some(alloc) => Ok(alloc.as_slice()),
                None => Ok(&[][..]),
            },
        }
    }

    pub fn payload_mut(&mut self) -> Result<&mut [u8]> {
        match self.location {
            PayloadLocation::InBand { offset } => self
                .packet
                .as_mut()
                .map(|p| &mut p.payload_mut()[offset..])
                .ok_or_else(|| GslError::not_ready("message packet")),
            PayloadLocation::OutOfBand => match &mut self.shmem {
                Some(alloc) => Ok(alloc.as_mut_slice()),
                None => Ok(&mut [][..]),
            },
        }
    }

    /// APM command header describing where the payload is
    pub fn cmd_header(&self) -> ApmCmdHeader {
        match &self.shmem {
            Some(alloc) if self.is_oob() => ApmCmdHeader::out_of_band(
                alloc.remote_addr(),
                alloc.map_handle(),
                self.payload_size as u32,
            ),
            _ => ApmCmdHeader::in_band(self.payload_size as u32),
        }
    }

    /// Write [`cmd_header`](Self::cmd_header) into the header area
    pub fn write_cmd_header(&mut self) -> Result<()> {
        let header = self.cmd_header();
        let area = self.header_mut()?;
        if area.len() < ApmCmdHeader::SIZE {
            return Err(GslError::bad_parameter(
                "header_size",
                format!("{} bytes cannot hold an APM command header", area.len()),
            ));
        }
        header.encode(&mut WireWriter::new(area))
    }

    /// Remove the packet for sending
    pub fn take_packet(&mut self) -> Result<Packet> {
        self.packet
            .take()
            .ok_or_else(|| GslError::not_ready("message packet already taken"))
    }

    /// Release the allocation and packet; later calls are no-ops
    pub fn free(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(alloc) = self.shmem.take() {
            result = self.pool.free(alloc);
        }
        if let Some(packet) = self.packet.take() {
            self.transport.free_packet(packet);
        }
        result
    }
}

impl std::fmt::Debug for GslMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GslMessage")
            .field("opcode", &self.packet.as_ref().map(|p| p.opcode()))
            .field("location", &self.location)
            .field("payload_size", &self.payload_size)
            .field("dest_domain", &self.dest_domain)
            .field("shmem", &self.shmem.as_ref().map(|a| a.handle()))
            .finish()
    }
}

impl Drop for GslMessage {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            log::warn!("Failed to release message resources: {}", e);
        }
    }
}
