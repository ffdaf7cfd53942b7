//! Packet-router (GPR) boundary
//!
//! The crate talks to remote domains only through [`Transport`]. Incoming
//! packets are delivered asynchronously to the [`PacketHandler`] registered
//! for their destination port, typically on a dedicated receive thread.

pub mod loopback;
pub mod packet;
pub mod rpc;

use std::sync::Arc;

use crate::{domain::DomainId, error::Result};

pub use loopback::{Injector, LoopbackTransport, RemoteEndpoint};
pub use packet::{Packet, PacketHeader, PacketSpec};
pub use rpc::{send_and_wait, PendingResponse, ResponseTable};

/// Receiver of asynchronous packets for one local port
///
/// Runs on the transport's receive context and must not block.
pub trait PacketHandler: Send + Sync {
    fn on_packet(&self, packet: Packet) -> Result<()>;
}

/// Inter-processor packet transport
pub trait Transport: Send + Sync {
    /// Domain this host is addressed as
    fn local_domain(&self) -> DomainId;

    /// Route packets addressed to `port` to `handler`
    fn register(&self, port: u32, handler: Arc<dyn PacketHandler>) -> Result<()>;

    fn deregister(&self, port: u32) -> Result<()>;

    /// Allocate a packet with a zeroed payload area
    fn alloc_packet(&self, spec: &PacketSpec) -> Result<Packet>;

    /// Release a packet that will not be sent
    fn free_packet(&self, packet: Packet);

    /// Send a packet; the transport owns it afterwards, on failure too
    fn send(&self, packet: Packet) -> Result<()>;

    /// Whether commands to `domain` may carry out-of-band payloads
    fn supports_shmem(&self, domain: DomainId) -> bool;
}

/// Port registration released on drop
pub struct PortRegistration {
    transport: Arc<dyn Transport>,
    port: u32,
}

impl PortRegistration {
    pub fn new(
        transport: Arc<dyn Transport>,
        port: u32,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<Self> {
        transport.register(port, handler)?;
        Ok(Self { transport, port })
    }

    pub fn port(&self) -> u32 {
        self.port
    }
}

impl std::fmt::Debug for PortRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistration")
            .field("port", &format_args!("{:#x}", self.port))
            .finish()
    }
}

impl Drop for PortRegistration {
    fn drop(&mut self) {
        if let Err(e) = self.transport.deregister(self.port) {
            log::warn!("Failed to deregister port {:#x}: {}", self.port, e);
        }
    }
}
