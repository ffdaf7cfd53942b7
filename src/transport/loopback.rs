//! In-process packet router
//!
//! Commands sent to a domain are handed to the [`RemoteEndpoint`] attached
//! for it; whatever the endpoint answers, and anything pushed through an
//! [`Injector`], is delivered to the registered port handlers on a
//! dedicated receive thread, the way a real router calls back.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard, RwLock,
    },
    thread::JoinHandle,
};

use crate::{
    domain::DomainId,
    error::{GslError, Result},
};

use super::{Packet, PacketHandler, PacketHeader, PacketSpec, Transport};

/// Remote side of the loopback router
pub trait RemoteEndpoint: Send + Sync {
    /// Handle a command; returned packets are delivered back to the host
    fn handle(&self, packet: &Packet) -> Vec<Packet>;
}

enum Delivery {
    Packet(Packet),
    Shutdown,
}

type HandlerMap = RwLock<HashMap<u32, Arc<dyn PacketHandler>>>;

/// Pushes unsolicited packets (events) into the receive path
#[derive(Clone)]
pub struct Injector {
    tx: Sender<Delivery>,
}

impl Injector {
    pub fn inject(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(Delivery::Packet(packet))
            .map_err(|_| GslError::transport("loopback receive thread is gone"))
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector").finish_non_exhaustive()
    }
}

/// Loopback GPR with per-domain shared-memory capability
pub struct LoopbackTransport {
    local: DomainId,
    shmem_domains: HashSet<DomainId>,
    handlers: Arc<HandlerMap>,
    endpoints: RwLock<HashMap<DomainId, Arc<dyn RemoteEndpoint>>>,
    tx: Sender<Delivery>,
    worker: Mutex<Option<JoinHandle<()>>>,
    live_packets: AtomicI64,
    sent: Mutex<Vec<Packet>>,
    fail_next_alloc: AtomicBool,
    fail_next_send: AtomicBool,
}

impl LoopbackTransport {
    /// Start a router for `local`; `shmem_domains` accept out-of-band payloads
    pub fn new(local: DomainId, shmem_domains: &[DomainId]) -> Result<Self> {
        let handlers: Arc<HandlerMap> = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::channel();

        let worker = {
            let handlers = Arc::clone(&handlers);
            std::thread::Builder::new()
                .name("gpr-loopback-rx".into())
                .spawn(move || receive_loop(rx, handlers))
                .map_err(|e| GslError::from_io(e, "spawn loopback receive thread"))?
        };

        Ok(Self {
            local,
            shmem_domains: shmem_domains.iter().copied().collect(),
            handlers,
            endpoints: RwLock::new(HashMap::new()),
            tx,
            worker: Mutex::new(Some(worker)),
            live_packets: AtomicI64::new(0),
            sent: Mutex::new(Vec::new()),
            fail_next_alloc: AtomicBool::new(false),
            fail_next_send: AtomicBool::new(false),
        })
    }

    /// Answer commands addressed to `domain` with `endpoint`
    pub fn attach(&self, domain: DomainId, endpoint: Arc<dyn RemoteEndpoint>) {
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(domain, endpoint);
    }

    pub fn injector(&self) -> Injector {
        Injector {
            tx: self.tx.clone(),
        }
    }

    /// Packets allocated through `alloc_packet` and neither sent nor freed
    pub fn outstanding_packets(&self) -> i64 {
        self.live_packets.load(Ordering::SeqCst)
    }

    fn sent_log(&self) -> MutexGuard<'_, Vec<Packet>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copies of every packet sent so far
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent_log().clone()
    }

    pub fn clear_sent(&self) {
        self.sent_log().clear();
    }

    /// Make the next `alloc_packet` fail
    pub fn fail_next_alloc(&self) {
        self.fail_next_alloc.store(true, Ordering::SeqCst);
    }

    /// Make the next `send` fail
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    pub fn is_registered(&self, port: u32) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&port)
    }
}

fn receive_loop(rx: Receiver<Delivery>, handlers: Arc<HandlerMap>) {
    while let Ok(Delivery::Packet(packet)) = rx.recv() {
        let port = packet.header().dst_port;
        let handler = handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port)
            .cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.on_packet(packet) {
                    log::warn!("Handler on port {:#x} failed: {}", port, e);
                }
            }
            None => log::warn!(
                "No handler on port {:#x}, dropping opcode {:#010x}",
                port,
                packet.opcode()
            ),
        }
    }
    log::trace!("Loopback receive thread exiting");
}

impl Transport for LoopbackTransport {
    fn local_domain(&self) -> DomainId {
        self.local
    }

    fn register(&self, port: u32, handler: Arc<dyn PacketHandler>) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&port) {
            return Err(GslError::busy(format!("port {:#x} already registered", port)));
        }
        handlers.insert(port, handler);
        Ok(())
    }

    fn deregister(&self, port: u32) -> Result<()> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port)
            .map(|_| ())
            .ok_or_else(|| GslError::bad_parameter("port", format!("{:#x} not registered", port)))
    }

    fn alloc_packet(&self, spec: &PacketSpec) -> Result<Packet> {
        if self.fail_next_alloc.swap(false, Ordering::SeqCst) {
            return Err(GslError::resource("simulated packet allocation failure"));
        }
        self.live_packets.fetch_add(1, Ordering::SeqCst);
        Ok(Packet::new(
            PacketHeader {
                opcode: spec.opcode,
                token: spec.token,
                src_domain: self.local,
                dst_domain: spec.dst_domain,
                src_port: spec.src_port,
                dst_port: spec.dst_port,
            },
            spec.payload_size,
        ))
    }

    fn free_packet(&self, packet: Packet) {
        self.live_packets.fetch_sub(1, Ordering::SeqCst);
        drop(packet);
    }

    fn send(&self, packet: Packet) -> Result<()> {
        self.live_packets.fetch_sub(1, Ordering::SeqCst);
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(GslError::transport("simulated send failure"));
        }

        let dst = packet.header().dst_domain;
        let endpoint = self
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&dst)
            .cloned()
            .ok_or_else(|| GslError::transport(format!("no route to {}", dst)))?;

        self.sent_log().push(packet.clone());
        for reply in endpoint.handle(&packet) {
            self.tx
                .send(Delivery::Packet(reply))
                .map_err(|_| GslError::transport("loopback receive thread is gone"))?;
        }
        Ok(())
    }

    fn supports_shmem(&self, domain: DomainId) -> bool {
        self.shmem_domains.contains(&domain)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let _ = self.tx.send(Delivery::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Loopback receive thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apm::{BasicRsp, WireFormat, GPR_IBASIC_RSP_RESULT};
    use std::sync::mpsc::SyncSender;
    use std::time::Duration;

    struct Echo;

    impl RemoteEndpoint for Echo {
        fn handle(&self, packet: &Packet) -> Vec<Packet> {
            let rsp = BasicRsp {
                opcode: packet.opcode(),
                status: 0,
            };
            let mut payload = vec![0u8; BasicRsp::SIZE];
            rsp.encode(&mut crate::apm::WireWriter::new(&mut payload)).unwrap();
            vec![Packet::with_payload(
                packet.reply_header(GPR_IBASIC_RSP_RESULT),
                payload,
            )]
        }
    }

    struct Forward(Mutex<SyncSender<Packet>>);

    impl PacketHandler for Forward {
        fn on_packet(&self, packet: Packet) -> Result<()> {
            self.0.lock().unwrap().send(packet).unwrap();
            Ok(())
        }
    }

    fn spec(payload_size: usize) -> PacketSpec {
        PacketSpec {
            opcode: 0x0100_1006,
            src_port: 0x2003,
            dst_port: 1,
            token: 9,
            dst_domain: DomainId::ADSP,
            payload_size,
        }
    }

    #[test]
    fn test_reply_reaches_handler() {
        let transport = LoopbackTransport::new(DomainId::APPS, &[DomainId::ADSP]).unwrap();
        transport.attach(DomainId::ADSP, Arc::new(Echo));
        let (tx, rx) = mpsc::sync_channel(4);
        transport
            .register(0x2003, Arc::new(Forward(Mutex::new(tx))))
            .unwrap();

        let packet = transport.alloc_packet(&spec(8)).unwrap();
        assert_eq!(transport.outstanding_packets(), 1);
        transport.send(packet).unwrap();
        assert_eq!(transport.outstanding_packets(), 0);

        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.opcode(), GPR_IBASIC_RSP_RESULT);
        assert_eq!(reply.token(), 9);
        assert_eq!(reply.header().dst_port, 0x2003);
        assert_eq!(transport.sent_packets().len(), 1);
    }

    #[test]
    fn test_register_twice_and_deregister() {
        let transport = LoopbackTransport::new(DomainId::APPS, &[]).unwrap();
        let (tx, _rx) = mpsc::sync_channel(1);
        let handler: Arc<dyn PacketHandler> = Arc::new(Forward(Mutex::new(tx)));

        transport.register(7, handler.clone()).unwrap();
        assert!(transport.register(7, handler).is_err());
        transport.deregister(7).unwrap();
        assert!(transport.deregister(7).is_err());
        assert!(!transport.supports_shmem(DomainId::ADSP));
    }

    #[test]
    fn test_send_without_route_fails() {
        let transport = LoopbackTransport::new(DomainId::APPS, &[]).unwrap();
        let packet = transport.alloc_packet(&spec(0)).unwrap();
        assert!(transport.send(packet).is_err());
        assert_eq!(transport.outstanding_packets(), 0);
    }
}
