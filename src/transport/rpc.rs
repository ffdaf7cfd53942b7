//! Blocking request/response on top of the asynchronous transport
//!
//! Every command carries its own token. The sender registers the token in a
//! [`ResponseTable`] before sending and blocks on that slot only, so several
//! commands may be in flight on one session.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::error::{status, GslError, Result};

use super::{Packet, Transport};

#[derive(Debug, Default)]
struct Slot {
    status: Mutex<Option<u32>>,
    ready: Condvar,
}

impl Slot {
    fn status(&self) -> MutexGuard<'_, Option<u32>> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Token-keyed table of outstanding commands
#[derive(Debug)]
pub struct ResponseTable {
    next_token: AtomicU32,
    slots: Mutex<HashMap<u32, Arc<Slot>>>,
}

impl Default for ResponseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTable {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU32::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u32, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fresh non-zero token
    pub fn next_token(&self) -> u32 {
        loop {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            if token != 0 {
                return token;
            }
        }
    }

    /// Start waiting for the response carrying `token`
    pub fn register(&self, token: u32) -> PendingResponse<'_> {
        let slot = Arc::new(Slot::default());
        self.slots().insert(token, Arc::clone(&slot));
        PendingResponse {
            table: self,
            token,
            slot,
        }
    }

    /// Deliver a response status; false when nobody waits for `token`
    pub fn complete(&self, token: u32, result: u32) -> bool {
        let Some(slot) = self.slots().get(&token).cloned() else {
            log::debug!("Dropping response for unknown token {}", token);
            return false;
        };
        *slot.status() = Some(result);
        slot.ready.notify_all();
        true
    }

    /// Complete every outstanding command with `result`
    pub fn fail_all(&self, result: u32) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        for slot in &slots {
            *slot.status() = Some(result);
            slot.ready.notify_all();
        }
        slots.len()
    }

    /// Number of commands awaiting a response
    pub fn pending(&self) -> usize {
        self.slots().len()
    }
}

/// One outstanding command; leaves the table when dropped
#[derive(Debug)]
pub struct PendingResponse<'a> {
    table: &'a ResponseTable,
    token: u32,
    slot: Arc<Slot>,
}

impl PendingResponse<'_> {
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Block until the response arrives; returns its status code
    pub fn wait(self, timeout: Option<Duration>) -> Result<u32> {
        let guard = self.slot.status();
        let guard = match timeout {
            Some(timeout) => {
                let (guard, result) = self
                    .slot
                    .ready
                    .wait_timeout_while(guard, timeout, |s| s.is_none())
                    .unwrap_or_else(|e| e.into_inner());
                if result.timed_out() && guard.is_none() {
                    return Err(GslError::Timeout { token: self.token });
                }
                guard
            }
            None => self
                .slot
                .ready
                .wait_while(guard, |s| s.is_none())
                .unwrap_or_else(|e| e.into_inner()),
        };
        let result = *guard;
        result.ok_or(GslError::Timeout { token: self.token })
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.table.slots().remove(&self.token);
    }
}

/// Send `packet` and block until its response arrives
///
/// A non-zero response status is logged and returned as
/// [`GslError::Remote`]. Must not be called from the receive context.
pub fn send_and_wait(
    transport: &dyn Transport,
    table: &ResponseTable,
    packet: Packet,
    timeout: Option<Duration>,
) -> Result<()> {
    let opcode = packet.opcode();
    let pending = table.register(packet.token());

    if let Err(e) = transport.send(packet) {
        log::error!("Failed to send command {:#010x}: {}", opcode, e);
        return Err(e);
    }

    let result = pending.wait(timeout)?;
    if result != status::AR_EOK {
        log::error!("Command {:#010x} failed with status {:#x}", opcode, result);
        return Err(GslError::Remote {
            opcode,
            status: result,
        });
    }
    Ok(())
}
