//! # gsl-host - shared-memory transport and DSP log client
//!
//! Host-side resource management for driving the SPF audio engine on a
//! remote DSP over the GPR packet router, and for draining the DSP's
//! diagnostic log stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              DLS log buffer client              │
//! │  buffer ring config │ ready scan │ buffer return │
//! ├─────────────────────────────────────────────────┤
//! │                Message builder                  │
//! │   in-band packet  or  packet + OOB allocation   │
//! ├────────────────────────┬────────────────────────┤
//! │ Shared-memory pool     │  Transport (GPR)       │
//! │ - frame-granular reuse │  - port handlers       │
//! │ - per-domain mappings  │  - token-keyed RPC     │
//! │ - SSR recovery         │                        │
//! └────────────────────────┴────────────────────────┘
//! ```
//!
//! Remote mapping sits behind [`shmem::RemoteMapper`] and packet routing
//! behind [`transport::Transport`]; [`shmem::SimulatedMapper`],
//! [`transport::LoopbackTransport`] and [`dls::SimulatedDls`] provide an
//! in-process stand-in for the DSP side.

pub mod apm;
pub mod dls;
pub mod domain;
pub mod error;
pub mod msg;
pub mod shmem;
pub mod transport;

pub use dls::{BufferPoolConfig, DlsClient, DlsClientOptions, LogBuffer};
pub use domain::{DomainId, SubsystemMask};
pub use error::{GslError, Result};
pub use msg::{GslMessage, MessageBuilder, MsgSpec};
pub use shmem::{AllocFlags, Allocation, ShmemManager, ShmemPoolConfig};
pub use transport::{Packet, PacketHandler, Transport};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    /// Pool frame granularity (4 KiB)
    pub const DEFAULT_FRAME_SIZE: usize = 4096;

    /// Smallest log buffer the DSP accepts
    pub const DLS_MIN_BUFFER_SIZE: u32 = 2 * 1024;

    /// Largest log buffer the DSP accepts
    pub const DLS_MAX_BUFFER_SIZE: u32 = 8 * 1024;

    pub const DLS_MIN_BUFFER_COUNT: u32 = 1;

    pub const DLS_MAX_BUFFER_COUNT: u32 = 64;

    /// `{state: u32, size: u32}` at the start of every log buffer
    pub const DLS_LOG_BUFFER_HEADER_SIZE: usize = 8;

    /// Local GPR port of the log client
    pub const DLS_CLIENT_PORT: u32 = 0x2003;
}
