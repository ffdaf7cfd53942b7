//! Data Logging Service client
//!
//! The DSP streams log packets into a ring of shared buffers. The host
//! configures the ring, scans it for READY buffers when the commit event
//! fires, reads them in place and hands them back.

pub mod client;
pub mod config;
pub mod events;
pub mod layout;
pub mod sim;

pub use client::{DlsClient, LogBuffer};
pub use config::{BufferPoolConfig, DlsClientOptions};
pub use events::{DlsStats, DlsStatsSnapshot, ReadyCallback};
pub use layout::{BufferState, LogBufferHeader, LogBufferRing, LOG_BUFFER_NOT_READY, LOG_BUFFER_READY};
pub use sim::SimulatedDls;
