//! Shared-memory pool manager
//!
//! Host memory is carved into frame-granular blocks that are mapped into
//! remote processor domains through a [`RemoteMapper`]. Freed blocks keep
//! their home-domain mapping and are reused by later requests, which keeps
//! the expensive remote map calls off the command path.

pub mod allocation;
pub mod config;
pub mod manager;
pub mod mapper;
pub mod region;
pub mod ssr;
pub mod stats;

#[cfg(test)]
mod tests;

pub use allocation::{AllocKind, AllocMeta, Allocation, AllocationGuard, ExternMemory, PoolHandle};
pub use config::{AllocFlags, BackingType, PendingPolicy, PlatformInfo, ShmemPoolConfig};
pub use manager::{PendingDrain, ShmemManager};
pub use mapper::{RegionDesc, RemoteMapper, RemoteMapping, SimulatedMapper, VmId};
pub use region::HostRegion;
pub use ssr::MemMapKind;
pub use stats::{ShmemStats, ShmemStatsSnapshot};
