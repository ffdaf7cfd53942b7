//! Subset of the APM/DLS control protocol consumed by this crate
//!
//! Only the headers and parameters the pool manager and the log client
//! exchange with SPF are modelled; everything else travels as opaque bytes.

pub mod opcodes;
pub mod wire;

pub use opcodes::*;
pub use wire::{
    ApmCmdHeader, BasicRsp, DlsBufferConfig, DlsBufferEntry, DlsBufferReturn, DlsLogCode,
    ModuleEvent, ModuleParamData, ModuleRegisterEvent, SharedMemMapRegion, WireFormat,
    WireReader, WireWriter,
};
