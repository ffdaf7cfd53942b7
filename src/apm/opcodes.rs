//! Opcodes and identifiers of the APM/DLS control protocol subset used here

/// Set module parameters
pub const APM_CMD_SET_CFG: u32 = 0x0100_1006;
/// Map shared memory into SPF
pub const APM_CMD_SHARED_MEM_MAP_REGIONS: u32 = 0x0100_100C;
/// Unmap shared memory from SPF
pub const APM_CMD_SHARED_MEM_UNMAP_REGIONS: u32 = 0x0100_100D;
/// Register/deregister a module event
pub const APM_CMD_REGISTER_MODULE_EVENTS: u32 = 0x0100_100E;
/// Hand drained log buffers back to the DLS module
pub const DLS_DATA_CMD_BUFFER_RETURN: u32 = 0x0100_1042;

/// Generic command response carrying `{opcode, status}`
pub const GPR_IBASIC_RSP_RESULT: u32 = 0x0200_1005;
/// Response to a memory map command, carrying the map handle
pub const APM_CMD_RSP_SHARED_MEM_MAP_REGIONS: u32 = 0x0200_1001;

/// Module-raised event delivered to a client
pub const APM_EVENT_MODULE_TO_CLIENT: u32 = 0x0300_1000;

/// APM itself
pub const APM_MODULE_INSTANCE_ID: u32 = 0x0000_0001;
/// Data Logging Service module instance
pub const DLS_MODULE_INSTANCE_ID: u32 = 0x0000_0009;

/// Shared buffer pool geometry for DLS
pub const PARAM_ID_DLS_BUFFER_CONFIG: u32 = 0x0800_1B00;
/// Start capturing the listed log codes
pub const PARAM_ID_DLS_ENABLE_LOG_CODES: u32 = 0x0800_1B01;
/// Stop capturing the listed log codes
pub const PARAM_ID_DLS_DISABLE_LOG_CODES: u32 = 0x0800_1B02;
/// DLS filled one or more log buffers
pub const EVENT_ID_DLS_COMMIT_LOG_BUFFER: u32 = 0x0800_1B03;

/// 4 KiB-aligned shared memory pool
pub const APM_MEMORY_MAP_SHMEM8_4K_POOL: u16 = 3;
/// Region was mapped uncached
pub const APM_MEMORY_MAP_BIT_MASK_IS_UNCACHED: u32 = 0x0000_0004;
/// Region is loaned to SPF for the session
pub const APM_MEMORY_MAP_BIT_MASK_IS_MEM_LOANED: u32 = 0x0000_0008;
