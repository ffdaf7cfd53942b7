//! Fixed-layout little-endian payload structures

use crate::error::{GslError, Result};

/// Cursor over an output byte slice
#[derive(Debug)]
pub struct WireWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(GslError::bad_parameter(
                "payload",
                format!("write of {} bytes overflows {}-byte buffer", end, self.buf.len()),
            ));
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }
}

/// Cursor over an input byte slice
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(GslError::bad_parameter(
                "payload",
                format!("truncated: need {} bytes, have {}", N, self.remaining()),
            ));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take::<2>()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }
}

/// A structure with a fixed wire layout
pub trait WireFormat: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()>;

    fn decode(r: &mut WireReader<'_>) -> Result<Self>;

    /// Decode from the start of a byte slice
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut WireReader::new(bytes))
    }
}

/// Split a 64-bit address into `(lsw, msw)`
pub fn split_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

/// Join `(lsw, msw)` into a 64-bit address
pub fn join_addr(lsw: u32, msw: u32) -> u64 {
    ((msw as u64) << 32) | lsw as u64
}

/// Header at the start of every APM command payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApmCmdHeader {
    pub payload_address_lsw: u32,
    pub payload_address_msw: u32,
    pub mem_map_handle: u32,
    pub payload_size: u32,
}

impl ApmCmdHeader {
    /// Payload follows in the same packet
    pub fn in_band(payload_size: u32) -> Self {
        Self {
            payload_size,
            ..Default::default()
        }
    }

    /// Payload lives in shared memory
    pub fn out_of_band(remote_addr: u64, mem_map_handle: u32, payload_size: u32) -> Self {
        let (lsw, msw) = split_addr(remote_addr);
        Self {
            payload_address_lsw: lsw,
            payload_address_msw: msw,
            mem_map_handle,
            payload_size,
        }
    }

    pub fn is_out_of_band(&self) -> bool {
        self.mem_map_handle != 0
    }

    pub fn payload_address(&self) -> u64 {
        join_addr(self.payload_address_lsw, self.payload_address_msw)
    }
}

impl WireFormat for ApmCmdHeader {
    const SIZE: usize = 16;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.payload_address_lsw)?;
        w.put_u32(self.payload_address_msw)?;
        w.put_u32(self.mem_map_handle)?;
        w.put_u32(self.payload_size)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            payload_address_lsw: r.get_u32()?,
            payload_address_msw: r.get_u32()?,
            mem_map_handle: r.get_u32()?,
            payload_size: r.get_u32()?,
        })
    }
}

/// Per-parameter header inside a set/get configuration payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleParamData {
    pub module_instance_id: u32,
    pub param_id: u32,
    pub param_size: u32,
    pub error_code: u32,
}

impl WireFormat for ModuleParamData {
    const SIZE: usize = 16;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.module_instance_id)?;
        w.put_u32(self.param_id)?;
        w.put_u32(self.param_size)?;
        w.put_u32(self.error_code)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            module_instance_id: r.get_u32()?,
            param_id: r.get_u32()?,
            param_size: r.get_u32()?,
            error_code: r.get_u32()?,
        })
    }
}

/// Event (de)registration entry for `APM_CMD_REGISTER_MODULE_EVENTS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleRegisterEvent {
    pub module_instance_id: u32,
    pub event_id: u32,
    pub is_register: u32,
    pub error_code: u32,
    pub event_config_payload_size: u32,
    pub reserved: u32,
}

impl WireFormat for ModuleRegisterEvent {
    const SIZE: usize = 24;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.module_instance_id)?;
        w.put_u32(self.event_id)?;
        w.put_u32(self.is_register)?;
        w.put_u32(self.error_code)?;
        w.put_u32(self.event_config_payload_size)?;
        w.put_u32(self.reserved)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            module_instance_id: r.get_u32()?,
            event_id: r.get_u32()?,
            is_register: r.get_u32()?,
            error_code: r.get_u32()?,
            event_config_payload_size: r.get_u32()?,
            reserved: r.get_u32()?,
        })
    }
}

/// `PARAM_ID_DLS_BUFFER_CONFIG` payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlsBufferConfig {
    pub buf_start_addr_lsw: u32,
    pub buf_start_addr_msw: u32,
    pub mem_map_handle: u32,
    pub max_log_pkt_size: u32,
    pub total_buf_size: u32,
}

impl DlsBufferConfig {
    pub fn new(start_addr: u64, mem_map_handle: u32, max_log_pkt_size: u32, total_buf_size: u32) -> Self {
        let (lsw, msw) = split_addr(start_addr);
        Self {
            buf_start_addr_lsw: lsw,
            buf_start_addr_msw: msw,
            mem_map_handle,
            max_log_pkt_size,
            total_buf_size,
        }
    }

    pub fn start_addr(&self) -> u64 {
        join_addr(self.buf_start_addr_lsw, self.buf_start_addr_msw)
    }
}

impl WireFormat for DlsBufferConfig {
    const SIZE: usize = 20;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.buf_start_addr_lsw)?;
        w.put_u32(self.buf_start_addr_msw)?;
        w.put_u32(self.mem_map_handle)?;
        w.put_u32(self.max_log_pkt_size)?;
        w.put_u32(self.total_buf_size)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            buf_start_addr_lsw: r.get_u32()?,
            buf_start_addr_msw: r.get_u32()?,
            mem_map_handle: r.get_u32()?,
            max_log_pkt_size: r.get_u32()?,
            total_buf_size: r.get_u32()?,
        })
    }
}

/// Log-code list for the enable/disable parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlsLogCode {
    pub num_log_codes: u32,
    pub log_code: u32,
}

impl DlsLogCode {
    pub fn single(log_code: u32) -> Self {
        Self {
            num_log_codes: 1,
            log_code,
        }
    }
}

impl WireFormat for DlsLogCode {
    const SIZE: usize = 8;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.num_log_codes)?;
        w.put_u32(self.log_code)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            num_log_codes: r.get_u32()?,
            log_code: r.get_u32()?,
        })
    }
}

/// One returned buffer in `DLS_DATA_CMD_BUFFER_RETURN`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlsBufferEntry {
    pub buf_addr_lsw: u32,
    pub buf_addr_msw: u32,
    pub mem_map_handle: u32,
}

impl DlsBufferEntry {
    pub fn new(remote_addr: u64, mem_map_handle: u32) -> Self {
        let (lsw, msw) = split_addr(remote_addr);
        Self {
            buf_addr_lsw: lsw,
            buf_addr_msw: msw,
            mem_map_handle,
        }
    }

    pub fn addr(&self) -> u64 {
        join_addr(self.buf_addr_lsw, self.buf_addr_msw)
    }
}

impl WireFormat for DlsBufferEntry {
    const SIZE: usize = 12;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.buf_addr_lsw)?;
        w.put_u32(self.buf_addr_msw)?;
        w.put_u32(self.mem_map_handle)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            buf_addr_lsw: r.get_u32()?,
            buf_addr_msw: r.get_u32()?,
            mem_map_handle: r.get_u32()?,
        })
    }
}

/// `DLS_DATA_CMD_BUFFER_RETURN` payload: count followed by entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlsBufferReturn {
    pub entries: Vec<DlsBufferEntry>,
}

impl DlsBufferReturn {
    /// Encoded size for `n` entries
    pub fn encoded_size(n: usize) -> usize {
        4 + n * DlsBufferEntry::SIZE
    }

    pub fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.entries.len() as u32)?;
        for entry in &self.entries {
            entry.encode(w)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let num_bufs = r.get_u32()? as usize;
        if num_bufs * DlsBufferEntry::SIZE > r.remaining() {
            return Err(GslError::bad_parameter(
                "num_bufs",
                format!("{} entries do not fit the payload", num_bufs),
            ));
        }
        let entries = (0..num_bufs)
            .map(|_| DlsBufferEntry::decode(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }
}

/// `GPR_IBASIC_RSP_RESULT` payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicRsp {
    pub opcode: u32,
    pub status: u32,
}

impl WireFormat for BasicRsp {
    const SIZE: usize = 8;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.opcode)?;
        w.put_u32(self.status)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            opcode: r.get_u32()?,
            status: r.get_u32()?,
        })
    }
}

/// Header of an `APM_EVENT_MODULE_TO_CLIENT` payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleEvent {
    pub event_id: u32,
    pub event_payload_size: u32,
}

impl WireFormat for ModuleEvent {
    const SIZE: usize = 8;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(self.event_id)?;
        w.put_u32(self.event_payload_size)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            event_id: r.get_u32()?,
            event_payload_size: r.get_u32()?,
        })
    }
}

/// One region of an `APM_CMD_SHARED_MEM_MAP_REGIONS` request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedMemMapRegion {
    pub mem_pool_id: u16,
    pub property_flag: u32,
    pub shm_addr_lsw: u32,
    pub shm_addr_msw: u32,
    pub mem_size_bytes: u32,
}

impl SharedMemMapRegion {
    pub fn addr(&self) -> u64 {
        join_addr(self.shm_addr_lsw, self.shm_addr_msw)
    }
}

impl WireFormat for SharedMemMapRegion {
    // mem_pool_id, num_regions, property_flag, then one region
    const SIZE: usize = 20;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u16(self.mem_pool_id)?;
        w.put_u16(1)?;
        w.put_u32(self.property_flag)?;
        w.put_u32(self.shm_addr_lsw)?;
        w.put_u32(self.shm_addr_msw)?;
        w.put_u32(self.mem_size_bytes)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let mem_pool_id = r.get_u16()?;
        let num_regions = r.get_u16()?;
        if num_regions != 1 {
            return Err(GslError::unsupported(format!(
                "memory map with {} regions",
                num_regions
            )));
        }
        Ok(Self {
            mem_pool_id,
            property_flag: r.get_u32()?,
            shm_addr_lsw: r.get_u32()?,
            shm_addr_msw: r.get_u32()?,
            mem_size_bytes: r.get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_split() {
        let (lsw, msw) = split_addr(0x0000_0012_8000_1000);
        assert_eq!(lsw, 0x8000_1000);
        assert_eq!(msw, 0x12);
        assert_eq!(join_addr(lsw, msw), 0x0000_0012_8000_1000);
    }

    #[test]
    fn test_cmd_header_layout() {
        let header = ApmCmdHeader::out_of_band(0x1_0000_2000, 7, 64);
        let mut buf = [0u8; ApmCmdHeader::SIZE];
        header.encode(&mut WireWriter::new(&mut buf)).unwrap();
        assert_eq!(&buf[0..4], &0x2000u32.to_le_bytes());
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        assert_eq!(&buf[8..12], &7u32.to_le_bytes());
        assert_eq!(&buf[12..16], &64u32.to_le_bytes());
        assert!(header.is_out_of_band());
        assert!(!ApmCmdHeader::in_band(64).is_out_of_band());
    }

    #[test]
    fn test_writer_overflow() {
        let mut buf = [0u8; 6];
        let mut w = WireWriter::new(&mut buf);
        w.put_u32(1).unwrap();
        assert!(w.put_u32(2).is_err());
        assert_eq!(w.position(), 4);
    }

    #[test]
    fn test_buffer_return_rejects_short_payload() {
        let mut buf = vec![0u8; 4 + DlsBufferEntry::SIZE];
        buf[0..4].copy_from_slice(&3u32.to_le_bytes());
        assert!(DlsBufferReturn::decode(&mut WireReader::new(&buf)).is_err());
    }
}
