//! Shared log buffer layout
//!
//! The pool is `buffer_count` buffers of `buffer_size` bytes each. Every
//! buffer starts with an 8-byte header `{state: u32, size: u32}`
//! (little-endian) followed by the log payload. The DSP flips `state` to
//! READY after filling a buffer; the host resets it when handing the
//! buffer back.

use std::{marker::PhantomData, ptr::NonNull};

use crate::{
    config::DLS_LOG_BUFFER_HEADER_SIZE,
    error::{GslError, Result},
    shmem::Allocation,
};

use super::config::BufferPoolConfig;

/// Raw header value of a filled buffer
pub const LOG_BUFFER_READY: u32 = 1;
/// Raw header value of a buffer owned by the DSP
pub const LOG_BUFFER_NOT_READY: u32 = 0;

/// Ownership state carried in a buffer header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    NotReady,
    Ready,
}

impl BufferState {
    pub fn from_raw(raw: u32) -> Self {
        if raw == LOG_BUFFER_READY {
            Self::Ready
        } else {
            Self::NotReady
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Ready => LOG_BUFFER_READY,
            Self::NotReady => LOG_BUFFER_NOT_READY,
        }
    }
}

/// Decoded buffer header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBufferHeader {
    pub state: BufferState,
    /// Bytes of log data the DSP wrote after the header
    pub size: u32,
}

/// Bounds-checked view over `count` buffers of `stride` bytes
///
/// Header accesses are volatile because the DSP writes them concurrently.
#[derive(Debug, Clone, Copy)]
pub struct LogBufferRing<'a> {
    base: NonNull<u8>,
    stride: usize,
    count: usize,
    _memory: PhantomData<&'a [u8]>,
}

unsafe impl Send for LogBufferRing<'_> {}
unsafe impl Sync for LogBufferRing<'_> {}

impl<'a> LogBufferRing<'a> {
    /// View the pool held in `alloc`
    pub fn new(alloc: &'a Allocation, config: &BufferPoolConfig) -> Result<Self> {
        if alloc.len() < config.total_size() {
            return Err(GslError::bad_parameter(
                "alloc",
                format!(
                    "{} bytes cannot hold a {} byte pool",
                    alloc.len(),
                    config.total_size()
                ),
            ));
        }
        // Safety: the allocation outlives 'a and covers the whole pool
        unsafe {
            Self::from_raw_parts(
                NonNull::new_unchecked(alloc.as_ptr()),
                config.buffer_size as usize,
                config.buffer_count as usize,
            )
        }
    }

    /// View memory located by other means
    ///
    /// # Safety
    /// `base` must be valid for reads and writes of `stride * count` bytes
    /// for `'a` and aligned to 4 bytes.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, stride: usize, count: usize) -> Result<Self> {
        if stride <= DLS_LOG_BUFFER_HEADER_SIZE || stride % 4 != 0 {
            return Err(GslError::bad_parameter(
                "stride",
                format!("{} cannot hold a log buffer", stride),
            ));
        }
        Ok(Self {
            base,
            stride,
            count,
            _memory: PhantomData,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Payload bytes per buffer
    pub fn capacity(&self) -> usize {
        self.stride - DLS_LOG_BUFFER_HEADER_SIZE
    }

    /// Byte offset of buffer `index` from the pool base
    pub fn offset_of(&self, index: usize) -> Result<usize> {
        if index >= self.count {
            return Err(GslError::out_of_range(index, self.count));
        }
        Ok(index * self.stride)
    }

    fn header_ptr(&self, index: usize) -> Result<*mut u32> {
        let offset = self.offset_of(index)?;
        Ok(unsafe { self.base.as_ptr().add(offset) } as *mut u32)
    }

    pub fn header(&self, index: usize) -> Result<LogBufferHeader> {
        let ptr = self.header_ptr(index)?;
        let (state, size) = unsafe {
            (
                u32::from_le(ptr.read_volatile()),
                u32::from_le(ptr.add(1).read_volatile()),
            )
        };
        Ok(LogBufferHeader {
            state: BufferState::from_raw(state),
            size,
        })
    }

    pub fn write_header(&self, index: usize, header: LogBufferHeader) -> Result<()> {
        let ptr = self.header_ptr(index)?;
        unsafe {
            ptr.add(1).write_volatile(header.size.to_le());
            ptr.write_volatile(header.state.raw().to_le());
        }
        Ok(())
    }

    /// Mark buffer `index` as owned by the DSP
    pub fn reset(&self, index: usize) -> Result<()> {
        self.write_header(
            index,
            LogBufferHeader {
                state: BufferState::NotReady,
                size: 0,
            },
        )
    }

    pub fn reset_all(&self) {
        for index in 0..self.count {
            // Cannot fail: index < count
            let _ = self.reset(index);
        }
    }

    /// Indices whose header reads READY, ascending
    pub fn ready_indices(&self) -> Vec<u32> {
        (0..self.count)
            .filter(|i| {
                self.header(*i)
                    .map_or(false, |h| h.state == BufferState::Ready)
            })
            .map(|i| i as u32)
            .collect()
    }

    /// Start of the payload area of buffer `index`
    pub fn payload_ptr(&self, index: usize) -> Result<NonNull<u8>> {
        let offset = self.offset_of(index)? + DLS_LOG_BUFFER_HEADER_SIZE;
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// Payload area of buffer `index`
    pub fn payload(&self, index: usize) -> Result<&'a [u8]> {
        let ptr = self.payload_ptr(index)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.capacity()) })
    }

    /// Copy `data` into buffer `index` and publish it as READY
    ///
    /// Data beyond the buffer capacity is dropped; returns the bytes kept.
    pub fn fill(&self, index: usize, data: &[u8]) -> Result<usize> {
        let ptr = self.payload_ptr(index)?;
        let len = data.len().min(self.capacity());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), len) };
        self.write_header(
            index,
            LogBufferHeader {
                state: BufferState::Ready,
                size: len as u32,
            },
        )?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(memory: &mut [u32], stride: usize) -> LogBufferRing<'_> {
        let count = memory.len() * 4 / stride;
        let base = NonNull::new(memory.as_mut_ptr() as *mut u8).unwrap();
        unsafe { LogBufferRing::from_raw_parts(base, stride, count).unwrap() }
    }

    #[test]
    fn test_ready_scan_in_order() {
        let mut memory = vec![0u32; 4 * 2048 / 4];
        let ring = ring(&mut memory, 2048);

        assert!(ring.ready_indices().is_empty());
        ring.fill(3, b"late").unwrap();
        ring.fill(1, b"early").unwrap();
        assert_eq!(ring.ready_indices(), vec![1, 3]);

        ring.reset(1).unwrap();
        assert_eq!(ring.ready_indices(), vec![3]);
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let mut memory = vec![0u32; 2 * 2048 / 4];
        {
            let ring = ring(&mut memory, 2048);
            ring.fill(1, &[0xAA; 10]).unwrap();
        }
        let words = 2048 / 4;
        assert_eq!(u32::from_le(memory[words]), LOG_BUFFER_READY);
        assert_eq!(u32::from_le(memory[words + 1]), 10);
    }

    #[test]
    fn test_bounds() {
        let mut memory = vec![0u32; 2 * 2048 / 4];
        let ring = ring(&mut memory, 2048);

        assert!(matches!(ring.header(2), Err(GslError::OutOfRange { .. })));
        assert!(ring.payload(2).is_err());
        assert_eq!(ring.offset_of(1).unwrap(), 2048);
        assert_eq!(ring.payload(0).unwrap().len(), 2040);
    }

    #[test]
    fn test_fill_truncates() {
        let mut memory = vec![0u32; 2048 / 4];
        let ring = ring(&mut memory, 2048);
        assert_eq!(ring.fill(0, &[1u8; 4096]).unwrap(), 2040);
        assert_eq!(ring.header(0).unwrap().size, 2040);
    }
}
