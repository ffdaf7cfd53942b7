//! Log buffer pool and client configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    apm::DLS_MODULE_INSTANCE_ID,
    config::{
        DLS_CLIENT_PORT, DLS_LOG_BUFFER_HEADER_SIZE, DLS_MAX_BUFFER_COUNT, DLS_MAX_BUFFER_SIZE,
        DLS_MIN_BUFFER_COUNT, DLS_MIN_BUFFER_SIZE,
    },
    domain::DomainId,
    error::{GslError, Result},
};

/// Geometry of the shared log buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Size of each buffer in bytes, header included
    pub buffer_size: u32,
    /// Number of buffers in the pool
    pub buffer_count: u32,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            buffer_count: 16,
        }
    }
}

impl BufferPoolConfig {
    pub fn new(buffer_size: u32, buffer_count: u32) -> Self {
        Self {
            buffer_size,
            buffer_count,
        }
    }

    /// Set buffer size
    pub fn with_buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set buffer count
    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Validate against the geometry the DSP accepts
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < DLS_MIN_BUFFER_COUNT || self.buffer_count > DLS_MAX_BUFFER_COUNT {
            return Err(GslError::bad_parameter(
                "buffer_count",
                format!(
                    "{} outside [{}, {}]",
                    self.buffer_count, DLS_MIN_BUFFER_COUNT, DLS_MAX_BUFFER_COUNT
                ),
            ));
        }

        if !self.buffer_size.is_power_of_two()
            || self.buffer_size < DLS_MIN_BUFFER_SIZE
            || self.buffer_size > DLS_MAX_BUFFER_SIZE
        {
            return Err(GslError::bad_parameter(
                "buffer_size",
                format!(
                    "{} is not a power of two in [{}, {}]",
                    self.buffer_size, DLS_MIN_BUFFER_SIZE, DLS_MAX_BUFFER_SIZE
                ),
            ));
        }

        Ok(())
    }

    /// Bytes of shared memory the pool occupies
    pub fn total_size(&self) -> usize {
        self.buffer_size as usize * self.buffer_count as usize
    }

    /// Largest log packet one buffer can carry
    pub fn payload_capacity(&self) -> usize {
        self.buffer_size as usize - DLS_LOG_BUFFER_HEADER_SIZE
    }
}

/// Session-level options of the log client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlsClientOptions {
    /// Domain hosting the DLS module
    pub domain: DomainId,
    /// Local port the client receives responses and events on
    pub src_port: u32,
    /// Module instance id of DLS
    pub dls_instance_id: u32,
    /// Upper bound on waiting for a command response; `None` waits forever
    pub command_timeout: Option<Duration>,
}

impl Default for DlsClientOptions {
    fn default() -> Self {
        Self {
            domain: DomainId::ADSP,
            src_port: DLS_CLIENT_PORT,
            dls_instance_id: DLS_MODULE_INSTANCE_ID,
            command_timeout: None,
        }
    }
}

impl DlsClientOptions {
    pub fn with_domain(mut self, domain: DomainId) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_src_port(mut self, port: u32) -> Self {
        self.src_port = port;
        self
    }

    /// Set command timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        for size in [2048, 4096, 8192] {
            for count in [1, 4, 64] {
                assert!(BufferPoolConfig::new(size, count).validate().is_ok());
            }
        }
        for (size, count) in [(1024, 4), (16384, 4), (3000, 4), (4096, 0), (4096, 65)] {
            assert!(matches!(
                BufferPoolConfig::new(size, count).validate(),
                Err(GslError::BadParameter { .. })
            ));
        }
    }

    #[test]
    fn test_sizes() {
        let config = BufferPoolConfig::new(2048, 4);
        assert_eq!(config.total_size(), 8192);
        assert_eq!(config.payload_capacity(), 2040);
    }
}
