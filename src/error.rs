//! Error types and handling for the GSL host layer

use crate::domain::DomainId;

/// Result type alias for GSL host operations
pub type Result<T> = std::result::Result<T, GslError>;

/// AR status codes shared with the DSP
pub mod status {
    pub const AR_EOK: u32 = 0;
    pub const AR_EFAILED: u32 = 1;
    pub const AR_EBADPARAM: u32 = 2;
    pub const AR_EUNSUPPORTED: u32 = 3;
    pub const AR_ENORESOURCE: u32 = 7;
    pub const AR_EHANDLE: u32 = 8;
    pub const AR_ENOTREADY: u32 = 10;
    pub const AR_EBUSY: u32 = 12;
    pub const AR_ENOMEMORY: u32 = 18;
    pub const AR_ENOTEXIST: u32 = 19;
    pub const AR_ETIMEOUT: u32 = 21;
    pub const AR_ESUBSYSRESET: u32 = 23;
}

/// Error taxonomy for the pool manager, message builder and log client
#[derive(Debug, thiserror::Error)]
pub enum GslError {
    /// Null/missing argument, out-of-range configuration or index
    #[error("Invalid parameter: {parameter} - {message}")]
    BadParameter { parameter: String, message: String },

    /// Operation attempted before the session was configured
    #[error("Not ready: {operation}")]
    NotReady { operation: String },

    /// Index beyond the configured bound
    #[error("Index {index} out of range (bound {bound})")]
    OutOfRange { index: usize, bound: usize },

    /// Optional feature not available on this build or platform
    #[error("Unsupported: {feature}")]
    Unsupported { feature: String },

    /// The packet router refused or failed a request
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The remote side answered a command with a failure status
    #[error("Remote failure: opcode {opcode:#010x} returned status {status:#x}")]
    Remote { opcode: u32, status: u32 },

    /// Allocation or mapping could not be satisfied
    #[error("Resource error: {message}")]
    Resource { message: String },

    /// The domain is flagged as undergoing a subsystem restart
    #[error("Domain {domain} is down (subsystem restart)")]
    DomainDown { domain: DomainId },

    /// A handle that is no longer outstanding was released again
    #[error("Double free of pool handle {handle}")]
    DoubleFree { handle: u64 },

    /// A resource is still in use
    #[error("Busy: {message}")]
    Busy { message: String },

    /// No response arrived for a command in time
    #[error("Timed out waiting for response to token {token:#x}")]
    Timeout { token: u32 },

    /// I/O related errors (memfd, files, mmap)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl GslError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a bad parameter error
    pub fn bad_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a not-ready error
    pub fn not_ready(operation: impl Into<String>) -> Self {
        Self::NotReady {
            operation: operation.into(),
        }
    }

    /// Create an out-of-range error
    pub fn out_of_range(index: usize, bound: usize) -> Self {
        Self::OutOfRange { index, bound }
    }

    /// Create an unsupported-feature error
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a resource error
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// Create a busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// AR status code equivalent of this error
    pub fn status(&self) -> u32 {
        match self {
            GslError::BadParameter { .. } => status::AR_EBADPARAM,
            GslError::NotReady { .. } => status::AR_ENOTREADY,
            GslError::OutOfRange { .. } => status::AR_ENOTEXIST,
            GslError::Unsupported { .. } => status::AR_EUNSUPPORTED,
            GslError::Transport { .. } => status::AR_EFAILED,
            GslError::Remote { status, .. } => *status,
            GslError::Resource { .. } => status::AR_ENOMEMORY,
            GslError::DomainDown { .. } => status::AR_ESUBSYSRESET,
            GslError::DoubleFree { .. } => status::AR_EHANDLE,
            GslError::Busy { .. } => status::AR_EBUSY,
            GslError::Timeout { .. } => status::AR_ETIMEOUT,
            GslError::Io { .. } => status::AR_ENORESOURCE,
            GslError::Platform { .. } => status::AR_EFAILED,
        }
    }
}

impl From<std::io::Error> for GslError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}
