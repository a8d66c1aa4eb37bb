//! Codec, framing and serial-link errors.
//!
//! [`EncodingError`] is raised before any I/O when a caller hands the codec a
//! parameter it cannot represent. [`FramingError`] describes a receive-side
//! packet that failed validation; the decoder resynchronizes past it and the
//! transport only counts occurrences. [`LinkError`] is what callers of the
//! transport handler and the connection manager see.

use crate::common::{ErrorCategory, ErrorSeverity};

/// A command parameter or payload that cannot be encoded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodingError {
    /// Numeric parameter outside its declared range
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        /// Parameter name
        field: String,
        /// Rejected value
        value: String,
        /// Lower bound
        min: String,
        /// Upper bound
        max: String,
    },

    /// Payload longer than one frame can carry
    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge {
        /// Requested payload length
        len: usize,
        /// Maximum payload length
        max: usize,
    },

    /// Parameter of the wrong kind for its field
    #[error("{field} expects a {expected} value")]
    TypeMismatch {
        /// Parameter name
        field: String,
        /// Expected kind
        expected: String,
    },

    /// Wrong number of parameters for a command
    #[error("command takes {expected} parameter(s), got {actual}")]
    ArityMismatch {
        /// Declared parameter count
        expected: usize,
        /// Supplied parameter count
        actual: usize,
    },

    /// Setting cannot be written
    #[error("{field} is read-only")]
    ReadOnly {
        /// Setting name
        field: String,
    },

    /// No catalog entry with this name for the role
    #[error("{role} has no setting named {name}")]
    UnknownSetting {
        /// Role name
        role: String,
        /// Setting name
        name: String,
    },

    /// Role has no serial address
    #[error("role {role} has no serial address")]
    NoAddress {
        /// Role name
        role: String,
    },
}

impl EncodingError {
    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Warning
    }

    /// Create an out-of-range error.
    pub fn out_of_range<T: ToString>(field: impl Into<String>, value: T, min: T, max: T) -> Self {
        EncodingError::OutOfRange {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    /// Create a type mismatch error.
    pub fn type_mismatch(field: impl Into<String>, expected: impl Into<String>) -> Self {
        EncodingError::TypeMismatch {
            field: field.into(),
            expected: expected.into(),
        }
    }

    /// Create a read-only error.
    pub fn read_only(field: impl Into<String>) -> Self {
        EncodingError::ReadOnly {
            field: field.into(),
        }
    }
}

/// A received packet that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// Declared payload length above the frame limit
    #[error("declared length {declared} exceeds maximum {max}")]
    LengthOutOfRange {
        /// Length byte as received
        declared: u8,
        /// Maximum payload length
        max: u8,
    },

    /// Transmitted checksum differs from the computed one
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes
        expected: u8,
        /// Checksum byte as received
        actual: u8,
    },

    /// Declared length runs past a complete frame that follows it
    #[error("declared length {declared} overruns the frame at offset {next_frame_at}")]
    Truncated {
        /// Length byte as received
        declared: u8,
        /// Offset of the next valid frame
        next_frame_at: usize,
    },

    /// Bytes before the next start marker
    #[error("{skipped} byte(s) of noise before start marker")]
    Noise {
        /// Bytes skipped
        skipped: usize,
    },
}

impl FramingError {
    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Info
    }
}

/// Serial link, routing and identification errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    /// Command rejected before any I/O
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Framing failure rate crossed the configured threshold
    #[error("{count} framing errors on {endpoint} within {window_ms}ms")]
    FramingRate {
        /// Endpoint identifier
        endpoint: String,
        /// Errors counted in the window
        count: usize,
        /// Window length in milliseconds
        window_ms: u64,
    },

    /// An awaited response did not arrive in time
    #[error("no response from {device} within {timeout_ms}ms")]
    Timeout {
        /// Device or role identifier
        device: String,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Read or write failure on the underlying stream
    #[error("stream error on {endpoint}: {message}")]
    Stream {
        /// Endpoint identifier
        endpoint: String,
        /// Error message
        message: String,
    },

    /// Routing attempted against a role that is not connected
    #[error("no connected device for role {role}")]
    DeviceUnavailable {
        /// Role name
        role: String,
    },

    /// Two endpoints reported the same identification token
    #[error("identification token {token:#04x} reported by {endpoints:?}")]
    IdentificationConflict {
        /// Duplicate token
        token: u8,
        /// Endpoints that reported it
        endpoints: Vec<String>,
    },

    /// Device answered with a non-zero status byte
    #[error("device rejected command {command:#04x} with status {status:#04x}")]
    Rejected {
        /// Command identifier
        command: u8,
        /// Status code from the device
        status: u8,
    },

    /// Transport handler shut down before the request completed
    #[error("transport closed")]
    Closed,
}

impl LinkError {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            LinkError::Encoding(_) | LinkError::FramingRate { .. } => ErrorCategory::Protocol,
            LinkError::DeviceUnavailable { .. } => ErrorCategory::Routing,
            LinkError::IdentificationConflict { .. } => ErrorCategory::Config,
            LinkError::Timeout { .. }
            | LinkError::Stream { .. }
            | LinkError::Rejected { .. }
            | LinkError::Closed => ErrorCategory::Link,
        }
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            LinkError::Encoding(e) => e.severity(),
            LinkError::FramingRate { .. } | LinkError::Timeout { .. } => ErrorSeverity::Warning,
            LinkError::Rejected { .. }
            | LinkError::DeviceUnavailable { .. }
            | LinkError::IdentificationConflict { .. }
            | LinkError::Closed => ErrorSeverity::Error,
            LinkError::Stream { .. } => ErrorSeverity::Critical,
        }
    }

    /// Check if the error is fatal to the owning device handle.
    pub fn is_device_fatal(&self) -> bool {
        matches!(self, LinkError::Stream { .. })
    }

    /// Check if retrying the operation might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout { .. } | LinkError::DeviceUnavailable { .. }
        )
    }

    /// Create a timeout error.
    pub fn timeout(device: impl Into<String>, timeout_ms: u64) -> Self {
        LinkError::Timeout {
            device: device.into(),
            timeout_ms,
        }
    }

    /// Create a stream error.
    pub fn stream(endpoint: impl Into<String>, message: impl ToString) -> Self {
        LinkError::Stream {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Create a device-unavailable error.
    pub fn device_unavailable(role: impl ToString) -> Self {
        LinkError::DeviceUnavailable {
            role: role.to_string(),
        }
    }
}
