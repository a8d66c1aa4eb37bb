//! Common error types and utilities used across all crates.
//!
//! The umbrella error enum plus category and severity classification.

use core::fmt;

use crate::{DeviceError, EncodingError, FramingError, LinkError};

/// Top-level error type that can wrap all sub-errors.
#[derive(Debug, thiserror::Error)]
pub enum OpenRacingError {
    /// Command encoding errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Wire framing errors
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Serial link errors
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// HID peripheral errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl OpenRacingError {
    /// Get the error category for classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            OpenRacingError::Encoding(_) | OpenRacingError::Framing(_) => ErrorCategory::Protocol,
            OpenRacingError::Link(e) => e.category(),
            OpenRacingError::Device(_) => ErrorCategory::Device,
            OpenRacingError::Io(_) => ErrorCategory::IO,
            OpenRacingError::Config(_) => ErrorCategory::Config,
            OpenRacingError::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get the error severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            OpenRacingError::Encoding(e) => e.severity(),
            OpenRacingError::Framing(e) => e.severity(),
            OpenRacingError::Link(e) => e.severity(),
            OpenRacingError::Device(e) => e.severity(),
            OpenRacingError::Io(_) | OpenRacingError::Config(_) | OpenRacingError::Other(_) => {
                ErrorSeverity::Error
            }
        }
    }

    /// Check if this error is recoverable.
    pub fn is_recoverable(&self) -> bool {
        self.severity() < ErrorSeverity::Critical
    }

    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        OpenRacingError::Config(msg.into())
    }

    /// Create a generic error with a message.
    pub fn other(msg: impl Into<String>) -> Self {
        OpenRacingError::Other(msg.into())
    }
}

impl From<std::io::Error> for OpenRacingError {
    fn from(e: std::io::Error) -> Self {
        OpenRacingError::Io(e)
    }
}

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    /// Codec and framing errors
    Protocol = 0,
    /// Serial stream errors
    Link = 1,
    /// Routing against a device that is not connected
    Routing = 2,
    /// HID and virtual device errors
    Device = 3,
    /// Configuration errors
    Config = 4,
    /// I/O errors
    IO = 5,
    /// Other errors
    Other = 255,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Protocol => "Protocol",
            ErrorCategory::Link => "Link",
            ErrorCategory::Routing => "Routing",
            ErrorCategory::Device => "Device",
            ErrorCategory::Config => "Config",
            ErrorCategory::IO => "IO",
            ErrorCategory::Other => "Other",
        };
        f.write_str(name)
    }
}

/// Error severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ErrorSeverity {
    /// Informational, no action required
    Info = 0,
    /// Warning, may require attention
    Warning = 1,
    /// Error, operation failed
    Error = 2,
    /// Critical, the owning device handle is lost
    Critical = 3,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARN"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Protocol.to_string(), "Protocol");
        assert_eq!(ErrorCategory::Routing.to_string(), "Routing");
        assert_eq!(ErrorCategory::Device.to_string(), "Device");
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::Error);
        assert!(ErrorSeverity::Error > ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning > ErrorSeverity::Info);
    }

    #[test]
    fn test_category_follows_link_variant() {
        let err: OpenRacingError = LinkError::device_unavailable("pedals").into();
        assert_eq!(err.category(), ErrorCategory::Routing);

        let err: OpenRacingError = LinkError::stream("/dev/ttyACM0", "broken pipe").into();
        assert_eq!(err.category(), ErrorCategory::Link);
        assert!(!err.is_recoverable());
    }
}
