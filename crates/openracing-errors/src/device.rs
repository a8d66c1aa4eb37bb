//! HID peripheral and virtual input device errors.

use crate::common::ErrorSeverity;

/// HID peripheral errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    /// Device not found
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Device disconnected
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// HID error
    #[error("HID error: {0}")]
    HidError(String),

    /// Permission denied
    #[error("Permission denied for device: {0}")]
    PermissionDenied(String),

    /// Report shorter than the layout requires
    #[error("Report from {device} too short: expected {expected} bytes, got {actual}")]
    ShortReport {
        /// Device identifier
        device: String,
        /// Minimum report length
        expected: usize,
        /// Actual report length
        actual: usize,
    },

    /// No layout could be derived for the peripheral
    #[error("No usable input layout for device {0}")]
    UnsupportedLayout(String),

    /// Creating or writing the virtual input device failed
    #[error("Virtual input device {device}: {message}")]
    VirtualDevice {
        /// Virtual device name
        device: String,
        /// Error message
        message: String,
    },

    /// A setting was given a value outside its range
    #[error("{field} = {value} is outside {min}..={max}")]
    InvalidSetting {
        /// Setting name
        field: &'static str,
        /// Rejected value
        value: u32,
        /// Lower bound
        min: u32,
        /// Upper bound
        max: u32,
    },
}

impl DeviceError {
    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DeviceError::Disconnected(_) => ErrorSeverity::Critical,
            DeviceError::ShortReport { .. } | DeviceError::InvalidSetting { .. } => {
                ErrorSeverity::Warning
            }
            DeviceError::NotFound(_)
            | DeviceError::HidError(_)
            | DeviceError::PermissionDenied(_)
            | DeviceError::UnsupportedLayout(_)
            | DeviceError::VirtualDevice { .. } => ErrorSeverity::Error,
        }
    }

    /// Check if this error indicates the device is unavailable.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(
            self,
            DeviceError::NotFound(_)
                | DeviceError::Disconnected(_)
                | DeviceError::PermissionDenied(_)
        )
    }

    /// Create a not found error.
    pub fn not_found(device: impl Into<String>) -> Self {
        DeviceError::NotFound(device.into())
    }

    /// Create a disconnected error.
    pub fn disconnected(device: impl Into<String>) -> Self {
        DeviceError::Disconnected(device.into())
    }

    /// Create a virtual device error.
    pub fn virtual_device(device: impl Into<String>, message: impl ToString) -> Self {
        DeviceError::VirtualDevice {
            device: device.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_severity() {
        assert_eq!(
            DeviceError::disconnected("hbp").severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            DeviceError::virtual_device("wheeld pedals", "uinput busy").severity(),
            ErrorSeverity::Error
        );
    }

    #[test]
    fn test_device_error_is_device_unavailable() {
        assert!(DeviceError::not_found("srp").is_device_unavailable());
        assert!(!DeviceError::UnsupportedLayout("srp".into()).is_device_unavailable());
    }
}
