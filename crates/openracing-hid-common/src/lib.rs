//! Common HID plumbing shared by the compatibility shim and the service.
//!
//! * [`HidDevice`] / [`HidPort`]: blocking device and enumeration traits,
//!   with a `hidapi` backend ([`HidApiPort`]) and in-memory doubles in
//!   [`hid_traits::mock`].
//! * [`extract_bits`] / [`ReportBuilder`]: bit-field access to raw input
//!   reports and synthesis of test reports.
//! * [`parse_report_descriptor`]: turns a raw report descriptor into a
//!   [`ReportDescriptor`] listing every input field and its bit position.

#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::unwrap_used)]

pub mod descriptor;
pub mod device_info;
pub mod hid_traits;
pub mod hidapi_backend;
pub mod report_parser;

pub use descriptor::{ReportDescriptor, ReportField, parse_report_descriptor};
pub use device_info::*;
pub use hid_traits::*;
pub use hidapi_backend::HidApiPort;
pub use report_parser::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HidCommonError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenError(String),

    #[error("Failed to read from device: {0}")]
    ReadError(String),

    #[error("Failed to write to device: {0}")]
    WriteError(String),

    #[error("Invalid report descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Device disconnected")]
    Disconnected,
}

pub type HidCommonResult<T> = Result<T, HidCommonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        let err = HidCommonError::DeviceNotFound("test".to_string());
        assert_eq!(format!("{err}"), "Device not found: test");

        let err = HidCommonError::InvalidDescriptor("truncated item at 3".to_string());
        assert_eq!(
            format!("{err}"),
            "Invalid report descriptor: truncated item at 3"
        );
    }
}
