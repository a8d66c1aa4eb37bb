//! Snapshot tests for error message formatting.

use insta::assert_snapshot;
use openracing_errors::{
    device::DeviceError,
    link::{FramingError, LinkError},
};

#[test]
fn test_timeout_message() {
    assert_snapshot!(LinkError::timeout("wheelbase", 500).to_string(), @"no response from wheelbase within 500ms");
}

#[test]
fn test_device_unavailable_message() {
    assert_snapshot!(LinkError::device_unavailable("pedals").to_string(), @"no connected device for role pedals");
}

#[test]
fn test_checksum_mismatch_message() {
    let err = FramingError::ChecksumMismatch {
        expected: 0x0d,
        actual: 0xff,
    };
    assert_snapshot!(err.to_string(), @"checksum mismatch: expected 0x0d, got 0xff");
}

#[test]
fn test_short_report_message() {
    let err = DeviceError::ShortReport {
        device: "srp".into(),
        expected: 5,
        actual: 3,
    };
    assert_snapshot!(err.to_string(), @"Report from srp too short: expected 5 bytes, got 3");
}
