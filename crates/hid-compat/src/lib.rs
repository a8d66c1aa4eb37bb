//! HID compatibility shim.
//!
//! Peripherals that do not speak the serial protocol (standalone pedals,
//! handbrakes, shifters, hubs, or any third-party controller) are read as
//! raw HID input reports. Each report is decoded against a [`ReportLayout`]
//! into a [`DeviceEvent`] of normalized axis values and button edges, which
//! the [`HidShim`] publishes to an [`HidEventSink`] and forwards to a
//! virtual input device with a fixed, game-friendly layout.
//!
//! Whether a peripheral gets a virtual device is decided from its report
//! descriptor ([`needs_detection_fix`]), not from a device list.

pub mod blip;
pub mod compat;
pub mod config;
pub mod decode;
pub mod detection;
pub mod ids;
pub mod layout;
pub mod rate;
pub mod shim;
pub mod virtual_device;

pub use blip::{BlipConfig, BlipUpdate};
pub use compat::{CompatConfig, TurnSignalMode, WiperMode};
pub use config::HidShimConfig;
pub use decode::{AxisSample, ButtonEdge, DeviceEvent, InputDecoder};
pub use detection::{DetectionIssue, detection_issues, needs_detection_fix};
pub use ids::{MOZA_VENDOR_ID, MozaModel, identify_model};
pub use layout::{Axis, ReportLayout};
pub use rate::UpdateRateLimiter;
pub use shim::{HidEvent, HidEventSink, HidShim, resolve_layout};
pub use virtual_device::{
    VirtualDevice, VirtualDeviceFactory, VirtualEvent, VirtualInputDescriptor, VirtualInputSink,
    create_virtual_device, platform_factory,
};

use openracing_errors::DeviceError;
use openracing_hid_common::HidCommonError;

/// Maps a HID transport failure onto the device error taxonomy.
pub fn device_error(device: &str, err: HidCommonError) -> DeviceError {
    match err {
        HidCommonError::DeviceNotFound(_) => DeviceError::not_found(device),
        HidCommonError::Disconnected => DeviceError::disconnected(device),
        HidCommonError::OpenError(msg) if msg.contains("permission denied") => {
            DeviceError::PermissionDenied(device.to_string())
        }
        HidCommonError::InvalidDescriptor(msg) => {
            DeviceError::UnsupportedLayout(format!("{device}: {msg}"))
        }
        other => DeviceError::HidError(format!("{device}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hid_errors_map_onto_device_errors() {
        assert!(matches!(
            device_error("p", HidCommonError::Disconnected),
            DeviceError::Disconnected(_)
        ));
        assert!(matches!(
            device_error("p", HidCommonError::OpenError("p: permission denied (x)".into())),
            DeviceError::PermissionDenied(_)
        ));
        assert!(matches!(
            device_error("p", HidCommonError::ReadError("boom".into())),
            DeviceError::HidError(_)
        ));
    }
}
