//! [`HidPort`] backed by the system HID stack through `hidapi`.

use std::ffi::CString;
use std::sync::Mutex;

use hidapi::{DeviceInfo, HidApi};
use tracing::debug;

use crate::{HidCommonError, HidCommonResult, HidDevice, HidDeviceInfo, HidPort};

/// Descriptors are capped at 4 KiB by the USB HID class.
const MAX_DESCRIPTOR_LEN: usize = 4096;
/// Largest input report read in one call.
const MAX_REPORT_LEN: usize = 64;

fn convert_info(d: &DeviceInfo) -> HidDeviceInfo {
    HidDeviceInfo {
        vendor_id: d.vendor_id(),
        product_id: d.product_id(),
        serial_number: d.serial_number().map(str::to_string),
        manufacturer: d.manufacturer_string().map(str::to_string),
        product_name: d.product_string().map(str::to_string),
        usage_page: Some(d.usage_page()),
        usage: Some(d.usage()),
        interface_number: Some(d.interface_number()),
        path: d.path().to_string_lossy().to_string(),
    }
}

pub struct HidApiPort {
    api: Mutex<HidApi>,
    vendor_filter: Option<u16>,
}

impl HidApiPort {
    pub fn new() -> HidCommonResult<Self> {
        let api = HidApi::new().map_err(|e| HidCommonError::OpenError(e.to_string()))?;
        Ok(Self {
            api: Mutex::new(api),
            vendor_filter: None,
        })
    }

    /// Only enumerate devices from `vendor_id`.
    pub fn with_vendor_filter(mut self, vendor_id: u16) -> Self {
        self.vendor_filter = Some(vendor_id);
        self
    }
}

impl HidPort for HidApiPort {
    fn list_devices(&self) -> HidCommonResult<Vec<HidDeviceInfo>> {
        let api = self.api.lock().unwrap_or_else(|e| e.into_inner());
        Ok(api
            .device_list()
            .filter(|d| self.vendor_filter.is_none_or(|vid| d.vendor_id() == vid))
            .map(convert_info)
            .collect())
    }

    fn open_device(&self, path: &str) -> HidCommonResult<Box<dyn HidDevice>> {
        let api = self.api.lock().unwrap_or_else(|e| e.into_inner());
        let info = api
            .device_list()
            .find(|d| d.path().to_string_lossy() == path)
            .map(convert_info)
            .ok_or_else(|| HidCommonError::DeviceNotFound(path.to_string()))?;
        let c_path =
            CString::new(path).map_err(|e| HidCommonError::OpenError(format!("{path}: {e}")))?;
        let device = api.open_path(&c_path).map_err(|e| {
            let message = e.to_string();
            if message.to_ascii_lowercase().contains("permission") {
                HidCommonError::OpenError(format!("{path}: permission denied ({message})"))
            } else {
                HidCommonError::OpenError(format!("{path}: {message}"))
            }
        })?;
        debug!(path, name = %info.display_name(), "opened HID device");
        Ok(Box::new(HidApiDevice {
            device,
            info,
            connected: true,
        }))
    }

    fn refresh(&self) -> HidCommonResult<()> {
        let mut api = self.api.lock().unwrap_or_else(|e| e.into_inner());
        api.refresh_devices()
            .map_err(|e| HidCommonError::ReadError(e.to_string()))
    }
}

struct HidApiDevice {
    device: hidapi::HidDevice,
    info: HidDeviceInfo,
    connected: bool,
}

impl HidDevice for HidApiDevice {
    fn write_report(&mut self, data: &[u8]) -> HidCommonResult<usize> {
        self.device.write(data).map_err(|e| {
            self.connected = false;
            HidCommonError::WriteError(e.to_string())
        })
    }

    fn read_report(&mut self, timeout_ms: i32) -> HidCommonResult<Option<Vec<u8>>> {
        let mut buf = [0u8; MAX_REPORT_LEN];
        match self.device.read_timeout(&mut buf, timeout_ms) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(buf.get(..n).map(<[u8]>::to_vec)),
            Err(e) => {
                // hidapi reports an unplugged device as a read failure.
                self.connected = false;
                debug!(path = %self.info.path, error = %e, "HID read failed");
                Err(HidCommonError::Disconnected)
            }
        }
    }

    fn report_descriptor(&self) -> HidCommonResult<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DESCRIPTOR_LEN];
        let n = self
            .device
            .get_report_descriptor(&mut buf)
            .map_err(|e| HidCommonError::InvalidDescriptor(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn device_info(&self) -> &HidDeviceInfo {
        &self.info
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) -> HidCommonResult<()> {
        self.connected = false;
        Ok(())
    }
}
