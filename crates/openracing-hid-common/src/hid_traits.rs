//! HID device traits
//!
//! Both traits are blocking: each open device is driven by exactly one
//! reader thread, which owns the `Box<dyn HidDevice>`.

use crate::{HidCommonError, HidCommonResult, HidDeviceInfo};

pub trait HidDevice: Send {
    fn write_report(&mut self, data: &[u8]) -> HidCommonResult<usize>;

    /// Waits up to `timeout_ms` for one input report. `Ok(None)` on timeout.
    fn read_report(&mut self, timeout_ms: i32) -> HidCommonResult<Option<Vec<u8>>>;

    /// Raw report descriptor as reported by the device.
    fn report_descriptor(&self) -> HidCommonResult<Vec<u8>>;

    fn device_info(&self) -> &HidDeviceInfo;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> HidCommonResult<()>;
}

pub trait HidPort: Send + Sync {
    fn list_devices(&self) -> HidCommonResult<Vec<HidDeviceInfo>>;

    fn open_device(&self, path: &str) -> HidCommonResult<Box<dyn HidDevice>>;

    /// Re-enumerates the bus so the next `list_devices` sees hotplugged devices.
    fn refresh(&self) -> HidCommonResult<()>;
}

pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Upper bound on how long an empty mock read sleeps, keeps reader
    /// threads responsive in tests.
    const EMPTY_READ_SLEEP_MS: u64 = 2;

    #[derive(Debug, Default)]
    struct Shared {
        read_queue: VecDeque<Vec<u8>>,
        write_history: Vec<Vec<u8>>,
        connected: bool,
        opened: usize,
    }

    /// In-memory device. Clones share state, so a test keeps one clone to
    /// feed reports while the code under test owns another.
    #[derive(Debug, Clone)]
    pub struct MockHidDevice {
        info: HidDeviceInfo,
        descriptor: Vec<u8>,
        shared: Arc<Mutex<Shared>>,
    }

    impl MockHidDevice {
        pub fn new(vendor_id: u16, product_id: u16, path: impl Into<String>) -> Self {
            Self::from_info(HidDeviceInfo::new(vendor_id, product_id, path))
        }

        pub fn from_info(info: HidDeviceInfo) -> Self {
            Self {
                info,
                descriptor: Vec::new(),
                shared: Arc::new(Mutex::new(Shared {
                    connected: true,
                    ..Shared::default()
                })),
            }
        }

        pub fn with_descriptor(mut self, descriptor: impl Into<Vec<u8>>) -> Self {
            self.descriptor = descriptor.into();
            self
        }

        pub fn with_product_name(mut self, name: impl Into<String>) -> Self {
            self.info = self.info.with_product_name(name);
            self
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
            self.shared.lock().unwrap_or_else(|e| e.into_inner())
        }

        pub fn queue_read(&self, data: impl Into<Vec<u8>>) {
            self.lock().read_queue.push_back(data.into());
        }

        pub fn pending_reads(&self) -> usize {
            self.lock().read_queue.len()
        }

        pub fn get_write_history(&self) -> Vec<Vec<u8>> {
            self.lock().write_history.clone()
        }

        /// How many times a port handed this device out.
        pub fn open_count(&self) -> usize {
            self.lock().opened
        }

        pub fn disconnect(&self) {
            self.lock().connected = false;
        }

        pub fn reconnect(&self) {
            self.lock().connected = true;
        }
    }

    impl HidDevice for MockHidDevice {
        fn write_report(&mut self, data: &[u8]) -> HidCommonResult<usize> {
            let mut shared = self.lock();
            if !shared.connected {
                return Err(HidCommonError::Disconnected);
            }
            shared.write_history.push(data.to_vec());
            Ok(data.len())
        }

        fn read_report(&mut self, timeout_ms: i32) -> HidCommonResult<Option<Vec<u8>>> {
            {
                let mut shared = self.lock();
                if !shared.connected {
                    return Err(HidCommonError::Disconnected);
                }
                if let Some(report) = shared.read_queue.pop_front() {
                    return Ok(Some(report));
                }
            }
            let wait = u64::try_from(timeout_ms)
                .unwrap_or(0)
                .min(EMPTY_READ_SLEEP_MS);
            std::thread::sleep(Duration::from_millis(wait));
            Ok(None)
        }

        fn report_descriptor(&self) -> HidCommonResult<Vec<u8>> {
            if self.descriptor.is_empty() {
                return Err(HidCommonError::InvalidDescriptor(
                    "device exposes no report descriptor".to_string(),
                ));
            }
            Ok(self.descriptor.clone())
        }

        fn device_info(&self) -> &HidDeviceInfo {
            &self.info
        }

        fn is_connected(&self) -> bool {
            self.lock().connected
        }

        fn close(&mut self) -> HidCommonResult<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct MockHidPort {
        devices: Mutex<Vec<MockHidDevice>>,
    }

    impl MockHidPort {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_device(&self, device: MockHidDevice) {
            self.devices
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(device);
        }

        /// Unplugs the device at `path`: it disappears from enumeration and
        /// any open handle starts failing with `Disconnected`.
        pub fn remove_device(&self, path: &str) -> bool {
            let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
            let before = devices.len();
            devices.retain(|d| {
                let keep = d.info.path != path;
                if !keep {
                    d.disconnect();
                }
                keep
            });
            devices.len() != before
        }

        pub fn device_count(&self) -> usize {
            self.devices.lock().unwrap_or_else(|e| e.into_inner()).len()
        }
    }

    impl HidPort for MockHidPort {
        fn list_devices(&self) -> HidCommonResult<Vec<HidDeviceInfo>> {
            Ok(self
                .devices
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|d| d.info.clone())
                .collect())
        }

        fn open_device(&self, path: &str) -> HidCommonResult<Box<dyn HidDevice>> {
            let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
            let device = devices
                .iter()
                .find(|d| d.info.path == path)
                .ok_or_else(|| HidCommonError::DeviceNotFound(path.to_string()))?;
            device.lock().opened += 1;
            Ok(Box::new(device.clone()))
        }

        fn refresh(&self) -> HidCommonResult<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockHidDevice, MockHidPort};
    use super::*;

    #[test]
    fn test_mock_device_write_and_read() -> HidCommonResult<()> {
        let mut device = MockHidDevice::new(0x346E, 0x0003, "/dev/hidraw0");
        assert_eq!(device.write_report(&[0x01, 0x02, 0x03])?, 3);
        assert_eq!(device.get_write_history(), vec![vec![0x01, 0x02, 0x03]]);

        device.queue_read(vec![0xAA, 0xBB]);
        assert_eq!(device.read_report(10)?, Some(vec![0xAA, 0xBB]));
        assert_eq!(device.read_report(1)?, None);
        Ok(())
    }

    #[test]
    fn test_mock_device_disconnect() {
        let mut device = MockHidDevice::new(0x346E, 0x0003, "/dev/hidraw0");
        device.disconnect();
        assert!(!device.is_connected());
        assert!(matches!(
            device.read_report(1),
            Err(HidCommonError::Disconnected)
        ));
    }

    #[test]
    fn test_mock_port_open_shares_state() -> HidCommonResult<()> {
        let port = MockHidPort::new();
        let feeder = MockHidDevice::new(0x346E, 0x0003, "/dev/hidraw0");
        port.add_device(feeder.clone());

        let mut opened = port.open_device("/dev/hidraw0")?;
        feeder.queue_read(vec![0x01]);
        assert_eq!(opened.read_report(1)?, Some(vec![0x01]));
        assert_eq!(feeder.open_count(), 1);

        assert!(port.remove_device("/dev/hidraw0"));
        assert!(!opened.is_connected());
        assert!(matches!(
            port.open_device("/dev/hidraw0"),
            Err(HidCommonError::DeviceNotFound(_))
        ));
        Ok(())
    }
}
