//! In-memory virtual device backend for tests and headless runs.

use std::sync::Arc;

use openracing_errors::DeviceError;
use parking_lot::Mutex;

use super::{VirtualDeviceFactory, VirtualEvent, VirtualInputDescriptor, VirtualInputSink};

#[derive(Debug, Default)]
struct Log {
    created: Vec<VirtualInputDescriptor>,
    batches: Vec<Vec<VirtualEvent>>,
    live: usize,
    fail_create: bool,
}

/// Records every created device and emitted batch.
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory {
    log: Arc<Mutex<Log>>,
}

impl RecordingFactory {
    /// A factory whose `create` always fails, as when uinput is not writable.
    pub fn failing() -> Self {
        let factory = Self::default();
        factory.log.lock().fail_create = true;
        factory
    }

    pub fn created(&self) -> Vec<VirtualInputDescriptor> {
        self.log.lock().created.clone()
    }

    pub fn batches(&self) -> Vec<Vec<VirtualEvent>> {
        self.log.lock().batches.clone()
    }

    /// All emitted events, flattened.
    pub fn events(&self) -> Vec<VirtualEvent> {
        self.log.lock().batches.iter().flatten().copied().collect()
    }

    pub fn live_devices(&self) -> usize {
        self.log.lock().live
    }
}

impl VirtualDeviceFactory for RecordingFactory {
    fn create(
        &self,
        descriptor: &VirtualInputDescriptor,
    ) -> Result<Box<dyn VirtualInputSink>, DeviceError> {
        let mut log = self.log.lock();
        if log.fail_create {
            return Err(DeviceError::virtual_device(
                &descriptor.name,
                "creation refused",
            ));
        }
        log.created.push(descriptor.clone());
        log.live += 1;
        Ok(Box::new(RecordingSink {
            log: Arc::clone(&self.log),
        }))
    }
}

pub struct RecordingSink {
    log: Arc<Mutex<Log>>,
}

impl VirtualInputSink for RecordingSink {
    fn emit(&mut self, events: &[VirtualEvent]) -> Result<(), DeviceError> {
        self.log.lock().batches.push(events.to_vec());
        Ok(())
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        let mut log = self.log.lock();
        log.live = log.live.saturating_sub(1);
    }
}
