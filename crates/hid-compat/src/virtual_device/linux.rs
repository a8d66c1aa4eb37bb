//! uinput backend.

use evdev::uinput::{VirtualDevice as UinputDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisType, AttributeSet, BusType, EventType, InputEvent, InputId, Key,
    UinputAbsSetup,
};
use openracing_errors::DeviceError;
use tracing::info;

use super::{VirtualDeviceFactory, VirtualEvent, VirtualInputDescriptor, VirtualInputSink, codes};

const DEVICE_VERSION: u16 = 1;

/// Creates devices under `/dev/uinput`. Needs write access to it, usually
/// granted by a udev rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct UinputFactory;

fn build(descriptor: &VirtualInputDescriptor) -> std::io::Result<UinputDevice> {
    let mut keys = AttributeSet::<Key>::new();
    for code in &descriptor.buttons {
        keys.insert(Key::new(*code));
    }

    let mut builder = VirtualDeviceBuilder::new()?
        .name(&descriptor.name)
        .input_id(InputId::new(
            BusType::BUS_USB,
            descriptor.vendor_id,
            descriptor.product_id,
            DEVICE_VERSION,
        ))
        .with_keys(&keys)?;

    for axis in &descriptor.axes {
        let info = AbsInfo::new(axis.min, axis.min, axis.max, 0, 0, 0);
        builder = builder.with_absolute_axis(&UinputAbsSetup::new(
            AbsoluteAxisType(axis.code),
            info,
        ))?;
    }
    if descriptor.hat {
        for code in [codes::ABS_HAT0X, codes::ABS_HAT0Y] {
            builder = builder.with_absolute_axis(&UinputAbsSetup::new(
                AbsoluteAxisType(code),
                AbsInfo::new(0, -1, 1, 0, 0, 0),
            ))?;
        }
    }
    builder.build()
}

impl VirtualDeviceFactory for UinputFactory {
    fn create(
        &self,
        descriptor: &VirtualInputDescriptor,
    ) -> Result<Box<dyn VirtualInputSink>, DeviceError> {
        let device =
            build(descriptor).map_err(|e| DeviceError::virtual_device(&descriptor.name, e))?;
        info!(name = %descriptor.name, "uinput device created");
        Ok(Box::new(UinputSink {
            name: descriptor.name.clone(),
            device,
        }))
    }
}

struct UinputSink {
    name: String,
    device: UinputDevice,
}

impl VirtualInputSink for UinputSink {
    fn emit(&mut self, events: &[VirtualEvent]) -> Result<(), DeviceError> {
        let batch: Vec<InputEvent> = events
            .iter()
            .map(|event| match *event {
                VirtualEvent::Absolute { code, value } => {
                    InputEvent::new(EventType::ABSOLUTE, code, value)
                }
                VirtualEvent::Key { code, pressed } => {
                    InputEvent::new(EventType::KEY, code, i32::from(pressed))
                }
            })
            .collect();
        // emit() terminates the batch with SYN_REPORT.
        self.device
            .emit(&batch)
            .map_err(|e| DeviceError::virtual_device(&self.name, e))
    }
}
