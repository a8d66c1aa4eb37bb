//! Virtual input devices.
//!
//! A [`VirtualInputDescriptor`] is the fixed layout exposed to games: named
//! axes always land on the same absolute-axis codes and buttons are
//! numbered from the joystick trigger button upwards, whatever the physical
//! report looked like. The OS backend is selected at compile time; tests use
//! [`mock::RecordingFactory`].

pub mod mock;

#[cfg(target_os = "linux")]
pub mod linux;

use openracing_errors::DeviceError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decode::DeviceEvent;
use crate::layout::{Axis, ReportLayout};

/// Linux input-event codes; other backends translate from these.
pub mod codes {
    pub const ABS_X: u16 = 0x00;
    pub const ABS_Y: u16 = 0x01;
    pub const ABS_Z: u16 = 0x02;
    pub const ABS_RX: u16 = 0x03;
    pub const ABS_RY: u16 = 0x04;
    pub const ABS_RZ: u16 = 0x05;
    pub const ABS_THROTTLE: u16 = 0x06;
    pub const ABS_RUDDER: u16 = 0x07;
    pub const ABS_WHEEL: u16 = 0x08;
    pub const ABS_GAS: u16 = 0x09;
    pub const ABS_BRAKE: u16 = 0x0A;
    pub const ABS_HAT0X: u16 = 0x10;
    pub const ABS_HAT0Y: u16 = 0x11;

    pub const BTN_TRIGGER: u16 = 0x120;
    pub const BTN_TRIGGER_HAPPY1: u16 = 0x2C0;
}

/// Joystick block (16) plus the 40 trigger-happy codes.
pub const MAX_VIRTUAL_BUTTONS: u16 = 56;
const JOYSTICK_BLOCK: u16 = 16;
pub const VIRTUAL_AXIS_MAX: i32 = 65535;

/// Absolute-axis code for a logical axis, `None` once the aux pool is exhausted.
pub fn axis_code(axis: Axis) -> Option<u16> {
    use codes::*;
    const AUX: [u16; 6] = [ABS_RZ, ABS_THROTTLE, ABS_RUDDER, ABS_WHEEL, ABS_GAS, ABS_BRAKE];
    match axis {
        Axis::Steering => Some(ABS_X),
        Axis::Throttle => Some(ABS_Y),
        Axis::Brake => Some(ABS_Z),
        Axis::Clutch => Some(ABS_RX),
        Axis::Handbrake => Some(ABS_RY),
        Axis::Aux(n) => AUX.get(usize::from(n)).copied(),
    }
}

/// Key code for 1-based button `n`.
pub fn button_code(n: u16) -> Option<u16> {
    let index = n.checked_sub(1)?;
    if index < JOYSTICK_BLOCK {
        Some(codes::BTN_TRIGGER + index)
    } else if index < MAX_VIRTUAL_BUTTONS {
        Some(codes::BTN_TRIGGER_HAPPY1 + (index - JOYSTICK_BLOCK))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualAxis {
    pub axis: Axis,
    pub code: u16,
    pub min: i32,
    pub max: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualInputDescriptor {
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub axes: Vec<VirtualAxis>,
    /// Key codes, button `n` at index `n - 1`.
    pub buttons: Vec<u16>,
    pub hat: bool,
}

impl VirtualInputDescriptor {
    /// Normalized layout for `layout`. Always exposes at least one button so
    /// the device is classified as a joystick.
    pub fn for_layout(layout: &ReportLayout, vendor_id: u16, product_id: u16) -> Self {
        let mut axes = Vec::new();
        for (axis, _) in &layout.axes {
            match axis_code(*axis) {
                Some(code) => axes.push(VirtualAxis {
                    axis: *axis,
                    code,
                    min: 0,
                    max: VIRTUAL_AXIS_MAX,
                }),
                None => warn!(layout = %layout.name, %axis, "no free virtual axis, dropping"),
            }
        }

        let physical = u16::try_from(layout.buttons.len())
            .unwrap_or(u16::MAX)
            .saturating_add(layout.virtual_buttons);
        let count = physical.clamp(1, MAX_VIRTUAL_BUTTONS);
        if physical > MAX_VIRTUAL_BUTTONS {
            debug!(layout = %layout.name, physical, "truncating virtual buttons");
        }
        let buttons = (1..=count).filter_map(button_code).collect();

        Self {
            name: format!("{} (normalized)", layout.name),
            vendor_id,
            product_id,
            axes,
            buttons,
            hat: layout.hat.is_some(),
        }
    }

    pub fn axis(&self, axis: Axis) -> Option<&VirtualAxis> {
        self.axes.iter().find(|a| a.axis == axis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualEvent {
    Absolute { code: u16, value: i32 },
    Key { code: u16, pressed: bool },
}

/// An open OS-level virtual device.
pub trait VirtualInputSink: Send {
    /// Emits one batch of events followed by a sync.
    fn emit(&mut self, events: &[VirtualEvent]) -> Result<(), DeviceError>;
}

pub trait VirtualDeviceFactory: Send + Sync {
    fn create(
        &self,
        descriptor: &VirtualInputDescriptor,
    ) -> Result<Box<dyn VirtualInputSink>, DeviceError>;
}

fn hat_xy(hat: Option<u8>) -> (i32, i32) {
    match hat {
        Some(0) => (0, -1),
        Some(1) => (1, -1),
        Some(2) => (1, 0),
        Some(3) => (1, 1),
        Some(4) => (0, 1),
        Some(5) => (-1, 1),
        Some(6) => (-1, 0),
        Some(7) => (-1, -1),
        _ => (0, 0),
    }
}

fn scale(value: f32, axis: &VirtualAxis) -> i32 {
    let span = (axis.max - axis.min) as f32;
    axis.min + (value.clamp(0.0, 1.0) * span).round() as i32
}

/// A created virtual device. Dropping it releases the OS device.
pub struct VirtualDevice {
    descriptor: VirtualInputDescriptor,
    sink: Box<dyn VirtualInputSink>,
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl VirtualDevice {
    pub fn descriptor(&self) -> &VirtualInputDescriptor {
        &self.descriptor
    }

    /// Forwards one decoded event. `throttle_floor` raises the throttle
    /// axis to at least that fraction (blip).
    pub fn forward(
        &mut self,
        event: &DeviceEvent,
        throttle_floor: Option<f32>,
    ) -> Result<(), DeviceError> {
        let mut out = Vec::with_capacity(event.axes.len() + event.buttons.len() + 2);
        for sample in &event.axes {
            if let Some(axis) = self.descriptor.axis(sample.axis) {
                let value = match (sample.axis, throttle_floor) {
                    (Axis::Throttle, Some(floor)) => sample.value.max(floor),
                    _ => sample.value,
                };
                out.push(VirtualEvent::Absolute {
                    code: axis.code,
                    value: scale(value, axis),
                });
            }
        }
        for edge in &event.buttons {
            if let Some(code) = self
                .descriptor
                .buttons
                .get(usize::from(edge.button).saturating_sub(1))
                .filter(|_| edge.button > 0)
            {
                out.push(VirtualEvent::Key {
                    code: *code,
                    pressed: edge.pressed,
                });
            }
        }
        if self.descriptor.hat && event.hat.is_some() {
            let (x, y) = hat_xy(event.hat);
            out.push(VirtualEvent::Absolute {
                code: codes::ABS_HAT0X,
                value: x,
            });
            out.push(VirtualEvent::Absolute {
                code: codes::ABS_HAT0Y,
                value: y,
            });
        }
        if out.is_empty() {
            return Ok(());
        }
        self.sink.emit(&out)
    }

    /// Sets the throttle axis directly, used when a blip starts or ends
    /// without a fresh report.
    pub fn set_throttle(&mut self, value: f32) -> Result<(), DeviceError> {
        let Some(axis) = self.descriptor.axis(Axis::Throttle).copied() else {
            return Ok(());
        };
        self.sink.emit(&[VirtualEvent::Absolute {
            code: axis.code,
            value: scale(value, &axis),
        }])
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        debug!(name = %self.descriptor.name, "releasing virtual input device");
    }
}

/// Creates the OS-level device for `descriptor` through `factory`.
pub fn create_virtual_device(
    factory: &dyn VirtualDeviceFactory,
    descriptor: VirtualInputDescriptor,
) -> Result<VirtualDevice, DeviceError> {
    let sink = factory.create(&descriptor)?;
    debug!(
        name = %descriptor.name,
        axes = descriptor.axes.len(),
        buttons = descriptor.buttons.len(),
        "created virtual input device"
    );
    Ok(VirtualDevice { descriptor, sink })
}

/// The virtual input backend for this platform, if there is one.
#[cfg(target_os = "linux")]
pub fn platform_factory() -> Option<Box<dyn VirtualDeviceFactory>> {
    Some(Box::new(linux::UinputFactory))
}

#[cfg(not(target_os = "linux"))]
pub fn platform_factory() -> Option<Box<dyn VirtualDeviceFactory>> {
    None
}
