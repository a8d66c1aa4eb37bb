//! Named device settings and their command identifiers.
//!
//! Every setting can be read; settings without a write id are read-only and
//! [`Command::write_setting`](crate::Command::write_setting) rejects them.

use crate::command::{ParamKind, ParamSpec};
use crate::role::DeviceKind;

/// One readable (and possibly writable) device setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setting {
    pub kind: DeviceKind,
    pub name: &'static str,
    pub read: u8,
    pub write: Option<u8>,
    pub param: ParamSpec,
}

impl Setting {
    const fn rw(kind: DeviceKind, read: u8, param: ParamSpec) -> Self {
        Self {
            kind,
            name: param.name,
            read,
            write: Some(read.wrapping_add(1)),
            param,
        }
    }

    const fn ro(kind: DeviceKind, read: u8, param: ParamSpec) -> Self {
        Self {
            kind,
            name: param.name,
            read,
            write: None,
            param,
        }
    }

    pub const fn is_read_only(&self) -> bool {
        self.write.is_none()
    }
}

use DeviceKind::{Pedals, Shifter, Wheel, Wheelbase};
use ParamKind::{F32, I16, U8, U16, U32};

pub const TORQUE_LIMIT: Setting =
    Setting::rw(Wheelbase, 0x10, ParamSpec::new("torque-limit", U8, 50.0, 100.0));
pub const MAX_ANGLE: Setting =
    Setting::rw(Wheelbase, 0x12, ParamSpec::new("max-angle", U16, 90.0, 2700.0));
pub const FFB_STRENGTH: Setting =
    Setting::rw(Wheelbase, 0x14, ParamSpec::new("ffb-strength", U8, 0.0, 100.0));
pub const DAMPER: Setting = Setting::rw(Wheelbase, 0x16, ParamSpec::new("damper", U8, 0.0, 100.0));
pub const ROAD_SENSITIVITY: Setting =
    Setting::rw(Wheelbase, 0x18, ParamSpec::new("road-sensitivity", U8, 0.0, 10.0));
pub const FFB_REVERSE: Setting =
    Setting::rw(Wheelbase, 0x1A, ParamSpec::new("ffb-reverse", U8, 0.0, 1.0));
pub const MOTOR_TEMPERATURE: Setting =
    Setting::ro(Wheelbase, 0x1C, ParamSpec::new("motor-temperature", I16, -40.0, 150.0));
pub const FIRMWARE_VERSION: Setting = Setting::ro(
    Wheelbase,
    0x1E,
    ParamSpec::new("firmware-version", U32, 0.0, 4_294_967_295.0),
);

pub const RPM_BRIGHTNESS: Setting =
    Setting::rw(Wheel, 0x20, ParamSpec::new("rpm-brightness", U8, 0.0, 100.0));
pub const PADDLE_MODE: Setting = Setting::rw(Wheel, 0x22, ParamSpec::new("paddle-mode", U8, 0.0, 2.0));
pub const STICK_MODE: Setting = Setting::rw(Wheel, 0x24, ParamSpec::new("stick-mode", U8, 0.0, 1.0));

pub const THROTTLE_REVERSE: Setting =
    Setting::rw(Pedals, 0x30, ParamSpec::new("throttle-reverse", U8, 0.0, 1.0));
pub const BRAKE_REVERSE: Setting =
    Setting::rw(Pedals, 0x32, ParamSpec::new("brake-reverse", U8, 0.0, 1.0));
pub const BRAKE_ANGLE_RATIO: Setting =
    Setting::rw(Pedals, 0x34, ParamSpec::new("brake-angle-ratio", F32, 0.0, 1.0));
pub const THROTTLE_DEADZONE: Setting =
    Setting::rw(Pedals, 0x36, ParamSpec::new("throttle-deadzone", U8, 0.0, 100.0));

pub const SHIFTER_DIRECTION: Setting =
    Setting::rw(Shifter, 0x40, ParamSpec::new("direction", U8, 0.0, 1.0));
pub const PADDLE_SYNC: Setting =
    Setting::rw(Shifter, 0x42, ParamSpec::new("paddle-sync", U8, 0.0, 1.0));

/// Every known setting.
pub static SETTINGS: &[Setting] = &[
    TORQUE_LIMIT,
    MAX_ANGLE,
    FFB_STRENGTH,
    DAMPER,
    ROAD_SENSITIVITY,
    FFB_REVERSE,
    MOTOR_TEMPERATURE,
    FIRMWARE_VERSION,
    RPM_BRIGHTNESS,
    PADDLE_MODE,
    STICK_MODE,
    THROTTLE_REVERSE,
    BRAKE_REVERSE,
    BRAKE_ANGLE_RATIO,
    THROTTLE_DEADZONE,
    SHIFTER_DIRECTION,
    PADDLE_SYNC,
];

/// Setting `name` of device family `kind`.
pub fn lookup(kind: DeviceKind, name: &str) -> Option<&'static Setting> {
    SETTINGS.iter().find(|s| s.kind == kind && s.name == name)
}

/// Setting whose read or write id is `command_id`.
pub fn by_command(kind: DeviceKind, command_id: u8) -> Option<&'static Setting> {
    SETTINGS
        .iter()
        .find(|s| s.kind == kind && (s.read == command_id || s.write == Some(command_id)))
}

/// Settings of one device family, in catalog order.
pub fn settings_for(kind: DeviceKind) -> impl Iterator<Item = &'static Setting> {
    SETTINGS.iter().filter(move |s| s.kind == kind)
}
