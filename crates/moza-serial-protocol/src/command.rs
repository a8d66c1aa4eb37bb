//! Commands and their typed, range-checked parameters.
//!
//! Multi-byte fields are big-endian on the wire.

use core::fmt;

use openracing_errors::EncodingError;
use serde::{Deserialize, Serialize};

use crate::catalog::{self, Setting};
use crate::checksum::Checksum;
use crate::frame::{Frame, FrameCodec};
use crate::role::DeviceRole;

/// Wire type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    U8,
    U16,
    I16,
    U32,
    F32,
}

impl ParamKind {
    /// Encoded width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::F32 => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::F32 => "f32",
        }
    }
}

/// A parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    I16(i16),
    U32(u32),
    F32(f32),
}

impl ParamValue {
    pub const fn kind(&self) -> ParamKind {
        match self {
            Self::U8(_) => ParamKind::U8,
            Self::U16(_) => ParamKind::U16,
            Self::I16(_) => ParamKind::I16,
            Self::U32(_) => ParamKind::U32,
            Self::F32(_) => ParamKind::F32,
        }
    }

    /// Lossless widening used for range checks.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::U8(v) => f64::from(v),
            Self::U16(v) => f64::from(v),
            Self::I16(v) => f64::from(v),
            Self::U32(v) => f64::from(v),
            Self::F32(v) => f64::from(v),
        }
    }

    fn write_be(&self, out: &mut Vec<u8>) {
        match *self {
            Self::U8(v) => out.push(v),
            Self::U16(v) => out.extend_from_slice(&v.to_be_bytes()),
            Self::I16(v) => out.extend_from_slice(&v.to_be_bytes()),
            Self::U32(v) => out.extend_from_slice(&v.to_be_bytes()),
            Self::F32(v) => out.extend_from_slice(&v.to_be_bytes()),
        }
    }

    /// Read a value of `kind` from the front of `bytes`.
    pub fn read_be(kind: ParamKind, bytes: &[u8]) -> Option<Self> {
        let value = match kind {
            ParamKind::U8 => Self::U8(*bytes.first()?),
            ParamKind::U16 => Self::U16(u16::from_be_bytes(take(bytes)?)),
            ParamKind::I16 => Self::I16(i16::from_be_bytes(take(bytes)?)),
            ParamKind::U32 => Self::U32(u32::from_be_bytes(take(bytes)?)),
            ParamKind::F32 => Self::F32(f32::from_be_bytes(take(bytes)?)),
        };
        Some(value)
    }
}

fn take<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.get(..N)?.try_into().ok()
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
        }
    }
}

/// Declared name, type and inclusive range of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub min: f64,
    pub max: f64,
}

impl ParamSpec {
    pub const fn new(name: &'static str, kind: ParamKind, min: f64, max: f64) -> Self {
        Self {
            name,
            kind,
            min,
            max,
        }
    }

    /// Reject values of the wrong type or outside `min..=max`. NaN is out
    /// of every range.
    pub fn check(&self, value: ParamValue) -> Result<(), EncodingError> {
        if value.kind() != self.kind {
            return Err(EncodingError::type_mismatch(self.name, self.kind.as_str()));
        }
        if !(self.min..=self.max).contains(&value.as_f64()) {
            return Err(EncodingError::out_of_range(
                self.name,
                value.to_string(),
                self.min.to_string(),
                self.max.to_string(),
            ));
        }
        Ok(())
    }
}

/// A request addressed to a device role.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    role: DeviceRole,
    command_id: u8,
    params: Vec<(ParamSpec, ParamValue)>,
}

impl Command {
    /// A command with no parameters.
    pub fn new(role: DeviceRole, command_id: u8) -> Self {
        Self {
            role,
            command_id,
            params: Vec::new(),
        }
    }

    /// Append a parameter. Validation happens at encode time.
    pub fn with_param(mut self, spec: ParamSpec, value: ParamValue) -> Self {
        self.params.push((spec, value));
        self
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn params(&self) -> impl Iterator<Item = ParamValue> + '_ {
        self.params.iter().map(|(_, value)| *value)
    }

    /// Validate every parameter and serialize the payload.
    pub fn encode_payload(&self) -> Result<Vec<u8>, EncodingError> {
        let width = self.params.iter().map(|(spec, _)| spec.kind.width()).sum();
        let mut payload = Vec::with_capacity(width);
        for (spec, value) in &self.params {
            spec.check(*value)?;
            value.write_be(&mut payload);
        }
        Ok(payload)
    }

    /// Query the current value of a catalog setting.
    pub fn read_setting(role: DeviceRole, name: &str) -> Result<Self, EncodingError> {
        Ok(Self::new(role, find(role, name)?.read))
    }

    /// Write a catalog setting. Read-only settings are rejected.
    pub fn write_setting(
        role: DeviceRole,
        name: &str,
        value: ParamValue,
    ) -> Result<Self, EncodingError> {
        let setting = find(role, name)?;
        let command_id = setting
            .write
            .ok_or_else(|| EncodingError::read_only(setting.name))?;
        Ok(Self::new(role, command_id).with_param(setting.param, value))
    }

    /// Limit wheelbase output torque, in percent.
    pub fn set_torque_limit(percent: u8) -> Self {
        Self::write(DeviceRole::Wheelbase, &catalog::TORQUE_LIMIT, ParamValue::U8(percent))
    }

    /// Set wheelbase steering lock, in degrees.
    pub fn set_max_angle(degrees: u16) -> Self {
        Self::write(DeviceRole::Wheelbase, &catalog::MAX_ANGLE, ParamValue::U16(degrees))
    }

    /// Set overall force-feedback strength, in percent.
    pub fn set_ffb_strength(percent: u8) -> Self {
        Self::write(DeviceRole::Wheelbase, &catalog::FFB_STRENGTH, ParamValue::U8(percent))
    }

    fn write(role: DeviceRole, setting: &Setting, value: ParamValue) -> Self {
        // Typed constructors only name settings that carry a write id.
        let command_id = setting.write.unwrap_or(setting.read);
        Self::new(role, command_id).with_param(setting.param, value)
    }
}

fn find(role: DeviceRole, name: &str) -> Result<&'static Setting, EncodingError> {
    catalog::lookup(role.kind(), name).ok_or_else(|| EncodingError::UnknownSetting {
        role: role.to_string(),
        name: name.to_string(),
    })
}

impl<C: Checksum> FrameCodec<C> {
    /// Encode a command into a frame addressed to its role.
    pub fn encode(&self, command: &Command) -> Result<Frame, EncodingError> {
        let address = command.role.address().ok_or_else(|| EncodingError::NoAddress {
            role: command.role.to_string(),
        })?;
        self.frame(address, command.command_id, command.encode_payload()?)
    }
}
