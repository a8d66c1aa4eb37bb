//! Logical device roles and the identification exchange.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Serial address of the wheelbase.
pub const WHEELBASE_ADDRESS: u8 = 0x13;
/// Serial address of the first wheel slot. Further slots step down by two.
pub const WHEEL_BASE_ADDRESS: u8 = 0x17;
/// Serial address of the pedal set.
pub const PEDALS_ADDRESS: u8 = 0x19;
/// Serial address of the shifter.
pub const SHIFTER_ADDRESS: u8 = 0x1A;
/// Number of wheel slots with a distinct serial address.
pub const MAX_WHEEL_SLOTS: u8 = 2;

/// Address every device answers the role query on.
pub const IDENTIFY_ADDRESS: u8 = 0x01;
/// Command identifier of the role query.
pub const IDENTIFY_COMMAND: u8 = 0x00;

/// Device family, without per-instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Wheelbase,
    Wheel,
    Pedals,
    Shifter,
    GenericHid,
}

impl DeviceKind {
    /// Decode the role code carried in an identification reply.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Wheelbase),
            2 => Some(Self::Wheel),
            3 => Some(Self::Pedals),
            4 => Some(Self::Shifter),
            _ => None,
        }
    }

    /// Role code sent in identification replies. HID peripherals have none.
    pub const fn code(self) -> Option<u8> {
        match self {
            Self::Wheelbase => Some(1),
            Self::Wheel => Some(2),
            Self::Pedals => Some(3),
            Self::Shifter => Some(4),
            Self::GenericHid => None,
        }
    }

    /// Whether at most one device of this kind may be connected.
    pub const fn is_singular(self) -> bool {
        !matches!(self, Self::Wheel | Self::GenericHid)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wheelbase => "wheelbase",
            Self::Wheel => "wheel",
            Self::Pedals => "pedals",
            Self::Shifter => "shifter",
            Self::GenericHid => "hid",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical device role.
///
/// The role is resolved once at identification time and never changes for
/// the lifetime of a device handle. Wheels and generic HID peripherals carry a
/// slot so that several devices of the same model stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceRole {
    Wheelbase,
    Wheel(u8),
    Pedals,
    Shifter,
    GenericHid(u8),
}

impl DeviceRole {
    pub const fn kind(self) -> DeviceKind {
        match self {
            Self::Wheelbase => DeviceKind::Wheelbase,
            Self::Wheel(_) => DeviceKind::Wheel,
            Self::Pedals => DeviceKind::Pedals,
            Self::Shifter => DeviceKind::Shifter,
            Self::GenericHid(_) => DeviceKind::GenericHid,
        }
    }

    /// Serial address of this role, if it speaks the serial protocol.
    pub const fn address(self) -> Option<u8> {
        match self {
            Self::Wheelbase => Some(WHEELBASE_ADDRESS),
            Self::Wheel(slot) if slot < MAX_WHEEL_SLOTS => {
                Some(WHEEL_BASE_ADDRESS.wrapping_sub(slot.wrapping_mul(2)))
            }
            Self::Wheel(_) | Self::GenericHid(_) => None,
            Self::Pedals => Some(PEDALS_ADDRESS),
            Self::Shifter => Some(SHIFTER_ADDRESS),
        }
    }

    /// Role answering on `address`, the inverse of [`DeviceRole::address`].
    pub const fn from_address(address: u8) -> Option<Self> {
        match address {
            WHEELBASE_ADDRESS => Some(Self::Wheelbase),
            PEDALS_ADDRESS => Some(Self::Pedals),
            SHIFTER_ADDRESS => Some(Self::Shifter),
            WHEEL_BASE_ADDRESS => Some(Self::Wheel(0)),
            0x15 => Some(Self::Wheel(1)),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wheel(0) => f.write_str("wheel"),
            Self::Wheel(slot) => write!(f, "wheel#{slot}"),
            Self::GenericHid(slot) => write!(f, "hid#{slot}"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// What a device reported about itself in answer to the role query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub kind: DeviceKind,
    /// Disambiguation token; distinguishes same-model wheels.
    pub token: u8,
    /// Model byte, when the firmware sends one.
    pub model: Option<u8>,
}

impl Identity {
    /// Parse the value bytes of a successful identification reply:
    /// `[role code][token][model?]`.
    pub fn from_value(value: &[u8]) -> Option<Self> {
        let (&code, rest) = value.split_first()?;
        let (&token, rest) = rest.split_first()?;
        Some(Self {
            kind: DeviceKind::from_code(code)?,
            token,
            model: rest.first().copied(),
        })
    }

    /// Value bytes a device sends for this identity.
    pub fn to_value(&self) -> Vec<u8> {
        let mut value = Vec::with_capacity(3);
        value.extend(self.kind.code());
        value.push(self.token);
        value.extend(self.model);
        value
    }
}
