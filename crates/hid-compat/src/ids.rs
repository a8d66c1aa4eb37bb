//! Moza HID product ids and product-name patterns.
//!
//! Standalone peripherals are matched by PID first; anything else from the
//! vendor (and hubs re-enumerating under their own name) by a
//! case-insensitive product-name pattern.

use openracing_hid_common::HidDeviceInfo;
use serde::{Deserialize, Serialize};

pub const MOZA_VENDOR_ID: u16 = 0x346E;

pub mod product_ids {
    pub const R16_R21_V1: u16 = 0x0000;
    pub const R9_V1: u16 = 0x0002;
    pub const R5_V1: u16 = 0x0004;
    pub const R3_V1: u16 = 0x0005;
    pub const R12_V1: u16 = 0x0006;
    /// Newer firmware re-enumerates wheelbases with this bit set.
    pub const V2_FLAG: u16 = 0x0010;

    pub const SR_P_PEDALS: u16 = 0x0003;
    pub const HGP_SHIFTER: u16 = 0x0020;
    pub const SGP_SHIFTER: u16 = 0x0021;
    pub const HBP_HANDBRAKE: u16 = 0x0022;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MozaModel {
    Wheelbase,
    Pedals,
    Handbrake,
    HPatternShifter,
    SequentialShifter,
    Hub,
    Stalks,
}

/// Every word in `all` and at least one of `any` (if non-empty) must appear.
struct NamePattern {
    model: MozaModel,
    all: &'static [&'static str],
    any: &'static [&'static str],
}

// Ordered: the first match wins, so "wheel and pedals" bundles stay bases.
const NAME_PATTERNS: &[NamePattern] = &[
    NamePattern {
        model: MozaModel::Wheelbase,
        all: &["gudsen"],
        any: &[" base", "racing wheel"],
    },
    NamePattern {
        model: MozaModel::Pedals,
        all: &["pedals"],
        any: &["srp", "sr-p", "crp"],
    },
    NamePattern {
        model: MozaModel::Handbrake,
        all: &["hbp", "handbrake"],
        any: &[],
    },
    NamePattern {
        model: MozaModel::HPatternShifter,
        all: &["hgp", "shifter"],
        any: &[],
    },
    NamePattern {
        model: MozaModel::SequentialShifter,
        all: &["sgp", "shifter"],
        any: &[],
    },
    NamePattern {
        model: MozaModel::Hub,
        all: &["universal hub"],
        any: &[],
    },
    NamePattern {
        model: MozaModel::Stalks,
        all: &["moza", "stalk"],
        any: &[],
    },
];

impl NamePattern {
    fn matches(&self, lowered: &str) -> bool {
        self.all.iter().all(|w| lowered.contains(w))
            && (self.any.is_empty() || self.any.iter().any(|w| lowered.contains(w)))
    }
}

impl MozaModel {
    pub fn from_product_id(pid: u16) -> Option<Self> {
        use product_ids::*;
        match pid {
            SR_P_PEDALS => Some(Self::Pedals),
            HGP_SHIFTER => Some(Self::HPatternShifter),
            SGP_SHIFTER => Some(Self::SequentialShifter),
            HBP_HANDBRAKE => Some(Self::Handbrake),
            p if matches!(p & !V2_FLAG, R16_R21_V1 | R9_V1 | R5_V1 | R3_V1 | R12_V1) => {
                Some(Self::Wheelbase)
            }
            _ => None,
        }
    }

    pub fn from_product_name(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        NAME_PATTERNS
            .iter()
            .find(|p| p.matches(&lowered))
            .map(|p| p.model)
    }

    /// Standalone peripherals that games tend to skip unless re-exposed
    /// through a joystick-class virtual device. Stalks need one to carry
    /// their rewritten switch output.
    pub fn needs_virtual_device(self) -> bool {
        matches!(
            self,
            Self::Pedals
                | Self::Handbrake
                | Self::HPatternShifter
                | Self::SequentialShifter
                | Self::Stalks
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wheelbase => "wheelbase",
            Self::Pedals => "pedals",
            Self::Handbrake => "handbrake",
            Self::HPatternShifter => "h-pattern-shifter",
            Self::SequentialShifter => "sequential-shifter",
            Self::Hub => "hub",
            Self::Stalks => "stalks",
        }
    }
}

/// True for any product string the vendor's peripherals are known to use.
pub fn is_moza_device(name: &str) -> bool {
    MozaModel::from_product_name(name).is_some()
}

/// Resolves a model for an enumerated device: VID/PID table first, then the
/// product-name patterns. Non-Moza VIDs only match by name (hubs and
/// rebadged peripherals).
pub fn identify_model(info: &HidDeviceInfo) -> Option<MozaModel> {
    if info.vendor_id == MOZA_VENDOR_ID
        && let Some(model) = MozaModel::from_product_id(info.product_id)
    {
        return Some(model);
    }
    info.product_name
        .as_deref()
        .and_then(MozaModel::from_product_name)
}
