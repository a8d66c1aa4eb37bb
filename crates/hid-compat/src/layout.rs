//! Per-model report layouts and the descriptor-derived generic layout.

use std::fmt;

use openracing_errors::DeviceError;
use openracing_hid_common::ReportDescriptor;
use openracing_hid_common::ReportField;
use openracing_hid_common::descriptor::{usage, usage_page};
use serde::{Deserialize, Serialize};

use crate::ids::MozaModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Axis {
    Steering,
    Throttle,
    Brake,
    Clutch,
    Handbrake,
    /// Unlabelled extra axis, numbered in report order.
    Aux(u8),
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steering => f.write_str("steering"),
            Self::Throttle => f.write_str("throttle"),
            Self::Brake => f.write_str("brake"),
            Self::Clutch => f.write_str("clutch"),
            Self::Handbrake => f.write_str("handbrake"),
            Self::Aux(n) => write!(f, "aux{n}"),
        }
    }
}

/// Where each logical control lives inside one input report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLayout {
    pub name: String,
    pub model: Option<MozaModel>,
    /// Report id the layout decodes; reports with another id are ignored.
    pub report_id: Option<u8>,
    pub axes: Vec<(Axis, ReportField)>,
    /// One 1-bit field per button, button `n` at index `n - 1`.
    pub buttons: Vec<ReportField>,
    pub hat: Option<ReportField>,
    pub gear: Option<ReportField>,
    /// 1-based button that counts as a downshift for throttle blips.
    pub downshift_button: Option<u16>,
    /// Left and right clutch paddle axes.
    pub clutch_paddles: Option<(Axis, Axis)>,
    /// Buttons the virtual device exposes beyond `buttons`, driven only by
    /// synthesized input.
    pub virtual_buttons: u16,
}

/// Button numbers of the multi-function stalk report.
pub mod stalks {
    /// Latched while the lever is deflected.
    pub const TURN_LEFT: u16 = 1;
    pub const TURN_RIGHT: u16 = 2;
    /// Latched push.
    pub const HIGH_BEAM: u16 = 3;
    pub const FLASH: u16 = 4;
    /// Headlight rotary from off to auto; exactly one is held.
    pub const HEADLIGHTS: [u16; 4] = [5, 6, 7, 8];
    pub const WIPER_MIST: u16 = 9;
    /// Wiper rotary from off to fast; exactly one is held.
    pub const WIPERS: [u16; 4] = [10, 11, 12, 13];
    pub const WASHER: u16 = 14;
    /// Momentary.
    pub const IGNITION: u16 = 15;
    pub const START: u16 = 16;
    pub const PHYSICAL_BUTTONS: u16 = 16;
    pub const WIPER_STEP_UP: u16 = 17;
    pub const WIPER_STEP_DOWN: u16 = 18;
}

fn u16_axis(report_id: Option<u8>, byte: u32) -> ReportField {
    ReportField {
        report_id,
        usage_page: usage_page::GENERIC_DESKTOP,
        usage: 0,
        bit_offset: byte * 8,
        bit_size: 16,
        logical_min: 0,
        logical_max: i32::from(u16::MAX),
    }
}

fn byte_field(report_id: Option<u8>, byte: u32, usage: u16) -> ReportField {
    ReportField {
        report_id,
        usage_page: usage_page::GENERIC_DESKTOP,
        usage,
        bit_offset: byte * 8,
        bit_size: 8,
        logical_min: 0,
        logical_max: i32::from(u8::MAX),
    }
}

fn button_bits(report_id: Option<u8>, first_bit: u32, count: u16) -> Vec<ReportField> {
    (0..count)
        .map(|i| ReportField {
            report_id,
            usage_page: usage_page::BUTTON,
            usage: i + 1,
            bit_offset: first_bit + u32::from(i),
            bit_size: 1,
            logical_min: 0,
            logical_max: 1,
        })
        .collect()
}

/// Wheelbase aggregated report: id 0x01, then u16 LE axes for steering,
/// throttle, brake, clutch (left paddle), handbrake and the right clutch
/// paddle, 16 bytes of buttons and a hat.
const WHEELBASE_REPORT_ID: u8 = 0x01;
const WHEELBASE_BUTTONS: u16 = 128;
const WHEELBASE_HAT_BYTE: u32 = 28;
const RIGHT_PADDLE: Axis = Axis::Aux(0);

impl ReportLayout {
    /// Fixed layout for a known model. Hubs have no fixed layout and go
    /// through [`ReportLayout::from_descriptor`].
    pub fn for_model(model: MozaModel) -> Option<Self> {
        let layout = match model {
            MozaModel::Wheelbase => {
                let id = Some(WHEELBASE_REPORT_ID);
                Self {
                    name: "moza wheelbase".to_string(),
                    model: Some(model),
                    report_id: id,
                    axes: vec![
                        (Axis::Steering, u16_axis(id, 0)),
                        (Axis::Throttle, u16_axis(id, 2)),
                        (Axis::Brake, u16_axis(id, 4)),
                        (Axis::Clutch, u16_axis(id, 6)),
                        (Axis::Handbrake, u16_axis(id, 8)),
                        (RIGHT_PADDLE, u16_axis(id, 10)),
                    ],
                    buttons: button_bits(id, 96, WHEELBASE_BUTTONS),
                    hat: Some(byte_field(id, WHEELBASE_HAT_BYTE, usage::HAT_SWITCH)),
                    gear: None,
                    downshift_button: None,
                    clutch_paddles: Some((Axis::Clutch, RIGHT_PADDLE)),
                    virtual_buttons: 0,
                }
            }
            // Standalone peripherals: byte 0 is a report id the parser
            // skips rather than matches.
            MozaModel::Pedals => Self {
                name: "moza sr-p pedals".to_string(),
                model: Some(model),
                report_id: None,
                axes: vec![
                    (Axis::Throttle, u16_axis(None, 1)),
                    (Axis::Brake, u16_axis(None, 3)),
                ],
                buttons: Vec::new(),
                hat: None,
                gear: None,
                downshift_button: None,
                clutch_paddles: None,
                virtual_buttons: 0,
            },
            MozaModel::Handbrake => Self {
                name: "moza hbp handbrake".to_string(),
                model: Some(model),
                report_id: None,
                axes: vec![(Axis::Handbrake, u16_axis(None, 1))],
                buttons: button_bits(None, 24, 1),
                hat: None,
                gear: None,
                downshift_button: None,
                clutch_paddles: None,
                virtual_buttons: 0,
            },
            MozaModel::HPatternShifter | MozaModel::SequentialShifter => Self {
                name: format!("moza {}", model.as_str()),
                model: Some(model),
                report_id: None,
                axes: Vec::new(),
                buttons: button_bits(None, 24, 8),
                hat: None,
                gear: Some(byte_field(None, 2, 0)),
                // Paddle-down is bit 5 of the button byte.
                downshift_button: (model == MozaModel::SequentialShifter).then_some(6),
                clutch_paddles: None,
                virtual_buttons: 0,
            },
            MozaModel::Stalks => Self {
                name: "moza multi-function stalks".to_string(),
                model: Some(model),
                report_id: None,
                axes: Vec::new(),
                buttons: button_bits(None, 8, stalks::PHYSICAL_BUTTONS),
                hat: None,
                gear: None,
                downshift_button: None,
                clutch_paddles: None,
                virtual_buttons: 2,
            },
            MozaModel::Hub => return None,
        };
        Some(layout)
    }

    /// Generic layout for any peripheral, derived from its report
    /// descriptor. Desktop X/Y/Z/Rx/Ry and the simulation steering and
    /// pedal usages get named axes; everything else becomes `Aux(n)`.
    pub fn from_descriptor(name: &str, desc: &ReportDescriptor) -> Result<Self, DeviceError> {
        let report_id = desc
            .fields
            .iter()
            .find(|f| f.is_axis() || f.is_button())
            .map(|f| f.report_id)
            .ok_or_else(|| DeviceError::UnsupportedLayout(name.to_string()))?;

        let mut axes: Vec<(Axis, ReportField)> = Vec::new();
        let mut aux: u8 = 0;
        for field in desc.axes().filter(|f| f.report_id == report_id) {
            let named = match (field.usage_page, field.usage) {
                (usage_page::SIMULATION, usage::STEERING) | (usage_page::GENERIC_DESKTOP, usage::X) => {
                    Some(Axis::Steering)
                }
                (usage_page::SIMULATION, usage::ACCELERATOR) | (usage_page::GENERIC_DESKTOP, usage::Y) => {
                    Some(Axis::Throttle)
                }
                (usage_page::SIMULATION, usage::BRAKE) | (usage_page::GENERIC_DESKTOP, usage::Z) => {
                    Some(Axis::Brake)
                }
                (usage_page::SIMULATION, usage::CLUTCH) | (usage_page::GENERIC_DESKTOP, usage::RX) => {
                    Some(Axis::Clutch)
                }
                (usage_page::GENERIC_DESKTOP, usage::RY) => Some(Axis::Handbrake),
                _ => None,
            };
            let axis = match named {
                Some(a) if !axes.iter().any(|(taken, _)| *taken == a) => a,
                _ => {
                    let a = Axis::Aux(aux);
                    aux = aux.saturating_add(1);
                    a
                }
            };
            axes.push((axis, field.clone()));
        }

        let buttons: Vec<ReportField> = desc
            .buttons()
            .filter(|f| f.report_id == report_id && f.bit_size == 1)
            .cloned()
            .collect();
        let hat = desc.hats().find(|f| f.report_id == report_id).cloned();

        if axes.is_empty() && buttons.is_empty() {
            return Err(DeviceError::UnsupportedLayout(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            model: None,
            report_id,
            axes,
            buttons,
            hat,
            gear: None,
            downshift_button: None,
            clutch_paddles: None,
            virtual_buttons: 0,
        })
    }

    /// Shortest report (id byte included) that carries every field.
    pub fn min_report_len(&self) -> usize {
        let fields = self
            .axes
            .iter()
            .map(|(_, f)| f)
            .chain(self.buttons.iter())
            .chain(self.hat.iter())
            .chain(self.gear.iter());
        let bits = fields
            .map(|f| f.bit_offset.saturating_add(f.bit_size))
            .max()
            .unwrap_or(0);
        let bytes = usize::try_from(bits.div_ceil(8)).unwrap_or(usize::MAX);
        bytes.saturating_add(usize::from(self.report_id.is_some()))
    }

    pub fn has_axis(&self, axis: Axis) -> bool {
        self.axes.iter().any(|(a, _)| *a == axis)
    }
}
