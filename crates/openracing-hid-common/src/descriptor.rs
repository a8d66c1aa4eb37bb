//! USB HID report-descriptor parsing.
//!
//! Only the input side is modelled: every `Input` main item becomes one
//! [`ReportField`] per reported value, with its bit position inside the
//! report (report-id byte excluded). Output and feature items are skipped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::report_parser::{extract_bits, sign_extend};
use crate::{HidCommonError, HidCommonResult};

pub mod usage_page {
    pub const GENERIC_DESKTOP: u16 = 0x01;
    pub const SIMULATION: u16 = 0x02;
    pub const BUTTON: u16 = 0x09;
    /// Pages at or above this value are vendor-defined.
    pub const VENDOR_DEFINED_MIN: u16 = 0xFF00;
}

pub mod usage {
    // Generic desktop page.
    pub const POINTER: u16 = 0x01;
    pub const MOUSE: u16 = 0x02;
    pub const JOYSTICK: u16 = 0x04;
    pub const GAMEPAD: u16 = 0x05;
    pub const KEYBOARD: u16 = 0x06;
    pub const MULTI_AXIS: u16 = 0x08;
    pub const X: u16 = 0x30;
    pub const Y: u16 = 0x31;
    pub const Z: u16 = 0x32;
    pub const RX: u16 = 0x33;
    pub const RY: u16 = 0x34;
    pub const RZ: u16 = 0x35;
    pub const SLIDER: u16 = 0x36;
    pub const DIAL: u16 = 0x37;
    pub const WHEEL: u16 = 0x38;
    pub const HAT_SWITCH: u16 = 0x39;

    // Simulation controls page.
    pub const ACCELERATOR: u16 = 0xC4;
    pub const BRAKE: u16 = 0xC5;
    pub const CLUTCH: u16 = 0xC6;
    pub const STEERING: u16 = 0xC8;
}

const MAX_FIELDS: usize = 4096;
const MAX_REPORT_COUNT: u32 = 1024;
const MAX_STACK_DEPTH: usize = 16;

const INPUT_CONSTANT: u32 = 0x01;
const INPUT_VARIABLE: u32 = 0x02;
const COLLECTION_APPLICATION: u32 = 0x01;

/// One value carried by an input report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportField {
    pub report_id: Option<u8>,
    pub usage_page: u16,
    pub usage: u16,
    pub bit_offset: u32,
    pub bit_size: u32,
    pub logical_min: i32,
    pub logical_max: i32,
}

impl ReportField {
    pub fn is_button(&self) -> bool {
        self.usage_page == usage_page::BUTTON
    }

    pub fn is_hat(&self) -> bool {
        self.usage_page == usage_page::GENERIC_DESKTOP && self.usage == usage::HAT_SWITCH
    }

    /// Multi-bit value on a desktop, simulation or vendor page.
    pub fn is_axis(&self) -> bool {
        !self.is_button() && !self.is_hat() && self.bit_size > 1
    }

    fn is_signed(&self) -> bool {
        self.logical_min < 0
    }

    /// Raw value of this field in `report`. Reports for descriptors with
    /// report ids carry the id in byte 0; a report with a different id
    /// yields `None`.
    pub fn extract(&self, report: &[u8]) -> Option<i32> {
        let data = match self.report_id {
            Some(id) => match report.split_first() {
                Some((first, rest)) if *first == id => rest,
                _ => return None,
            },
            None => report,
        };
        let raw = extract_bits(data, self.bit_offset, self.bit_size)?;
        if self.is_signed() {
            Some(sign_extend(raw, self.bit_size))
        } else {
            i32::try_from(raw).ok()
        }
    }

    /// Value mapped onto `0.0..=1.0` over the logical range.
    pub fn normalized(&self, report: &[u8]) -> Option<f32> {
        let value = self.extract(report)?;
        let span = i64::from(self.logical_max) - i64::from(self.logical_min);
        if span <= 0 {
            return None;
        }
        let offset = i64::from(value) - i64::from(self.logical_min);
        Some((offset as f64 / span as f64).clamp(0.0, 1.0) as f32)
    }
}

/// Parsed input layout of one HID interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDescriptor {
    /// `(usage page, usage)` of the first application collection.
    pub application: Option<(u16, u16)>,
    pub fields: Vec<ReportField>,
}

impl ReportDescriptor {
    pub fn axes(&self) -> impl Iterator<Item = &ReportField> {
        self.fields.iter().filter(|f| f.is_axis())
    }

    pub fn buttons(&self) -> impl Iterator<Item = &ReportField> {
        self.fields.iter().filter(|f| f.is_button())
    }

    pub fn hats(&self) -> impl Iterator<Item = &ReportField> {
        self.fields.iter().filter(|f| f.is_hat())
    }

    pub fn uses_report_ids(&self) -> bool {
        self.fields.iter().any(|f| f.report_id.is_some())
    }

    /// Application collection is a joystick, gamepad or multi-axis controller.
    pub fn is_game_controller(&self) -> bool {
        matches!(
            self.application,
            Some((usage_page::GENERIC_DESKTOP, usage::JOYSTICK | usage::GAMEPAD | usage::MULTI_AXIS))
        )
    }

    /// Input report size in bytes for `report_id`, id byte included.
    pub fn report_len(&self, report_id: Option<u8>) -> usize {
        let bits = self
            .fields
            .iter()
            .filter(|f| f.report_id == report_id)
            .map(|f| f.bit_offset.saturating_add(f.bit_size))
            .max()
            .unwrap_or(0);
        let bytes = usize::try_from(bits.div_ceil(8)).unwrap_or(usize::MAX);
        bytes.saturating_add(usize::from(report_id.is_some()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Globals {
    usage_page: u16,
    logical_min: i32,
    logical_max: i32,
    report_size: u32,
    report_count: u32,
    report_id: Option<u8>,
}

#[derive(Debug, Default)]
struct Locals {
    /// Each entry is `(page override, usage)`; 4-byte usages carry their page.
    usages: Vec<(Option<u16>, u16)>,
    usage_min: Option<u32>,
    usage_max: Option<u32>,
}

impl Locals {
    /// Usage for the `index`th value of the next main item.
    fn usage_at(&self, index: u32, page: u16) -> Option<(u16, u16)> {
        if let Some(last) = self.usages.len().checked_sub(1) {
            let i = usize::try_from(index).map_or(last, |i| i.min(last));
            return self
                .usages
                .get(i)
                .map(|(p, u)| (p.unwrap_or(page), *u));
        }
        let min = self.usage_min?;
        let max = self.usage_max.unwrap_or(min);
        let usage = min.saturating_add(index).min(max);
        u16::try_from(usage & 0xFFFF).ok().map(|u| (page, u))
    }

    fn first(&self, page: u16) -> Option<(u16, u16)> {
        self.usage_at(0, page)
    }
}

fn item_data(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (u32::from(*b) << (i * 8)))
}

fn invalid(message: String) -> HidCommonError {
    HidCommonError::InvalidDescriptor(message)
}

/// Parses a raw report descriptor.
///
/// # Errors
///
/// `InvalidDescriptor` on truncated items, unbalanced collections or
/// push/pop, and descriptors declaring an unreasonable number of fields.
pub fn parse_report_descriptor(bytes: &[u8]) -> HidCommonResult<ReportDescriptor> {
    let mut out = ReportDescriptor::default();
    let mut globals = Globals::default();
    let mut stack: Vec<Globals> = Vec::new();
    let mut locals = Locals::default();
    let mut offsets: BTreeMap<Option<u8>, u32> = BTreeMap::new();
    let mut depth: usize = 0;
    let mut pos: usize = 0;

    while let Some(&prefix) = bytes.get(pos) {
        if prefix == 0xFE {
            // Long item: [0xFE][size][tag][data...]
            let size = bytes
                .get(pos.saturating_add(1))
                .ok_or_else(|| invalid(format!("truncated long item at {pos}")))?;
            pos = pos.saturating_add(3).saturating_add(usize::from(*size));
            if pos > bytes.len() {
                return Err(invalid("truncated long item".to_string()));
            }
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => usize::from(n),
        };
        let start = pos.saturating_add(1);
        let end = start.saturating_add(size);
        let raw = bytes
            .get(start..end)
            .ok_or_else(|| invalid(format!("truncated item {prefix:#04x} at {pos}")))?;
        let data = item_data(raw);
        let signed = if size == 0 {
            0
        } else {
            sign_extend(data, u32::try_from(size * 8).unwrap_or(32))
        };
        pos = end;

        match prefix & 0xFC {
            // Main items
            0x80 => {
                let offset = offsets.entry(globals.report_id).or_insert(0);
                if globals.report_count > MAX_REPORT_COUNT {
                    return Err(invalid(format!(
                        "report count {} exceeds {MAX_REPORT_COUNT}",
                        globals.report_count
                    )));
                }
                let is_data = data & INPUT_CONSTANT == 0;
                let is_variable = data & INPUT_VARIABLE != 0;
                let has_usage = !locals.usages.is_empty() || locals.usage_min.is_some();
                for index in 0..globals.report_count {
                    if is_data && is_variable && has_usage {
                        if let Some((page, usage)) = locals.usage_at(index, globals.usage_page) {
                            if out.fields.len() >= MAX_FIELDS {
                                return Err(invalid(format!("more than {MAX_FIELDS} fields")));
                            }
                            out.fields.push(ReportField {
                                report_id: globals.report_id,
                                usage_page: page,
                                usage,
                                bit_offset: *offset,
                                bit_size: globals.report_size,
                                logical_min: globals.logical_min,
                                logical_max: globals.logical_max,
                            });
                        }
                    }
                    *offset = offset.saturating_add(globals.report_size);
                }
                locals = Locals::default();
            }
            0x90 | 0xB0 => locals = Locals::default(),
            0xA0 => {
                if data == COLLECTION_APPLICATION && out.application.is_none() {
                    out.application = locals.first(globals.usage_page);
                }
                depth = depth.saturating_add(1);
                locals = Locals::default();
            }
            0xC0 => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid(format!("unbalanced end collection at {pos}")))?;
                locals = Locals::default();
            }

            // Global items
            0x04 => globals.usage_page = u16::try_from(data & 0xFFFF).unwrap_or(0),
            0x14 => globals.logical_min = signed,
            0x24 => {
                // Devices routinely declare an unsigned maximum in a short
                // item whose top bit is set.
                globals.logical_max = if signed < globals.logical_min {
                    i32::try_from(data).unwrap_or(i32::MAX)
                } else {
                    signed
                };
            }
            0x74 => globals.report_size = data.min(32),
            0x84 => globals.report_id = u8::try_from(data).ok(),
            0x94 => globals.report_count = data,
            0xA4 => {
                if stack.len() >= MAX_STACK_DEPTH {
                    return Err(invalid("push stack overflow".to_string()));
                }
                stack.push(globals);
            }
            0xB4 => {
                globals = stack
                    .pop()
                    .ok_or_else(|| invalid(format!("pop without push at {pos}")))?;
            }

            // Local items
            0x08 => {
                let page = (size == 4).then(|| u16::try_from(data >> 16).unwrap_or(0));
                locals
                    .usages
                    .push((page, u16::try_from(data & 0xFFFF).unwrap_or(0)));
            }
            0x18 => locals.usage_min = Some(data),
            0x28 => locals.usage_max = Some(data),

            // Physical ranges, units, strings, designators, delimiters.
            _ => {}
        }
    }

    if depth != 0 {
        return Err(invalid(format!("{depth} collection(s) left open")));
    }
    Ok(out)
}
