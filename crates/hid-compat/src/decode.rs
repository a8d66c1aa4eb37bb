//! Raw report → [`DeviceEvent`].

use std::collections::BTreeMap;

use openracing_errors::DeviceError;
use serde::{Deserialize, Serialize};

use crate::layout::{Axis, ReportLayout};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisSample {
    pub axis: Axis,
    /// Normalized over the field's logical range, `0.0..=1.0`.
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonEdge {
    /// 1-based button number.
    pub button: u16,
    pub pressed: bool,
}

/// Everything that changed in one input report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub axes: Vec<AxisSample>,
    pub buttons: Vec<ButtonEdge>,
    /// Hat position 0..=7 clockwise from up, anything else is centered.
    pub hat: Option<u8>,
    pub gear: Option<u8>,
}

impl DeviceEvent {
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty() && self.buttons.is_empty() && self.hat.is_none() && self.gear.is_none()
    }

    pub fn axis(&self, axis: Axis) -> Option<f32> {
        self.axes.iter().find(|s| s.axis == axis).map(|s| s.value)
    }

    pub fn pressed(&self, button: u16) -> bool {
        self.buttons
            .iter()
            .any(|b| b.button == button && b.pressed)
    }
}

/// Stateful decoder: axis samples and button edges are reported only when
/// they differ from the previous report.
#[derive(Debug, Clone)]
pub struct InputDecoder {
    layout: ReportLayout,
    last_axes: BTreeMap<Axis, i32>,
    last_buttons: Vec<bool>,
    last_hat: Option<u8>,
    last_gear: Option<u8>,
}

impl InputDecoder {
    pub fn new(layout: ReportLayout) -> Self {
        let buttons = layout.buttons.len();
        Self {
            layout,
            last_axes: BTreeMap::new(),
            last_buttons: vec![false; buttons],
            last_hat: None,
            last_gear: None,
        }
    }

    pub fn layout(&self) -> &ReportLayout {
        &self.layout
    }

    /// Current state of button `button` (1-based).
    pub fn is_pressed(&self, button: u16) -> bool {
        usize::from(button)
            .checked_sub(1)
            .and_then(|i| self.last_buttons.get(i))
            .copied()
            .unwrap_or(false)
    }

    /// Decodes one report.
    ///
    /// # Errors
    ///
    /// `ShortReport` when the report cannot hold every field of the layout.
    /// Reports carrying a different report id decode to an empty event.
    pub fn parse_report(&mut self, report: &[u8]) -> Result<DeviceEvent, DeviceError> {
        if let Some(id) = self.layout.report_id
            && report.first() != Some(&id)
        {
            return Ok(DeviceEvent::default());
        }
        let expected = self.layout.min_report_len();
        if report.len() < expected {
            return Err(DeviceError::ShortReport {
                device: self.layout.name.clone(),
                expected,
                actual: report.len(),
            });
        }

        let mut event = DeviceEvent::default();

        for (axis, field) in &self.layout.axes {
            let Some(raw) = field.extract(report) else {
                continue;
            };
            if self.last_axes.insert(*axis, raw) == Some(raw) {
                continue;
            }
            if let Some(value) = field.normalized(report) {
                event.axes.push(AxisSample { axis: *axis, value });
            }
        }

        for (index, field) in self.layout.buttons.iter().enumerate() {
            let pressed = field.extract(report).is_some_and(|v| v != 0);
            let Some(last) = self.last_buttons.get_mut(index) else {
                continue;
            };
            if *last != pressed {
                *last = pressed;
                event.buttons.push(ButtonEdge {
                    button: u16::try_from(index + 1).unwrap_or(u16::MAX),
                    pressed,
                });
            }
        }

        if let Some(field) = &self.layout.hat {
            let hat = field.extract(report).and_then(|v| u8::try_from(v).ok());
            if hat != self.last_hat {
                self.last_hat = hat;
                event.hat = hat;
            }
        }

        if let Some(field) = &self.layout.gear {
            let gear = field.extract(report).and_then(|v| u8::try_from(v).ok());
            if gear != self.last_gear {
                self.last_gear = gear;
                event.gear = gear;
            }
        }

        Ok(event)
    }
}
