//! Input rewrites for games that expect other control semantics.
//!
//! The multi-function stalks report latched switches and rotaries as held
//! buttons. Many games bind these functions to a single toggle press, so
//! each rewrite turns switch changes into short synthesized presses. Dual
//! clutch paddles can be tied together, and H-pattern downshifts can drive
//! the throttle blip.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::decode::{AxisSample, ButtonEdge, DeviceEvent};
use crate::ids::MozaModel;
use crate::layout::{Axis, ReportLayout, stalks};

/// How long a synthesized press is held.
pub const PULSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnSignalMode {
    /// Held while the lever is deflected.
    #[default]
    Native,
    /// One press when the lever engages and one when it returns.
    Pulse,
    /// Held while deflected, then one press after it returns.
    Constant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WiperMode {
    #[default]
    Native,
    /// Each newly selected position is one press of its own button.
    Pulse,
    /// Each position moved is one press of the step-up or step-down button.
    Step,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatConfig {
    pub turn_signal: TurnSignalMode,
    /// High beam changes and newly selected headlight positions become
    /// single presses.
    pub headlights: bool,
    pub wipers: WiperMode,
    /// Each ignition press toggles a held ignition button.
    pub ignition: bool,
    /// Both clutch paddles report whichever is pulled further.
    pub paddle_sync: bool,
    /// Gear decreases on an H-pattern shifter start the throttle blip.
    pub hpattern_connected: bool,
}

/// Rewrite state for one reader.
#[derive(Debug, Default)]
pub(crate) struct CompatState {
    /// Synthesized edges waiting for their time.
    scheduled: Vec<(Instant, ButtonEdge)>,
    ignition_on: bool,
    wiper: Option<usize>,
    paddles: (f32, f32),
    engaged_gear: Option<u8>,
}

fn later(now: Instant, by: Duration) -> Instant {
    now.checked_add(by).unwrap_or(now)
}

impl CompatState {
    pub(crate) fn ignition_on(&self) -> bool {
        self.ignition_on
    }

    /// Rewrites `event` in place.
    pub(crate) fn apply(
        &mut self,
        config: &CompatConfig,
        layout: &ReportLayout,
        event: &mut DeviceEvent,
        now: Instant,
    ) {
        if layout.model == Some(MozaModel::Stalks) {
            self.rewrite_stalks(config, event, now);
        }
        if let Some(paddles) = layout.clutch_paddles {
            self.sync_paddles(config.paddle_sync, paddles, event);
        }
    }

    /// True when `event` shifts an H-pattern shifter into a lower gear.
    /// Neutral (gear 0) sits between gears and is skipped.
    pub(crate) fn is_downshift(
        &mut self,
        config: &CompatConfig,
        layout: &ReportLayout,
        event: &DeviceEvent,
    ) -> bool {
        if layout.model != Some(MozaModel::HPatternShifter) {
            return false;
        }
        let Some(gear) = event.gear.filter(|g| *g > 0) else {
            return false;
        };
        let previous = self.engaged_gear.replace(gear);
        config.hpattern_connected && previous.is_some_and(|p| gear < p)
    }

    /// Synthesized edges due at `now`, oldest first.
    pub(crate) fn due(&mut self, now: Instant) -> Vec<ButtonEdge> {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.scheduled = pending;
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, edge)| edge).collect()
    }

    fn rewrite_stalks(&mut self, config: &CompatConfig, event: &mut DeviceEvent, now: Instant) {
        for edge in std::mem::take(&mut event.buttons) {
            let ButtonEdge { button, pressed } = edge;
            match button {
                stalks::TURN_LEFT | stalks::TURN_RIGHT => match config.turn_signal {
                    TurnSignalMode::Native => event.buttons.push(edge),
                    TurnSignalMode::Pulse => self.pulse(event, button, now),
                    TurnSignalMode::Constant => {
                        event.buttons.push(edge);
                        if !pressed {
                            self.schedule_pulse(button, later(now, PULSE));
                        }
                    }
                },
                stalks::HIGH_BEAM if config.headlights => self.pulse(event, button, now),
                b if config.headlights && stalks::HEADLIGHTS.contains(&b) => {
                    if pressed {
                        self.pulse(event, button, now);
                    }
                }
                b if stalks::WIPERS.contains(&b) => {
                    self.rewrite_wiper(config.wipers, edge, event, now);
                }
                stalks::IGNITION if config.ignition => {
                    if pressed {
                        self.ignition_on = !self.ignition_on;
                        event.buttons.push(ButtonEdge {
                            button,
                            pressed: self.ignition_on,
                        });
                    }
                }
                _ => event.buttons.push(edge),
            }
        }
    }

    fn rewrite_wiper(
        &mut self,
        mode: WiperMode,
        edge: ButtonEdge,
        event: &mut DeviceEvent,
        now: Instant,
    ) {
        let previous = match stalks::WIPERS.iter().position(|b| *b == edge.button) {
            Some(position) if edge.pressed => self.wiper.replace(position),
            _ => self.wiper,
        };
        match mode {
            WiperMode::Native => event.buttons.push(edge),
            WiperMode::Pulse => {
                if edge.pressed {
                    self.pulse(event, edge.button, now);
                }
            }
            WiperMode::Step => {
                let (Some(from), Some(to)) = (previous, self.wiper) else {
                    return;
                };
                if !edge.pressed || from == to {
                    return;
                }
                let button = if to > from {
                    stalks::WIPER_STEP_UP
                } else {
                    stalks::WIPER_STEP_DOWN
                };
                let steps = u32::try_from(to.abs_diff(from)).unwrap_or(u32::MAX);
                self.pulse(event, button, now);
                // Further steps follow once the previous press is released.
                for step in 1..steps {
                    let gap = PULSE.saturating_mul(step.saturating_mul(2));
                    self.schedule_pulse(button, later(now, gap));
                }
            }
        }
    }

    /// Presses `button` now and releases it after [`PULSE`].
    fn pulse(&mut self, event: &mut DeviceEvent, button: u16, now: Instant) {
        let pending = self.scheduled.len();
        self.scheduled.retain(|(_, edge)| edge.button != button);
        if self.scheduled.len() != pending {
            event.buttons.push(ButtonEdge {
                button,
                pressed: false,
            });
        }
        event.buttons.push(ButtonEdge {
            button,
            pressed: true,
        });
        self.scheduled.push((
            later(now, PULSE),
            ButtonEdge {
                button,
                pressed: false,
            },
        ));
    }

    fn schedule_pulse(&mut self, button: u16, at: Instant) {
        self.scheduled.push((
            at,
            ButtonEdge {
                button,
                pressed: true,
            },
        ));
        self.scheduled.push((
            later(at, PULSE),
            ButtonEdge {
                button,
                pressed: false,
            },
        ));
    }

    fn sync_paddles(
        &mut self,
        enabled: bool,
        (left, right): (Axis, Axis),
        event: &mut DeviceEvent,
    ) {
        let mut moved = false;
        for sample in &event.axes {
            if sample.axis == left {
                self.paddles.0 = sample.value;
                moved = true;
            } else if sample.axis == right {
                self.paddles.1 = sample.value;
                moved = true;
            }
        }
        if !enabled || !moved {
            return;
        }
        let value = self.paddles.0.max(self.paddles.1);
        event.axes.retain(|s| s.axis != left && s.axis != right);
        event.axes.push(AxisSample { axis: left, value });
        event.axes.push(AxisSample { axis: right, value });
    }
}
