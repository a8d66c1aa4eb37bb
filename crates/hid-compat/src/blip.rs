//! Throttle blip on downshift.

use std::time::{Duration, Instant};

use openracing_errors::DeviceError;
use serde::{Deserialize, Serialize};

pub const MAX_BLIP_LEVEL: u8 = 100;
pub const MAX_BLIP_DURATION_MS: u16 = 1000;

/// While a blip is active the virtual throttle is held at no less than
/// `level` percent for `duration_ms`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlipConfig {
    pub enabled: bool,
    pub level: u8,
    pub duration_ms: u16,
    /// 1-based button that triggers the blip. Falls back to the layout's
    /// downshift button.
    pub trigger_button: Option<u16>,
}

/// Partial update; `None` fields are left as they are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlipUpdate {
    pub enabled: Option<bool>,
    pub level: Option<u8>,
    pub duration_ms: Option<u16>,
}

impl BlipConfig {
    /// Enabled with a non-zero level and duration.
    pub fn check(&self) -> bool {
        self.enabled && self.level > 0 && self.duration_ms > 0
    }

    /// Applies `update`. If any field is out of range nothing changes.
    pub fn apply(&mut self, update: BlipUpdate) -> Result<(), DeviceError> {
        if let Some(level) = update.level
            && level > MAX_BLIP_LEVEL
        {
            return Err(DeviceError::InvalidSetting {
                field: "blip.level",
                value: u32::from(level),
                min: 0,
                max: u32::from(MAX_BLIP_LEVEL),
            });
        }
        if let Some(duration) = update.duration_ms
            && duration > MAX_BLIP_DURATION_MS
        {
            return Err(DeviceError::InvalidSetting {
                field: "blip.duration_ms",
                value: u32::from(duration),
                min: 0,
                max: u32::from(MAX_BLIP_DURATION_MS),
            });
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(level) = update.level {
            self.level = level;
        }
        if let Some(duration) = update.duration_ms {
            self.duration_ms = duration;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.level > MAX_BLIP_LEVEL {
            problems.push(format!("blip.level {} exceeds {MAX_BLIP_LEVEL}", self.level));
        }
        if self.duration_ms > MAX_BLIP_DURATION_MS {
            problems.push(format!(
                "blip.duration_ms {} exceeds {MAX_BLIP_DURATION_MS}",
                self.duration_ms
            ));
        }
        problems
    }

    pub fn level_fraction(&self) -> f32 {
        f32::from(self.level.min(MAX_BLIP_LEVEL)) / f32::from(MAX_BLIP_LEVEL)
    }
}

/// Tracks the running blip window.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlipState {
    until: Option<Instant>,
}

impl BlipState {
    pub(crate) fn start(&mut self, config: &BlipConfig, now: Instant) -> bool {
        if !config.check() {
            return false;
        }
        self.until = now.checked_add(Duration::from_millis(u64::from(config.duration_ms)));
        self.until.is_some()
    }

    pub(crate) fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// Clears an elapsed blip; true exactly once, when it ends.
    pub(crate) fn expire(&mut self, now: Instant) -> bool {
        match self.until {
            Some(until) if now >= until => {
                self.until = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_requires_all_three() {
        let mut blip = BlipConfig::default();
        assert!(!blip.check());
        blip.enabled = true;
        blip.duration_ms = 100;
        assert!(!blip.check(), "zero level");
        blip.level = 50;
        assert!(blip.check());
        blip.duration_ms = 0;
        assert!(!blip.check(), "zero duration");
    }

    #[test]
    fn out_of_range_update_changes_nothing() {
        let mut blip = BlipConfig::default();
        let result = blip.apply(BlipUpdate {
            enabled: Some(true),
            level: Some(150),
            duration_ms: Some(200),
        });
        assert!(result.is_err());
        assert_eq!(blip, BlipConfig::default());

        assert!(
            blip.apply(BlipUpdate {
                duration_ms: Some(2000),
                ..BlipUpdate::default()
            })
            .is_err()
        );
        assert_eq!(blip.duration_ms, 0);
    }

    #[test]
    fn partial_update_keeps_other_fields() -> Result<(), DeviceError> {
        let mut blip = BlipConfig::default();
        blip.apply(BlipUpdate {
            level: Some(50),
            ..BlipUpdate::default()
        })?;
        assert!(!blip.enabled);
        assert_eq!(blip.level, 50);
        Ok(())
    }

    #[test]
    fn state_window() {
        let config = BlipConfig {
            enabled: true,
            level: 40,
            duration_ms: 100,
            trigger_button: None,
        };
        let mut state = BlipState::default();
        let t0 = Instant::now();
        assert!(state.start(&config, t0));
        assert!(state.is_active(t0 + Duration::from_millis(99)));
        assert!(!state.expire(t0 + Duration::from_millis(50)));
        assert!(state.expire(t0 + Duration::from_millis(100)));
        assert!(!state.expire(t0 + Duration::from_millis(150)));
        assert!(!state.is_active(t0 + Duration::from_millis(101)));
    }
}
