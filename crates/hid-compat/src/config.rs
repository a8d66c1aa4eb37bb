//! HID shim configuration.

use serde::{Deserialize, Serialize};

use crate::blip::BlipConfig;
use crate::compat::CompatConfig;
use crate::rate::{DEFAULT_UPDATE_RATE_HZ, MAX_UPDATE_RATE_HZ};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HidShimConfig {
    /// Axis events published per second; 0 publishes every report.
    pub update_rate_hz: u16,
    /// Re-expose peripherals flagged by the detection-fix policy through a
    /// virtual input device.
    pub detection_fix: bool,
    /// Upper bound on one blocking report read, so `stop` is noticed.
    pub read_timeout_ms: u16,
    pub blip: BlipConfig,
    pub compat: CompatConfig,
}

impl Default for HidShimConfig {
    fn default() -> Self {
        Self {
            update_rate_hz: DEFAULT_UPDATE_RATE_HZ,
            detection_fix: true,
            read_timeout_ms: 50,
            blip: BlipConfig::default(),
            compat: CompatConfig::default(),
        }
    }
}

impl HidShimConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.blip.validate();
        if self.update_rate_hz > MAX_UPDATE_RATE_HZ {
            problems.push(format!(
                "update_rate_hz {} exceeds {MAX_UPDATE_RATE_HZ}",
                self.update_rate_hz
            ));
        }
        if self.read_timeout_ms == 0 {
            problems.push("read_timeout_ms must be non-zero".to_string());
        }
        problems
    }
}
