//! Axis update-rate limiting for bus publication.

use std::time::{Duration, Instant};

use openracing_errors::DeviceError;

pub const MAX_UPDATE_RATE_HZ: u16 = 1000;
pub const DEFAULT_UPDATE_RATE_HZ: u16 = 120;

/// Lets at most `rate_hz` axis updates through per second. A rate of 0
/// disables limiting.
#[derive(Debug, Clone)]
pub struct UpdateRateLimiter {
    rate_hz: u16,
    last: Option<Instant>,
}

impl UpdateRateLimiter {
    pub fn new(rate_hz: u16) -> Result<Self, DeviceError> {
        let mut limiter = Self {
            rate_hz: DEFAULT_UPDATE_RATE_HZ,
            last: None,
        };
        limiter.set_rate(rate_hz)?;
        Ok(limiter)
    }

    pub fn rate(&self) -> u16 {
        self.rate_hz
    }

    /// # Errors
    ///
    /// `InvalidSetting` above [`MAX_UPDATE_RATE_HZ`]; the previous rate is kept.
    pub fn set_rate(&mut self, rate_hz: u16) -> Result<(), DeviceError> {
        if rate_hz > MAX_UPDATE_RATE_HZ {
            return Err(DeviceError::InvalidSetting {
                field: "update_rate_hz",
                value: u32::from(rate_hz),
                min: 0,
                max: u32::from(MAX_UPDATE_RATE_HZ),
            });
        }
        self.rate_hz = rate_hz;
        Ok(())
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.rate_hz > 0).then(|| Duration::from_secs(1) / u32::from(self.rate_hz))
    }

    /// Records an update at `now` if the interval since the last one elapsed.
    pub fn allow(&mut self, now: Instant) -> bool {
        let Some(interval) = self.interval() else {
            return true;
        };
        match self.last {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for UpdateRateLimiter {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_UPDATE_RATE_HZ,
            last: None,
        }
    }
}
