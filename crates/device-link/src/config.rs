//! Link configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use racing_wheel_moza_serial_protocol::{BAUD_RATE, MAX_WHEEL_SLOTS};
use serde::{Deserialize, Serialize};

/// Reconnection policy for a device handle that lost its stream or failed
/// identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Attempts before the handle is dropped and reported disconnected.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 4000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based): the base delay doubled per
    /// attempt, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Transport, discovery and identification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Default bound on a command awaiting its reply.
    pub request_timeout_ms: u64,
    pub identify_timeout_ms: u64,
    pub discovery_interval_ms: u64,
    pub reconnect: BackoffPolicy,
    /// Framing errors tolerated per window before a fault is raised.
    pub framing_error_threshold: usize,
    pub framing_window_ms: u64,
    pub baud_rate: u32,
    /// Blocking read bound of the serial port; also how quickly a reader
    /// notices shutdown.
    pub read_timeout_ms: u64,
    /// Remembered wheel tokens and the slot each one was given.
    pub known_wheel_tokens: BTreeMap<u8, u8>,
    /// Only list serial ports from this USB vendor; `None` lists every port.
    pub vendor_filter: Option<u16>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 500,
            identify_timeout_ms: 300,
            discovery_interval_ms: 1000,
            reconnect: BackoffPolicy::default(),
            framing_error_threshold: 32,
            framing_window_ms: 1000,
            baud_rate: BAUD_RATE,
            read_timeout_ms: 20,
            known_wheel_tokens: BTreeMap::new(),
            vendor_filter: Some(racing_wheel_hid_compat::MOZA_VENDOR_ID),
        }
    }
}

impl LinkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn framing_window(&self) -> Duration {
        Duration::from_millis(self.framing_window_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Problems that make this configuration unusable; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.request_timeout_ms == 0 {
            problems.push("request_timeout_ms must be non-zero".to_string());
        }
        if self.identify_timeout_ms == 0 {
            problems.push("identify_timeout_ms must be non-zero".to_string());
        }
        if self.read_timeout_ms == 0 {
            problems.push("read_timeout_ms must be non-zero".to_string());
        }
        if self.baud_rate == 0 {
            problems.push("baud_rate must be non-zero".to_string());
        }
        if self.framing_window_ms == 0 {
            problems.push("framing_window_ms must be non-zero".to_string());
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            problems.push(format!(
                "reconnect.base_delay_ms {} exceeds max_delay_ms {}",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            ));
        }
        for (token, slot) in &self.known_wheel_tokens {
            if *slot >= MAX_WHEEL_SLOTS {
                problems.push(format!(
                    "known_wheel_tokens: token {token:#04x} maps to slot {slot}, only {MAX_WHEEL_SLOTS} exist"
                ));
            }
        }
        problems
    }
}
