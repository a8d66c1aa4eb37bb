//! Daemon configuration, stored as YAML.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use racing_wheel_device_link::LinkConfig;
use racing_wheel_hid_compat::HidShimConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default tracing filter when neither `RUST_LOG` nor `--log-level` is set.
pub const DEFAULT_LOG_FILTER: &str = "racing_wheel_service=info,racing_wheel_device_link=info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub link: LinkConfig,
    pub hid: HidShimConfig,
    /// Read HID peripherals through the compatibility shim.
    pub hid_enabled: bool,
    /// Tracing filter directive, e.g. `debug` or `racing_wheel_device_link=trace`.
    pub log_level: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            hid: HidShimConfig::default(),
            hid_enabled: true,
            log_level: None,
        }
    }
}

impl ServiceConfig {
    /// `$HOME/.config/wheel/link.yaml`, or `%LOCALAPPDATA%\wheel\link.yaml`.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = if cfg!(windows) {
            PathBuf::from(
                std::env::var("LOCALAPPDATA").context("LOCALAPPDATA environment variable not set")?,
            )
        } else {
            PathBuf::from(std::env::var("HOME").context("HOME environment variable not set")?)
                .join(".config")
        };
        Ok(config_dir.join("wheel").join("link.yaml"))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        debug!(path = %path.display(), "saved config");
        Ok(())
    }

    /// Fails with every problem found, one per line.
    pub fn validate(&self) -> Result<()> {
        let mut problems = self.link.validate();
        problems.extend(self.hid.validate().into_iter().map(|p| format!("hid: {p}")));
        if problems.is_empty() {
            return Ok(());
        }
        bail!("invalid configuration:\n  {}", problems.join("\n  "))
    }

    pub fn log_filter(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn partial_yaml_fills_in_defaults() -> Result<()> {
        let config: ServiceConfig = serde_yaml::from_str(
            "link:\n  request_timeout_ms: 250\n  known_wheel_tokens:\n    161: 1\nhid:\n  update_rate_hz: 60\n",
        )?;
        assert_eq!(config.link.request_timeout_ms, 250);
        assert_eq!(config.link.identify_timeout_ms, LinkConfig::default().identify_timeout_ms);
        assert_eq!(config.link.known_wheel_tokens, BTreeMap::from([(0xA1, 1)]));
        assert_eq!(config.hid.update_rate_hz, 60);
        assert!(config.hid.detection_fix);
        assert!(config.hid_enabled);
        Ok(())
    }

    #[test]
    fn save_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("link.yaml");
        let mut config = ServiceConfig::default();
        config.link.known_wheel_tokens.insert(0xB2, 0);
        config.log_level = Some("debug".into());

        config.save_to_path(&path)?;
        assert_eq!(ServiceConfig::load_from_path(&path)?, config);
        Ok(())
    }

    #[test]
    fn invalid_values_are_listed() {
        let mut config = ServiceConfig::default();
        config.link.request_timeout_ms = 0;
        config.hid.update_rate_hz = 5000;
        let message = config.validate().err().map(|e| e.to_string()).unwrap_or_default();
        insta::assert_snapshot!(message, @r"
        invalid configuration:
          request_timeout_ms must be non-zero
          hid: update_rate_hz 5000 exceeds 1000
        ");
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = ServiceConfig::load_from_path("/nonexistent/link.yaml").err();
        assert!(err.is_some_and(|e| e.to_string().contains("/nonexistent/link.yaml")));
    }

    #[test]
    fn log_filter_falls_back_to_default() {
        let mut config = ServiceConfig::default();
        assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
        config.log_level = Some("trace".into());
        assert_eq!(config.log_filter(), "trace");
    }
}
