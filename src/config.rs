//! Strongly-typed configuration loading via figment.
//!
//! Configuration is merged from:
//! 1. a TOML file (`photodiag.toml` by default)
//! 2. environment variables prefixed with `PHOTODIAG_`
//!    (e.g. `PHOTODIAG_APPLICATION_LOG_LEVEL=debug`)
//!
//! `load` only extracts; call [`Config::validate`] before using the values.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, PhotodiagError};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Acquisition and refresh settings.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Calibration scan settings.
    #[serde(default)]
    pub scan: ScanConfig,
    /// Detector definitions.
    pub devices: Vec<DeviceConfig>,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Acquisition and refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Ring buffer capacity in records.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Refresh cadence of the panel summaries.
    #[serde(with = "humantime_serde", default = "default_refresh_period")]
    pub refresh_period: Duration,
    /// Upper bound on a single blocking receive.
    #[serde(with = "humantime_serde", default = "default_receive_timeout")]
    pub receive_timeout: Duration,
    /// Minimum snapshot size before statistics are computed.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            refresh_period: default_refresh_period(),
            receive_timeout: default_receive_timeout(),
            min_samples: default_min_samples(),
        }
    }
}

/// Calibration scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Lower end of the scan range.
    #[serde(default = "default_range_low")]
    pub range_low: f64,
    /// Upper end of the scan range.
    #[serde(default = "default_range_high")]
    pub range_high: f64,
    /// Number of scan positions (inclusive of both ends).
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    /// Pulses acquired per scan point.
    #[serde(default = "default_num_shots")]
    pub num_shots: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            range_low: default_range_low(),
            range_high: default_range_high(),
            num_steps: default_num_steps(),
            num_shots: default_num_shots(),
        }
    }
}

impl ScanConfig {
    /// Evenly spaced scan positions over the configured range.
    pub fn positions(&self) -> Vec<f64> {
        if self.num_steps < 2 {
            return vec![self.range_low];
        }
        let step = (self.range_high - self.range_low) / (self.num_steps - 1) as f64;
        (0..self.num_steps)
            .map(|i| self.range_low + step * i as f64)
            .collect()
    }
}

/// Diode data channels of one detector, in record order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiodeConfig {
    /// Bottom diode channel.
    pub down: String,
    /// Top diode channel.
    pub up: String,
    /// Right diode channel.
    pub right: String,
    /// Left diode channel.
    pub left: String,
}

/// One position-sensitive detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Record name, e.g. `SAROP11-PBPS110`.
    pub name: String,
    /// Processing pipeline instance; defaults to `<name>_proc`.
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Diode data channels.
    pub diodes: DiodeConfig,
}

impl DeviceConfig {
    /// Full channel name for a record suffix, e.g. `channel("XPOS")`.
    pub fn channel(&self, suffix: &str) -> String {
        format!("{}:{}", self.name, suffix)
    }

    /// Record prefix including the trailing colon.
    pub fn prefix(&self) -> String {
        format!("{}:", self.name)
    }

    /// Pipeline instance name.
    pub fn pipeline_name(&self) -> String {
        self.pipeline
            .clone()
            .unwrap_or_else(|| format!("{}_proc", self.name))
    }
}

fn default_buffer_capacity() -> usize {
    100
}

fn default_refresh_period() -> Duration {
    Duration::from_secs(1)
}

fn default_receive_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_min_samples() -> usize {
    3
}

fn default_range_low() -> f64 {
    -0.3
}

fn default_range_high() -> f64 {
    0.3
}

fn default_num_steps() -> usize {
    3
}

fn default_num_shots() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "photodiag".to_string(),
                log_level: "info".to_string(),
            },
            acquisition: AcquisitionConfig::default(),
            scan: ScanConfig::default(),
            devices: vec![DeviceConfig {
                name: "SAROP11-PBPS110".to_string(),
                pipeline: None,
                diodes: DiodeConfig {
                    down: "SAROP11-CVME-PBPS2:Lnk9Ch11-DATA-SUM".to_string(),
                    up: "SAROP11-CVME-PBPS2:Lnk9Ch13-DATA-SUM".to_string(),
                    right: "SAROP11-CVME-PBPS2:Lnk9Ch14-DATA-SUM".to_string(),
                    left: "SAROP11-CVME-PBPS2:Lnk9Ch15-DATA-SUM".to_string(),
                },
            }],
        }
    }
}

impl Config {
    /// Load from `photodiag.toml` plus `PHOTODIAG_` environment overrides.
    pub fn load() -> AppResult<Self> {
        Self::load_from("photodiag.toml")
    }

    /// Load from a specific TOML file plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Config = Figment::new()
            .merge(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PHOTODIAG_").split("_"))
            .extract()?;
        Ok(config)
    }

    /// Validate the loaded values.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(PhotodiagError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.acquisition.buffer_capacity == 0 {
            return Err(PhotodiagError::Configuration(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.acquisition.min_samples == 0 {
            return Err(PhotodiagError::Configuration(
                "min_samples must be at least 1".to_string(),
            ));
        }
        if self.acquisition.refresh_period.is_zero() {
            return Err(PhotodiagError::Configuration(
                "refresh_period must be non-zero".to_string(),
            ));
        }

        if self.scan.num_steps < 2 {
            return Err(PhotodiagError::Configuration(
                "scan.num_steps must be at least 2".to_string(),
            ));
        }
        if self.scan.range_low >= self.scan.range_high {
            return Err(PhotodiagError::Configuration(format!(
                "scan range [{}, {}] is empty",
                self.scan.range_low, self.scan.range_high
            )));
        }
        if self.scan.num_shots == 0 {
            return Err(PhotodiagError::Configuration(
                "scan.num_shots must be at least 1".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if !names.insert(&device.name) {
                return Err(PhotodiagError::Configuration(format!(
                    "duplicate device name: {}",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().expect("valid defaults");
        assert_eq!(config.acquisition.buffer_capacity, 100);
        assert_eq!(config.scan.num_shots, 500);
    }

    #[test]
    fn scan_positions_span_the_range_inclusively() {
        let scan = ScanConfig::default();
        let positions = scan.positions();
        assert_eq!(positions.len(), 3);
        assert_relative_eq!(positions[0], -0.3);
        assert_relative_eq!(positions[1], 0.0);
        assert_relative_eq!(positions[2], 0.3);
    }

    #[test]
    fn device_channel_helpers() {
        let device = &Config::default().devices[0];
        assert_eq!(device.channel("XPOS"), "SAROP11-PBPS110:XPOS");
        assert_eq!(device.prefix(), "SAROP11-PBPS110:");
        assert_eq!(device.pipeline_name(), "SAROP11-PBPS110_proc");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scan.num_steps = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.acquisition.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }
}
