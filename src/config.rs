//! Configuration System using Figment
//!
//! Strongly-typed configuration for scans and tuning. Configuration is loaded from:
//! 1. A TOML file (default `config/daq_tune.toml`, missing file means all defaults)
//! 2. Environment variables prefixed with `DAQ_TUNE_`, nested with `__`
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use daq_tune::config::TuneConfig;
//!
//! // DAQ_TUNE_TUNER__PASS_MAX=3 overrides [tuner] pass_max
//! let config = TuneConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Example file
//! ```toml
//! [application]
//! name = "daq-tune"
//! log_level = "info"
//!
//! [scan]
//! poll_interval_s = 0.001
//! phase_timeout_s = 60.0      # 0 disables stall detection
//! running_stream = "primary"  # "" disables the stream
//! final_array_stream = ""
//! device_settings_stream = "settings"
//!
//! [tuner]
//! width = 1.0
//! num_points = 10
//! peak_choice = "cen"
//! step_factor = 4.0
//! pass_max = 6
//! snake = true
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppResult, DaqError};
use crate::scan::monitor::{ScanMonitorConfig, MAX_POLL_INTERVAL_S};
use crate::tuner::PeakChoice;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_tune.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_TUNE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scan monitor settings
    #[serde(default)]
    pub scan: ScanSettings,
    /// Axis tuner settings
    #[serde(default)]
    pub tuner: TunerSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// `[scan]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Poll loop sleep, seconds, within [0, 0.1]
    #[serde(default = "default_scan_poll_interval")]
    pub poll_interval_s: f64,
    /// Phase inactivity timeout, seconds; 0 disables stall detection
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_s: f64,
    /// Row stream name; empty disables
    #[serde(default = "default_running_stream")]
    pub running_stream: String,
    /// Final array stream name; empty disables
    #[serde(default)]
    pub final_array_stream: String,
    /// Device settings stream name; empty disables
    #[serde(default = "default_settings_stream")]
    pub device_settings_stream: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            poll_interval_s: default_scan_poll_interval(),
            phase_timeout_s: default_phase_timeout(),
            running_stream: default_running_stream(),
            final_array_stream: String::new(),
            device_settings_stream: default_settings_stream(),
        }
    }
}

impl ScanSettings {
    /// Monitor configuration equivalent to these settings
    pub fn monitor_config(&self) -> ScanMonitorConfig {
        fn stream(name: &str) -> Option<String> {
            let name = name.trim();
            (!name.is_empty()).then(|| name.to_string())
        }
        ScanMonitorConfig {
            poll_interval_s: self.poll_interval_s,
            phase_timeout_s: (self.phase_timeout_s != 0.0).then_some(self.phase_timeout_s),
            running_stream: stream(&self.running_stream),
            final_array_stream: stream(&self.final_array_stream),
            device_settings_stream: stream(&self.device_settings_stream),
        }
    }
}

/// `[tuner]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerSettings {
    /// Width of the first pass
    #[serde(default = "default_width")]
    pub width: f64,
    /// Points per pass
    #[serde(default = "default_num_points")]
    pub num_points: usize,
    /// "cen" or "com"
    #[serde(default = "default_peak_choice")]
    pub peak_choice: String,
    /// Width divisor between passes
    #[serde(default = "default_step_factor")]
    pub step_factor: f64,
    /// Maximum passes per multi-pass tune
    #[serde(default = "default_pass_max")]
    pub pass_max: usize,
    /// Alternate scan direction between passes
    #[serde(default = "default_snake")]
    pub snake: bool,
    /// Max/min response ratio that counts as a peak
    #[serde(default = "default_peak_ratio")]
    pub peak_ratio: f64,
    /// Status poll interval while waiting on moves and triggers
    #[serde(default = "default_tuner_poll_interval")]
    pub poll_interval_ms: u64,
    /// Give up on a move after this many seconds
    #[serde(default)]
    pub move_timeout_s: Option<f64>,
    /// Give up on a trigger after this many seconds
    #[serde(default)]
    pub trigger_timeout_s: Option<f64>,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            num_points: default_num_points(),
            peak_choice: default_peak_choice(),
            step_factor: default_step_factor(),
            pass_max: default_pass_max(),
            snake: default_snake(),
            peak_ratio: default_peak_ratio(),
            poll_interval_ms: default_tuner_poll_interval(),
            move_timeout_s: None,
            trigger_timeout_s: None,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "daq-tune".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scan_poll_interval() -> f64 {
    0.001
}

fn default_phase_timeout() -> f64 {
    60.0
}

fn default_running_stream() -> String {
    "primary".to_string()
}

fn default_settings_stream() -> String {
    "settings".to_string()
}

fn default_width() -> f64 {
    1.0
}

fn default_num_points() -> usize {
    10
}

fn default_peak_choice() -> String {
    "cen".to_string()
}

fn default_step_factor() -> f64 {
    4.0
}

fn default_pass_max() -> usize {
    6
}

fn default_snake() -> bool {
    true
}

fn default_peak_ratio() -> f64 {
    4.0
}

fn default_tuner_poll_interval() -> u64 {
    10
}

impl TuneConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `DAQ_TUNE_`.
    /// Example: `DAQ_TUNE_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// Load from `path` and validate, as one fallible step
    pub fn load_validated<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Self::load_from(path)?;
        config.validate().map_err(DaqError::Configuration)?;
        Ok(config)
    }

    /// Provider stack used by [`load_from`](Self::load_from)
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let scan = &self.scan;
        if !(0.0..=MAX_POLL_INTERVAL_S).contains(&scan.poll_interval_s) {
            return Err(format!(
                "Invalid scan.poll_interval_s {}. Must be within [0, {}]",
                scan.poll_interval_s, MAX_POLL_INTERVAL_S
            ));
        }
        if !(scan.phase_timeout_s.is_finite() && scan.phase_timeout_s >= 0.0) {
            return Err(format!(
                "Invalid scan.phase_timeout_s {}. Must be >= 0 (0 disables)",
                scan.phase_timeout_s
            ));
        }

        // Duplicate stream names are allowed but usually a mistake
        let mut names = HashSet::new();
        for name in [
            &scan.running_stream,
            &scan.final_array_stream,
            &scan.device_settings_stream,
        ] {
            if !name.trim().is_empty() && !names.insert(name.trim()) {
                warn!(stream = %name, "scan stream name used more than once");
            }
        }

        let tuner = &self.tuner;
        if !tuner.width.is_finite() {
            return Err(format!("Invalid tuner.width {}. Must be finite", tuner.width));
        }
        if tuner.num_points < 2 {
            return Err(format!(
                "Invalid tuner.num_points {}. Must be >= 2",
                tuner.num_points
            ));
        }
        tuner
            .peak_choice
            .parse::<PeakChoice>()
            .map_err(|e| e.to_string())?;
        if !(tuner.step_factor.is_finite() && tuner.step_factor > 1.0) {
            return Err(format!(
                "Invalid tuner.step_factor {}. Must be > 1",
                tuner.step_factor
            ));
        }
        if tuner.pass_max == 0 {
            return Err("Invalid tuner.pass_max 0. Must be >= 1".to_string());
        }
        if !(tuner.peak_ratio.is_finite() && tuner.peak_ratio > 0.0) {
            return Err(format!(
                "Invalid tuner.peak_ratio {}. Must be > 0",
                tuner.peak_ratio
            ));
        }
        for (field, timeout) in [
            ("move_timeout_s", tuner.move_timeout_s),
            ("trigger_timeout_s", tuner.trigger_timeout_s),
        ] {
            if let Some(t) = timeout {
                if !(t.is_finite() && t > 0.0) || Duration::try_from_secs_f64(t).is_err() {
                    return Err(format!("Invalid tuner.{} {}. Must be > 0", field, t));
                }
            }
        }

        Ok(())
    }
}
