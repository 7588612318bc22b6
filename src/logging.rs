//! Subscriber setup for the `daq-tune` binary.
//!
//! Library code only emits `tracing` events. The binary (or an embedding
//! application) installs one subscriber here, writing to stderr so stdout stays
//! free for JSON reports. `RUST_LOG` takes precedence over the configured level.
//!
//! ```no_run
//! use daq_tune::{config::TuneConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TuneConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("tuner ready");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

use crate::config::TuneConfig;

const LEVELS: &str = "trace, debug, info, warn, error";

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored; for interactive runs
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON for log collectors
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "unknown log format '{other}', expected pretty, compact or json"
            )),
        }
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Log span open/close, useful to time tune passes
    pub span_events: bool,
    /// Colors for the pretty format
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Options at `level` with the compact format
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            span_events: false,
            ansi: true,
        }
    }

    /// Options from `[application] log_level`
    pub fn from_config(config: &TuneConfig) -> Result<Self, String> {
        parse_log_level(&config.application.log_level).map(Self::new)
    }

    /// Set the line format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open and close events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Enable or disable colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }
}

/// Install the subscriber described by `[application]`.
pub fn init_from_config(config: &TuneConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Install a global subscriber.
///
/// A subscriber that is already installed (test harness, host application) is
/// left in place and `Ok(())` is returned.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_ascii_lowercase()));
    let spans = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(spans)
        .with_target(true);

    let registry = tracing_subscriber::registry();
    let installed = match config.format {
        OutputFormat::Pretty => registry
            .with(layer.pretty().with_ansi(config.ansi).with_filter(filter))
            .try_init(),
        OutputFormat::Compact => registry
            .with(layer.compact().with_ansi(false).with_filter(filter))
            .try_init(),
        OutputFormat::Json => registry
            .with(layer.json().with_current_span(true).with_filter(filter))
            .try_init(),
    };
    tolerate_already_set(installed)
}

fn tolerate_already_set(result: Result<(), TryInitError>) -> Result<(), String> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(format!("could not install tracing subscriber: {e}")),
    }
}

/// Case-insensitive level name.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level.trim())
        .map_err(|_| format!("invalid log level '{level}', expected one of: {LEVELS}"))
}
