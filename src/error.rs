//! Custom error types for the orchestration core.
//!
//! This module defines the primary error type, `DaqError`, used by the scan monitor,
//! the axis tuner and their configuration layer. Using the `thiserror` crate, it
//! provides a centralized and consistent way to handle the failures that can
//! terminate an orchestration.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches.
//! - **`Configuration`**: Semantic errors in a request or configuration (poll interval
//!   out of range, unknown peak choice, fewer than two scan points). Always raised
//!   before any hardware interaction.
//! - **`Hardware`**: A device read, move, trigger or start command failed. Fatal.
//! - **`Sink`**: The data sink refused a record. Fatal, because a row would be lost.
//! - **`Io`**: Wraps standard `std::io::Error`.
//!
//! Stalls, timeouts and "no peak found" are deliberately *not* errors. They are
//! reported through [`crate::status::Status`] and [`crate::tuner::TuneResult`].

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for scan and tune orchestration.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration or request validation failed.
    ///
    /// Raised synchronously, before any device is touched.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A device operation failed.
    #[error("Hardware error on '{device}': {source}")]
    Hardware {
        /// Name of the device that failed
        device: String,
        /// Underlying driver error
        #[source]
        source: anyhow::Error,
    },

    /// The data sink failed while writing a record.
    #[error("Data sink error on stream '{stream}': {source}")]
    Sink {
        /// Stream (or run framing step) being written
        stream: String,
        /// Underlying sink error
        #[source]
        source: anyhow::Error,
    },

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Build a hardware error for the named device.
    pub fn hardware(device: impl Into<String>, source: anyhow::Error) -> Self {
        DaqError::Hardware {
            device: device.into(),
            source,
        }
    }

    /// Build a sink error for the named stream.
    pub fn sink(stream: impl Into<String>, source: anyhow::Error) -> Self {
        DaqError::Sink {
            stream: stream.into(),
            source,
        }
    }

    /// Whether this error was raised before any hardware interaction.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, DaqError::Config(_) | DaqError::Configuration(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_error_names_device() {
        let err = DaqError::hardware("stage_x", anyhow::anyhow!("limit switch"));
        let msg = err.to_string();
        assert!(msg.contains("stage_x"));
        assert!(msg.contains("limit switch"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn configuration_errors_are_flagged() {
        let err = DaqError::Configuration("num_points must be >= 2".into());
        assert!(err.is_configuration());
    }

    #[test]
    fn sink_error_names_stream() {
        let err = DaqError::sink("primary", anyhow::anyhow!("disk full"));
        match &err {
            DaqError::Sink { stream, .. } => assert_eq!(stream, "primary"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
