//! Axis tuning.
//!
//! A tune pass scans one axis across a window centred on its current position,
//! reading a response signal at each point, and moves the axis to the peak when
//! one is found. Passes can be chained with a shrinking window.
//!
//! - [`axis`]: [`TuneAxis`], one pass per call
//! - [`multi_pass`]: repeated passes with a shrinking, optionally alternating width
//! - [`tunable`]: an axis that owns its tuner plus pre/post hooks, and [`tune_axes`]
//!
//! "No peak" is a normal outcome, reported as `tune_ok == false`. Only
//! configuration mistakes and device or sink faults are errors.

pub mod axis;
pub mod multi_pass;
pub mod tunable;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::peak_stats::PeakSummary;

pub use axis::TuneAxis;
pub use multi_pass::{MultiPassOptions, MultiPassState};
pub use tunable::{tune_axes, AxisTuneReport, LogPositionHook, TunableAxis, TuneHook};

/// Default response ratio for [`MaxMinRatio`].
pub const DEFAULT_PEAK_RATIO: f64 = 4.0;

/// Which estimator locates the peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PeakChoice {
    /// Center of the half-maximum crossings
    #[default]
    #[serde(rename = "cen")]
    Centroid,
    /// Center of mass above the minimum
    #[serde(rename = "com")]
    CenterOfMass,
}

impl PeakChoice {
    /// Pick this estimator from a summary
    pub fn select(self, summary: &PeakSummary) -> Option<f64> {
        match self {
            PeakChoice::Centroid => summary.cen,
            PeakChoice::CenterOfMass => summary.com,
        }
    }

    /// Short name used in configuration and metadata
    pub fn as_str(self) -> &'static str {
        match self {
            PeakChoice::Centroid => "cen",
            PeakChoice::CenterOfMass => "com",
        }
    }
}

impl fmt::Display for PeakChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeakChoice {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cen" => Ok(PeakChoice::Centroid),
            "com" => Ok(PeakChoice::CenterOfMass),
            other => Err(DaqError::Configuration(format!(
                "peak_choice must be \"cen\" or \"com\", got \"{}\"",
                other
            ))),
        }
    }
}

/// Decides whether a completed scan saw a peak.
pub trait PeakDetector: Send + Sync {
    /// `true` if the samples contain a peak worth moving to
    fn peak_detected(&self, summary: &PeakSummary) -> bool;
}

/// Peak when the largest response exceeds `ratio` times the smallest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxMinRatio {
    /// Required max/min ratio (strictly exceeded)
    pub ratio: f64,
}

impl Default for MaxMinRatio {
    fn default() -> Self {
        Self {
            ratio: DEFAULT_PEAK_RATIO,
        }
    }
}

impl PeakDetector for MaxMinRatio {
    fn peak_detected(&self, summary: &PeakSummary) -> bool {
        match (summary.max, summary.min) {
            (Some((_, ymax)), Some((_, ymin))) => ymax > self.ratio * ymin,
            _ => false,
        }
    }
}

impl<F> PeakDetector for F
where
    F: Fn(&PeakSummary) -> bool + Send + Sync,
{
    fn peak_detected(&self, summary: &PeakSummary) -> bool {
        self(summary)
    }
}

/// Parameters of one pass.
///
/// `width` may be negative to scan from high to low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneRequest {
    /// Full scan window
    pub width: f64,
    /// Points in the window, at least 2
    pub num_points: usize,
    /// Estimator used to locate the peak
    pub peak_choice: PeakChoice,
}

impl TuneRequest {
    /// Build a request, parsing `peak_choice` ("cen" or "com").
    pub fn new(width: f64, num_points: usize, peak_choice: &str) -> AppResult<Self> {
        let request = Self {
            width,
            num_points,
            peak_choice: peak_choice.parse()?,
        };
        request.validate()?;
        Ok(request)
    }

    /// Reject malformed requests.
    pub fn validate(&self) -> AppResult<()> {
        if !self.width.is_finite() {
            return Err(DaqError::Configuration(format!(
                "width must be finite, got {}",
                self.width
            )));
        }
        if self.num_points < 2 {
            return Err(DaqError::Configuration(format!(
                "num_points must be >= 2, got {}",
                self.num_points
            )));
        }
        Ok(())
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneResult {
    /// Whether a peak was found and the axis moved to it
    pub tune_ok: bool,
    /// Axis position before the pass
    pub initial_position: f64,
    /// Position the axis was sent to at the end of the pass
    pub final_position: f64,
    /// Peak location, when one was found
    pub center: Option<f64>,
    /// Scan window used
    pub width: f64,
    /// Points requested
    pub num_points: usize,
    /// Estimator used
    pub peak_choice: PeakChoice,
    /// Whether a move or trigger timed out and cut the scan short
    pub timed_out: bool,
    /// Statistics of the samples taken
    pub stats: PeakSummary,
}

/// `num` evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| if i == num - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}
