//! Peak statistics over sampled (position, response) data.
//!
//! [`PeakStats`] accumulates samples one at a time; [`PeakStats::compute`] derives
//! the estimators from everything seen so far and can be called after every
//! sample. Estimators that cannot be determined are `None`, never NaN.
//!
//! | Field       | Meaning                                                     |
//! |-------------|-------------------------------------------------------------|
//! | `min`/`max` | `(x, y)` of the first smallest / largest response           |
//! | `com`       | center of mass `Σ x·w / Σ w` with weights `w = y - min(y)`  |
//! | `crossings` | interpolated `x` where `y` crosses `(max + min) / 2`        |
//! | `cen`       | mean of the crossings                                       |
//! | `fwhm`      | distance between the first and last crossing                |
//!
//! Fewer than [`MIN_SAMPLES`] samples leave `com`, `cen` and `fwhm` undetermined.

use serde::{Deserialize, Serialize};

/// Samples required before any centroid estimator is reported.
pub const MIN_SAMPLES: usize = 3;

/// Streaming accumulator of (x, y) samples.
#[derive(Debug, Clone, Default)]
pub struct PeakStats {
    x: Vec<f64>,
    y: Vec<f64>,
}

/// Estimators derived from the accumulated samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakSummary {
    /// Sample positions in arrival order
    pub x: Vec<f64>,
    /// Sample responses in arrival order
    pub y: Vec<f64>,
    /// Position and value of the minimum response
    pub min: Option<(f64, f64)>,
    /// Position and value of the maximum response
    pub max: Option<(f64, f64)>,
    /// Center of mass above the minimum
    pub com: Option<f64>,
    /// Center of the half-maximum crossings
    pub cen: Option<f64>,
    /// Full width at half maximum
    pub fwhm: Option<f64>,
    /// Positions where the response crosses half maximum
    pub crossings: Vec<f64>,
}

impl PeakSummary {
    /// Whether there were enough samples for the centroid estimators
    pub fn is_determined(&self) -> bool {
        self.x.len() >= MIN_SAMPLES
    }
}

impl PeakStats {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator pre-filled from paired slices (extra elements of the longer slice are ignored)
    pub fn from_samples(x: &[f64], y: &[f64]) -> Self {
        let mut stats = Self::new();
        for (&xi, &yi) in x.iter().zip(y) {
            stats.push(xi, yi);
        }
        stats
    }

    /// Add one sample. Non-finite samples are ignored; returns whether it was kept.
    pub fn push(&mut self, x: f64, y: f64) -> bool {
        if !(x.is_finite() && y.is_finite()) {
            return false;
        }
        self.x.push(x);
        self.y.push(y);
        true
    }

    /// Number of samples kept
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether no samples were kept
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.x.clear();
        self.y.clear();
    }

    /// Derive the estimators from the current samples.
    pub fn compute(&self) -> PeakSummary {
        let mut summary = PeakSummary {
            x: self.x.clone(),
            y: self.y.clone(),
            ..PeakSummary::default()
        };
        let (Some(imin), Some(imax)) = (self.argmin(), self.argmax()) else {
            return summary;
        };
        let (ymin, ymax) = (self.y[imin], self.y[imax]);
        summary.min = Some((self.x[imin], ymin));
        summary.max = Some((self.x[imax], ymax));

        if self.len() < MIN_SAMPLES {
            return summary;
        }

        let (weighted, total) = self
            .x
            .iter()
            .zip(&self.y)
            .fold((0.0, 0.0), |(wx, w), (&xi, &yi)| {
                let wi = yi - ymin;
                (wx + xi * wi, w + wi)
            });
        if total > 0.0 {
            summary.com = Some(weighted / total);
        }

        let mid = (ymax + ymin) / 2.0;
        summary.crossings = self.crossings(mid);
        if let (Some(first), Some(last)) = (summary.crossings.first(), summary.crossings.last()) {
            summary.cen = Some(summary.crossings.iter().sum::<f64>() / summary.crossings.len() as f64);
            if summary.crossings.len() >= 2 {
                summary.fwhm = Some((last - first).abs());
            }
        }
        summary
    }

    fn argmin(&self) -> Option<usize> {
        self.y
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
                Some((_, b)) if b <= v => best,
                _ => Some((i, v)),
            })
            .map(|(i, _)| i)
    }

    fn argmax(&self) -> Option<usize> {
        self.y
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })
            .map(|(i, _)| i)
    }

    fn crossings(&self, level: f64) -> Vec<f64> {
        self.x
            .windows(2)
            .zip(self.y.windows(2))
            .filter_map(|(xs, ys)| {
                let (above0, above1) = (ys[0] >= level, ys[1] >= level);
                (above0 != above1)
                    .then(|| xs[0] + (level - ys[0]) * (xs[1] - xs[0]) / (ys[1] - ys[0]))
            })
            .collect()
    }
}
