//! Multi-pass tuning.
//!
//! Each pass narrows the window: after every pass the width is divided by
//! `step_factor` and, in snake mode, negated so the next pass approaches the
//! peak from the other side. The run stops at the first pass without a peak or
//! after `pass_max` passes.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::axis::PassContext;
use super::{TuneAxis, TuneRequest, TuneResult};
use crate::config::TunerSettings;
use crate::documents::RecordSink;
use crate::error::{AppResult, DaqError};

/// Plan name of every pass in a multi-pass run.
pub const MULTI_PASS_PLAN_NAME: &str = "TuneAxis.multi_pass_tune";

/// Multi-pass parameters. `None` fields fall back to the tuner's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiPassOptions {
    /// Width of the first pass
    pub width: Option<f64>,
    /// Points per pass
    pub num_points: Option<usize>,
    /// Width divisor between passes, > 1
    pub step_factor: f64,
    /// Upper bound on passes
    pub pass_max: usize,
    /// Alternate scan direction between passes (default on)
    pub snake: Option<bool>,
}

impl Default for MultiPassOptions {
    fn default() -> Self {
        Self {
            width: None,
            num_points: None,
            step_factor: 4.0,
            pass_max: 6,
            snake: None,
        }
    }
}

impl From<&TunerSettings> for MultiPassOptions {
    fn from(settings: &TunerSettings) -> Self {
        Self {
            width: Some(settings.width),
            num_points: Some(settings.num_points),
            step_factor: settings.step_factor,
            pass_max: settings.pass_max,
            snake: Some(settings.snake),
        }
    }
}

/// Width schedule of a multi-pass run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiPassState {
    /// Passes completed so far
    pub pass_index: usize,
    /// Width of the next pass
    pub current_width: f64,
    /// Upper bound on passes
    pub pass_max: usize,
    /// Width divisor between passes
    pub step_factor: f64,
    /// Whether the sign flips between passes
    pub snake: bool,
}

impl MultiPassState {
    /// Validated schedule starting at `width`.
    pub fn new(width: f64, step_factor: f64, pass_max: usize, snake: bool) -> AppResult<Self> {
        if !(step_factor.is_finite() && step_factor > 1.0) {
            return Err(DaqError::Configuration(format!(
                "step_factor must be > 1, got {}",
                step_factor
            )));
        }
        if pass_max == 0 {
            return Err(DaqError::Configuration("pass_max must be >= 1".into()));
        }
        Ok(Self {
            pass_index: 0,
            current_width: width,
            pass_max,
            step_factor,
            snake,
        })
    }

    /// Whether the pass budget is used up
    pub fn is_exhausted(&self) -> bool {
        self.pass_index >= self.pass_max
    }

    /// Record a finished pass and shrink the width for the next one.
    pub fn advance(&mut self) {
        self.pass_index += 1;
        self.current_width /= self.step_factor;
        if self.snake {
            self.current_width = -self.current_width;
        }
    }
}

impl TuneAxis {
    /// Tune repeatedly with a shrinking window.
    ///
    /// The history is cleared once at the start and then holds every pass of
    /// this run; a copy is returned. A device or sink fault in any pass is
    /// returned as an error and ends the run.
    pub async fn multi_pass_tune(
        &mut self,
        sink: &dyn RecordSink,
        options: &MultiPassOptions,
    ) -> AppResult<Vec<TuneResult>> {
        let num_points = options.num_points.unwrap_or(self.num_points);
        let mut state = MultiPassState::new(
            options.width.unwrap_or(self.width),
            options.step_factor,
            options.pass_max,
            options.snake.unwrap_or(true),
        )?;
        TuneRequest {
            width: state.current_width,
            num_points,
            peak_choice: self.peak_choice,
        }
        .validate()?;

        self.history.clear();
        while !state.is_exhausted() {
            let request = TuneRequest {
                width: state.current_width,
                num_points,
                peak_choice: self.peak_choice,
            };
            let context = PassContext {
                plan_name: MULTI_PASS_PLAN_NAME,
                pass: Some((state.pass_index + 1, state.pass_max)),
            };
            let result = self.run_pass(sink, &request, context).await?;
            state.advance();
            if !result.tune_ok {
                info!(
                    axis = %self.axis.name,
                    passes = state.pass_index,
                    "multi-pass tune stopped: pass found no peak"
                );
                break;
            }
        }
        info!(
            axis = %self.axis.name,
            passes = self.history.len(),
            final_position = ?self.history.last().map(|r| r.final_position),
            "multi-pass tune finished"
        );
        Ok(self.history.clone())
    }
}
