//! Single-pass axis tuner.
//!
//! One pass runs `Idle → Scanning → Evaluating → (Relocating | Holding) → Done`:
//!
//! 1. Read the axis position and build `num_points` positions spanning
//!    `[initial − width/2, initial + width/2]`.
//! 2. At each position, move (and settle), trigger every signal, then write one
//!    `primary` record with the axis readback and every signal value.
//! 3. Ask the peak detector whether the response signal shows a peak, and take
//!    the center from the chosen estimator.
//! 4. Move to the center, or back to the initial position when no usable peak
//!    was found. A `PeakStats` record is written only for a successful pass.
//!
//! Moves and triggers are started with [`spawn_async_call`] and awaited with the
//! configured timeouts. A timeout ends the scan early (`tune_ok == false`); a
//! device error aborts the pass with [`DaqError::Hardware`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{MaxMinRatio, PeakChoice, PeakDetector, TuneRequest, TuneResult};
use crate::blocking::{spawn_async_call, CallOutcome, WaitOptions};
use crate::config::TunerSettings;
use crate::documents::{emit_record, ExitStatus, RecordSink, StartDoc};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{DeviceRef, Detector, Movable, Readable, Triggerable};
use crate::peak_stats::PeakStats;

/// Plan name of a standalone pass.
pub const TUNE_PLAN_NAME: &str = "TuneAxis.tune";

/// Stream receiving the statistics of a successful pass.
pub const PEAK_STATS_STREAM: &str = "PeakStats";

/// Stream receiving one record per scan point.
pub const PRIMARY_STREAM: &str = "primary";

/// Which run a pass belongs to, for the start document.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassContext {
    pub plan_name: &'static str,
    pub pass: Option<(usize, usize)>,
}

impl PassContext {
    fn standalone() -> Self {
        Self {
            plan_name: TUNE_PLAN_NAME,
            pass: None,
        }
    }
}

/// Scans one axis against one or more signals and moves it to the peak.
///
/// The pass history is kept between calls: [`tune`](Self::tune) starts a fresh
/// history, [`multi_pass_tune`](Self::multi_pass_tune) starts one for the whole
/// run and appends every pass.
pub struct TuneAxis {
    pub(crate) axis: DeviceRef<dyn Movable>,
    signals: Vec<DeviceRef<dyn Detector>>,
    signal_name: Option<String>,
    pub(crate) width: f64,
    pub(crate) num_points: usize,
    pub(crate) peak_choice: PeakChoice,
    detector: Arc<dyn PeakDetector>,
    move_wait: WaitOptions,
    trigger_wait: WaitOptions,
    metadata: BTreeMap<String, serde_json::Value>,
    pub(crate) history: Vec<TuneResult>,
}

impl TuneAxis {
    /// Tuner with width 1, 10 points, `cen` estimator and the 4× max/min detector.
    pub fn new(axis: DeviceRef<dyn Movable>, signals: Vec<DeviceRef<dyn Detector>>) -> Self {
        Self {
            axis,
            signals,
            signal_name: None,
            width: 1.0,
            num_points: 10,
            peak_choice: PeakChoice::Centroid,
            detector: Arc::new(MaxMinRatio::default()),
            move_wait: WaitOptions::default(),
            trigger_wait: WaitOptions::default(),
            metadata: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Apply `[tuner]` settings.
    pub fn configure(self, settings: &TunerSettings) -> AppResult<Self> {
        let poll = Duration::from_millis(settings.poll_interval_ms);
        let move_timeout = timeout_setting("move_timeout_s", settings.move_timeout_s)?;
        let trigger_timeout = timeout_setting("trigger_timeout_s", settings.trigger_timeout_s)?;
        Ok(self
            .with_width(settings.width)
            .with_num_points(settings.num_points)
            .with_peak_choice(settings.peak_choice.parse()?)
            .with_peak_detector(MaxMinRatio {
                ratio: settings.peak_ratio,
            })
            .with_move_wait(
                WaitOptions::default()
                    .with_poll_interval(poll)
                    .with_optional_timeout(move_timeout),
            )
            .with_trigger_wait(
                WaitOptions::default()
                    .with_poll_interval(poll)
                    .with_optional_timeout(trigger_timeout),
            ))
    }

    /// Name of the response signal (defaults to the first signal)
    pub fn with_signal_name(mut self, name: impl Into<String>) -> Self {
        self.signal_name = Some(name.into());
        self
    }

    /// Default scan width
    pub fn with_width(mut self, width: f64) -> Self {
        self.width = width;
        self
    }

    /// Default number of points
    pub fn with_num_points(mut self, num_points: usize) -> Self {
        self.num_points = num_points;
        self
    }

    /// Default estimator
    pub fn with_peak_choice(mut self, peak_choice: PeakChoice) -> Self {
        self.peak_choice = peak_choice;
        self
    }

    /// Replace the peak-detected heuristic
    pub fn with_peak_detector(mut self, detector: impl PeakDetector + 'static) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    /// How to await axis moves
    pub fn with_move_wait(mut self, wait: WaitOptions) -> Self {
        self.move_wait = wait;
        self
    }

    /// How to await detector triggers
    pub fn with_trigger_wait(mut self, wait: WaitOptions) -> Self {
        self.trigger_wait = wait;
        self
    }

    /// Extra metadata merged into every start document
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Axis being tuned
    pub fn axis(&self) -> &DeviceRef<dyn Movable> {
        &self.axis
    }

    /// Results of the passes since the last fresh run
    pub fn history(&self) -> &[TuneResult] {
        &self.history
    }

    /// Request built from the current defaults
    pub fn default_request(&self) -> TuneRequest {
        TuneRequest {
            width: self.width,
            num_points: self.num_points,
            peak_choice: self.peak_choice,
        }
    }

    /// One pass with the default request; clears the history first.
    pub async fn tune(&mut self, sink: &dyn RecordSink) -> AppResult<TuneResult> {
        let request = self.default_request();
        self.tune_with(sink, &request).await
    }

    /// One pass with an explicit request; clears the history first.
    ///
    /// A rejected request leaves the history untouched.
    pub async fn tune_with(
        &mut self,
        sink: &dyn RecordSink,
        request: &TuneRequest,
    ) -> AppResult<TuneResult> {
        request.validate()?;
        self.response_index()?;
        self.history.clear();
        self.run_pass(sink, request, PassContext::standalone()).await
    }

    fn response_index(&self) -> AppResult<usize> {
        if self.signals.is_empty() {
            return Err(DaqError::Configuration(format!(
                "tuner for '{}' has no signals",
                self.axis.name
            )));
        }
        match &self.signal_name {
            None => Ok(0),
            Some(name) => self
                .signals
                .iter()
                .position(|s| &s.name == name)
                .ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "signal_name '{}' is not one of the tuner's signals",
                        name
                    ))
                }),
        }
    }

    /// Run one pass and append its result to the history.
    pub(crate) async fn run_pass(
        &mut self,
        sink: &dyn RecordSink,
        request: &TuneRequest,
        context: PassContext,
    ) -> AppResult<TuneResult> {
        request.validate()?;
        let response = self.response_index()?;

        let mut run_open = false;
        match self.scan_and_evaluate(sink, request, context, response, &mut run_open).await {
            Ok(result) => {
                self.history.push(result.clone());
                Ok(result)
            }
            Err(err) => {
                if run_open {
                    if let Err(close_err) = sink
                        .close_run(ExitStatus::Fail, Some(err.to_string()))
                        .await
                    {
                        warn!(error = %close_err, "could not close run after fatal tune error");
                    }
                }
                Err(err)
            }
        }
    }

    async fn scan_and_evaluate(
        &self,
        sink: &dyn RecordSink,
        request: &TuneRequest,
        context: PassContext,
        response: usize,
        run_open: &mut bool,
    ) -> AppResult<TuneResult> {
        let initial = self
            .axis
            .device
            .position()
            .await
            .map_err(|e| DaqError::hardware(&self.axis.name, e))?;
        let half = request.width / 2.0;
        let positions = super::linspace(initial - half, initial + half, request.num_points);
        let y_axis = &self.signals[response].name;

        let mut start = StartDoc::new("tune", context.plan_name)
            .with_arg("axis", self.axis.name.as_str())
            .with_arg(
                "signals",
                self.signals.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
            )
            .with_metadata("plan_name", context.plan_name)
            .with_metadata(
                "tune_parameters",
                json!({
                    "num": request.num_points,
                    "width": request.width,
                    "initial_position": initial,
                    "peak_choice": request.peak_choice.as_str(),
                    "x_axis": self.axis.name,
                    "y_axis": y_axis,
                    "time_iso8601": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .extend_metadata(&self.metadata)
            .with_hint(&self.axis.name);
        if let Some((pass, pass_max)) = context.pass {
            start = start
                .with_metadata("pass", pass)
                .with_metadata("pass_max", pass_max);
        }
        sink.open_run(start)
            .await
            .map_err(|e| DaqError::sink("start", e))?;
        *run_open = true;

        info!(
            axis = %self.axis.name,
            signal = %y_axis,
            initial,
            width = request.width,
            num = request.num_points,
            "tune pass started"
        );

        let mut armed = true;
        for signal in &self.signals {
            let device = Arc::clone(&signal.device);
            if self
                .suspend(&signal.name, self.trigger_wait, async move { device.arm().await })
                .await?
                .is_none()
            {
                armed = false;
                break;
            }
        }

        // A signal that never armed skips the scan.
        let mut stats = PeakStats::new();
        let timed_out = !armed || !self.scan(sink, &positions, response, &mut stats).await?;

        let summary = stats.compute();
        let detected = !timed_out && self.detector.peak_detected(&summary);
        let center = if detected {
            request.peak_choice.select(&summary)
        } else {
            None
        };
        let tune_ok = center.is_some();
        let final_position = center.unwrap_or(initial);

        if detected && !tune_ok {
            info!(
                axis = %self.axis.name,
                peak_choice = %request.peak_choice,
                "peak detected but its center is undetermined; holding axis"
            );
        } else if !tune_ok && !timed_out {
            info!(axis = %self.axis.name, "no peak found; returning to initial position");
        }

        if self.move_axis(final_position).await?.is_none() {
            return Err(DaqError::hardware(
                &self.axis.name,
                anyhow!("timed out moving to final position {}", final_position),
            ));
        }

        if tune_ok {
            emit_record(
                sink,
                PEAK_STATS_STREAM,
                vec![
                    ("tune_ok".into(), json!(tune_ok)),
                    ("center".into(), json!(center)),
                    ("initial_position".into(), json!(initial)),
                    ("final_position".into(), json!(final_position)),
                    ("x".into(), json!(summary.x)),
                    ("y".into(), json!(summary.y)),
                    ("min".into(), json!(summary.min)),
                    ("max".into(), json!(summary.max)),
                    ("com".into(), json!(summary.com)),
                    ("cen".into(), json!(summary.cen)),
                    ("fwhm".into(), json!(summary.fwhm)),
                    ("crossings".into(), json!(summary.crossings)),
                ],
            )
            .await?;
            info!(axis = %self.axis.name, center = final_position, "tune pass found peak");
        }

        let (exit, reason) = if timed_out {
            (ExitStatus::Fail, Some("device operation timed out".to_string()))
        } else {
            (ExitStatus::Success, None)
        };
        sink.close_run(exit, reason)
            .await
            .map_err(|e| DaqError::sink("stop", e))?;
        *run_open = false;

        Ok(TuneResult {
            tune_ok,
            initial_position: initial,
            final_position,
            center,
            width: request.width,
            num_points: request.num_points,
            peak_choice: request.peak_choice,
            timed_out,
            stats: summary,
        })
    }

    /// Visit every position. Returns `false` if a move or trigger timed out.
    async fn scan(
        &self,
        sink: &dyn RecordSink,
        positions: &[f64],
        response: usize,
        stats: &mut PeakStats,
    ) -> AppResult<bool> {
        for &target in positions {
            if self.move_axis(target).await?.is_none() {
                return Ok(false);
            }
            for signal in &self.signals {
                let device = Arc::clone(&signal.device);
                let triggered = self
                    .suspend(&signal.name, self.trigger_wait, async move {
                        device.trigger().await
                    })
                    .await?;
                if triggered.is_none() {
                    return Ok(false);
                }
            }

            let readback = self
                .axis
                .device
                .position()
                .await
                .map_err(|e| DaqError::hardware(&self.axis.name, e))?;
            let mut fields = Vec::with_capacity(self.signals.len() + 1);
            fields.push((self.axis.name.clone(), json!(readback)));
            let mut response_value = f64::NAN;
            for (i, signal) in self.signals.iter().enumerate() {
                let value = signal
                    .device
                    .read()
                    .await
                    .map_err(|e| DaqError::hardware(&signal.name, e))?;
                if i == response {
                    response_value = value;
                }
                fields.push((signal.name.clone(), json!(value)));
            }
            emit_record(sink, PRIMARY_STREAM, fields).await?;
            stats.push(readback, response_value);
            debug!(position = readback, value = response_value, "tune point");
        }
        Ok(true)
    }

    /// Move and settle. `None` if the move timed out.
    async fn move_axis(&self, target: f64) -> AppResult<Option<()>> {
        let device = Arc::clone(&self.axis.device);
        self.suspend(&self.axis.name, self.move_wait, async move {
            device.move_abs(target).await?;
            device.wait_settled().await
        })
        .await
    }

    /// Await a device operation: `Some` on completion, `None` on timeout.
    async fn suspend<T, Fut>(&self, device: &str, wait: WaitOptions, op: Fut) -> AppResult<Option<T>>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match spawn_async_call(op).wait(wait).await {
            CallOutcome::Completed(value) => Ok(Some(value)),
            CallOutcome::Failed(err) => Err(DaqError::hardware(device, err)),
            CallOutcome::TimedOut => {
                warn!(device, timeout = ?wait.timeout, "device operation timed out");
                Ok(None)
            }
        }
    }
}

/// Seconds from `[tuner]` as a wait timeout.
fn timeout_setting(field: &str, secs: Option<f64>) -> AppResult<Option<Duration>> {
    let Some(secs) = secs else {
        return Ok(None);
    };
    if !(secs.is_finite() && secs > 0.0) {
        return Err(DaqError::Configuration(format!(
            "{} must be a positive number of seconds, got {}",
            field, secs
        )));
    }
    Duration::try_from_secs_f64(secs).map(Some).map_err(|e| {
        DaqError::Configuration(format!("{} = {} is out of range: {}", field, secs, e))
    })
}
