//! Async Scan Monitor
//!
//! Drives one hardware-run acquisition (an sscan-style [`ScanRecord`]) from start
//! to finish while streaming its rows into a [`RecordSink`].
//!
//! # Protocol
//!
//! 1. Select channels, then subscribe to the execute and phase notifications.
//! 2. Open the run, issue the start command, and only then mark the scan started,
//!    so a stale idle notification cannot end it early. An execute control that
//!    already reads idle at that point completes the scan.
//! 3. Poll every `poll_interval_s` until the completion signal is done *and* no
//!    row is pending. Each iteration emits at most one queued row, read by its
//!    index, and checks the phase inactivity deadline.
//! 4. Unsubscribe, then dump the accumulated arrays and the device settings to
//!    their streams (when enabled), and close the run.
//!
//! Notification callbacks only touch atomics and the completion [`Status`]. All
//! reads and sink writes happen on the polling task.
//!
//! # Failure semantics
//!
//! - Phase inactivity past the deadline ends the scan with `success == false` and
//!   a warning. This is not an error.
//! - A failed device read, start command or sink write is returned as an error
//!   after the subscriptions have been removed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::documents::{ExitStatus, RecordSink, StartDoc};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    PvValue, ScanRecord, SubscriptionHandle, EXECUTE_IDLE, PHASE_RECORD_SCALAR_DATA,
};
use crate::status::Status;

/// Largest accepted poll interval, in seconds.
pub const MAX_POLL_INTERVAL_S: f64 = 0.1;

/// Plan name recorded in the start document.
pub const PLAN_NAME: &str = "sscan_1D";

/// Scan monitor settings.
///
/// A `None` stream name disables that output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMonitorConfig {
    /// Sleep between loop iterations, in `[0, 0.1]` seconds
    pub poll_interval_s: f64,
    /// Phase inactivity window; `None` disables stall detection
    pub phase_timeout_s: Option<f64>,
    /// Stream receiving one record per data row
    pub running_stream: Option<String>,
    /// Stream receiving the full channel arrays once the scan ends
    pub final_array_stream: Option<String>,
    /// Stream receiving the device settings snapshot once the scan ends
    pub device_settings_stream: Option<String>,
}

impl Default for ScanMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 0.001,
            phase_timeout_s: Some(60.0),
            running_stream: Some("primary".to_string()),
            final_array_stream: None,
            device_settings_stream: Some("settings".to_string()),
        }
    }
}

impl ScanMonitorConfig {
    /// Reject settings the monitor cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=MAX_POLL_INTERVAL_S).contains(&self.poll_interval_s) {
            return Err(DaqError::Configuration(format!(
                "poll_interval_s must be within [0, {}] s, got {}",
                MAX_POLL_INTERVAL_S, self.poll_interval_s
            )));
        }
        if let Some(timeout) = self.phase_timeout_s {
            let representable = Duration::try_from_secs_f64(timeout).is_ok();
            if !(timeout.is_finite() && timeout > 0.0 && representable) {
                return Err(DaqError::Configuration(format!(
                    "phase_timeout_s must be a positive number of seconds, got {}",
                    timeout
                )));
            }
        }
        for (field, name) in [
            ("running_stream", &self.running_stream),
            ("final_array_stream", &self.final_array_stream),
            ("device_settings_stream", &self.device_settings_stream),
        ] {
            if matches!(name, Some(n) if n.trim().is_empty()) {
                return Err(DaqError::Configuration(format!(
                    "{} must not be empty (omit it to disable the stream)",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Where the monitor is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Not started, or finished normally
    Idle,
    /// Start issued, no phase activity seen yet
    Moving,
    /// Phase activity seen, scan still running
    Acquiring,
    /// Reading channels for a row
    Reading,
    /// Ended by a stall or a fatal fault
    Aborted,
}

/// Report of one monitored scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Run UID assigned by the sink
    pub run_uid: String,
    /// Whether the scan reached idle before any stall
    pub success: bool,
    /// Whether the scan ended on the inactivity deadline
    pub stalled: bool,
    /// Final monitor phase
    pub phase: ScanPhase,
    /// Rows written to the running stream
    pub rows_emitted: u64,
    /// "New data" notifications observed
    pub data_events: u64,
    /// All phase notifications observed
    pub phase_events: u64,
    /// Wall time from start command to teardown
    pub elapsed_s: f64,
}

/// State shared with the notification callbacks.
struct Shared {
    status: Status,
    started: AtomicBool,
    torn_down: AtomicBool,
    pending_rows: AtomicU64,
    data_events: AtomicU64,
    phase_events: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn new() -> Self {
        Self {
            status: Status::new(),
            started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            pending_rows: AtomicU64::new(0),
            data_events: AtomicU64::new(0),
            phase_events: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn ignoring(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst) || self.status.is_done()
    }

    fn on_execute(&self, value: &PvValue) {
        if self.ignoring() {
            return;
        }
        let (idle, label) = EXECUTE_IDLE;
        if value.is_enum(idle, label) && self.started.load(Ordering::SeqCst) {
            self.status.mark_success();
        }
        trace!(?value, "execute notification");
    }

    fn on_phase(&self, value: &PvValue) {
        if self.ignoring() {
            return;
        }
        *self.last_activity.lock() = Instant::now();
        self.phase_events.fetch_add(1, Ordering::SeqCst);
        let (data, label) = PHASE_RECORD_SCALAR_DATA;
        if value.is_enum(data, label) {
            self.data_events.fetch_add(1, Ordering::SeqCst);
            self.pending_rows.fetch_add(1, Ordering::SeqCst);
        }
        trace!(?value, "phase notification");
    }

    fn take_pending_row(&self) -> bool {
        self.pending_rows
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// RAII guard holding the execute and phase subscriptions.
///
/// Dropping it (normal end, error return, panic) marks the shared state torn
/// down and unsubscribes both handles.
struct SubscriptionGuard<'a> {
    record: &'a dyn ScanRecord,
    shared: Arc<Shared>,
    handles: Vec<SubscriptionHandle>,
}

impl<'a> SubscriptionGuard<'a> {
    fn subscribe(record: &'a dyn ScanRecord, shared: Arc<Shared>) -> Self {
        let on_execute = Arc::clone(&shared);
        let on_phase = Arc::clone(&shared);
        let handles = vec![
            record.subscribe_execute(Arc::new(move |v: &PvValue| on_execute.on_execute(v))),
            record.subscribe_phase(Arc::new(move |v: &PvValue| on_phase.on_phase(v))),
        ];
        Self {
            record,
            shared,
            handles,
        }
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.shared.torn_down.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            self.record.unsubscribe(handle);
        }
        debug!(scan = %self.record.name(), "scan subscriptions removed");
    }
}

/// Watch-and-poll driver for hardware-run scans.
#[derive(Debug, Clone)]
pub struct ScanMonitor {
    config: ScanMonitorConfig,
    poll_interval: Duration,
    phase_timeout: Option<Duration>,
}

impl ScanMonitor {
    /// Validate `config` and build a monitor.
    pub fn new(config: ScanMonitorConfig) -> AppResult<Self> {
        config.validate()?;
        let phase_timeout = match config.phase_timeout_s {
            Some(secs) => Some(Duration::try_from_secs_f64(secs).map_err(|e| {
                DaqError::Configuration(format!("phase_timeout_s = {} is out of range: {}", secs, e))
            })?),
            None => None,
        };
        Ok(Self {
            poll_interval: Duration::from_secs_f64(config.poll_interval_s),
            phase_timeout,
            config,
        })
    }

    /// Active settings
    pub fn config(&self) -> &ScanMonitorConfig {
        &self.config
    }

    /// Run one scan of `record`, writing to `sink`.
    ///
    /// `metadata` is merged into the start document.
    pub async fn run(
        &self,
        record: &dyn ScanRecord,
        sink: &dyn RecordSink,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> AppResult<ScanOutcome> {
        record
            .select_channels()
            .await
            .map_err(|e| DaqError::hardware(record.name(), e))?;
        let channels = record.channels();

        let shared = Arc::new(Shared::new());
        let guard = SubscriptionGuard::subscribe(record, Arc::clone(&shared));

        let start = StartDoc::new("sscan", PLAN_NAME)
            .with_arg("device", record.name())
            .with_arg("channels", channels.clone())
            .with_arg("poll_interval_s", self.config.poll_interval_s)
            .with_arg("phase_timeout_s", self.config.phase_timeout_s)
            .with_metadata("plan_name", PLAN_NAME)
            .extend_metadata(metadata)
            .with_hint(channels.first().map(String::as_str).unwrap_or_default());
        let run_uid = sink
            .open_run(start)
            .await
            .map_err(|e| DaqError::sink("start", e))?;

        match self.drive(record, sink, &channels, &shared, guard, run_uid).await {
            Ok(outcome) => {
                let (exit, reason) = if outcome.success {
                    (ExitStatus::Success, None)
                } else {
                    (
                        ExitStatus::Fail,
                        Some("phase inactivity timeout".to_string()),
                    )
                };
                sink.close_run(exit, reason)
                    .await
                    .map_err(|e| DaqError::sink("stop", e))?;
                info!(
                    scan = %record.name(),
                    success = outcome.success,
                    rows = outcome.rows_emitted,
                    elapsed_s = outcome.elapsed_s,
                    "scan finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Err(close_err) = sink
                    .close_run(ExitStatus::Fail, Some(err.to_string()))
                    .await
                {
                    warn!(error = %close_err, "could not close run after fatal scan error");
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        record: &dyn ScanRecord,
        sink: &dyn RecordSink,
        channels: &[String],
        shared: &Shared,
        guard: SubscriptionGuard<'_>,
        run_uid: String,
    ) -> AppResult<ScanOutcome> {
        record
            .start()
            .await
            .map_err(|e| DaqError::hardware(record.name(), e))?;
        let started_at = Instant::now();
        *shared.last_activity.lock() = started_at;
        shared.started.store(true, Ordering::SeqCst);
        info!(scan = %record.name(), run_uid = %run_uid, "scan started");

        // An idle notification sent while `start()` was pending was ignored.
        let execute = record
            .read_execute()
            .await
            .map_err(|e| DaqError::hardware(record.name(), e))?;
        let (idle, label) = EXECUTE_IDLE;
        if execute.is_enum(idle, label) && shared.status.mark_success() {
            debug!(scan = %record.name(), "scan already idle when start returned");
        }

        let mut phase = ScanPhase::Moving;
        let mut rows_emitted = 0u64;
        let mut next_row = 0usize;
        let mut stalled = false;

        while !shared.status.is_done() || shared.pending_rows.load(Ordering::SeqCst) > 0 {
            if shared.phase_events.load(Ordering::SeqCst) > 0 && phase == ScanPhase::Moving {
                transition(&mut phase, ScanPhase::Acquiring);
            }

            if shared.take_pending_row() {
                let index = next_row;
                next_row += 1;
                if let Some(stream) = &self.config.running_stream {
                    transition(&mut phase, ScanPhase::Reading);
                    emit_row(record, sink, stream, channels, index).await?;
                    rows_emitted += 1;
                    debug!(row = index, stream = %stream, "row emitted");
                    transition(&mut phase, ScanPhase::Acquiring);
                }
            }

            if let Some(timeout) = self.phase_timeout {
                let last = *shared.last_activity.lock();
                if !shared.status.is_done()
                    && Instant::now() >= last + timeout
                    && shared.status.mark_failure()
                {
                    stalled = true;
                    warn!(
                        scan = %record.name(),
                        timeout_s = timeout.as_secs_f64(),
                        rows = rows_emitted,
                        "no phase activity before the deadline; abandoning scan"
                    );
                }
            }

            if self.poll_interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                sleep(self.poll_interval).await;
            }
        }

        drop(guard);
        let elapsed_s = started_at.elapsed().as_secs_f64();

        if let Some(stream) = &self.config.final_array_stream {
            sink.open_record(stream)
                .await
                .map_err(|e| DaqError::sink(stream, e))?;
            for channel in channels {
                let values = record
                    .read_channel_array(channel)
                    .await
                    .map_err(|e| DaqError::hardware(record.name(), e))?;
                sink.append(channel, serde_json::json!(values))
                    .await
                    .map_err(|e| DaqError::sink(stream, e))?;
            }
            sink.commit().await.map_err(|e| DaqError::sink(stream, e))?;
        }

        if let Some(stream) = &self.config.device_settings_stream {
            let settings = record
                .read_settings()
                .await
                .map_err(|e| DaqError::hardware(record.name(), e))?;
            sink.open_record(stream)
                .await
                .map_err(|e| DaqError::sink(stream, e))?;
            for (key, value) in settings {
                sink.append(&key, value)
                    .await
                    .map_err(|e| DaqError::sink(stream, e))?;
            }
            sink.commit().await.map_err(|e| DaqError::sink(stream, e))?;
        }

        let success = shared.status.succeeded();
        transition(
            &mut phase,
            if success {
                ScanPhase::Idle
            } else {
                ScanPhase::Aborted
            },
        );
        Ok(ScanOutcome {
            run_uid,
            success,
            stalled,
            phase,
            rows_emitted,
            data_events: shared.data_events.load(Ordering::SeqCst),
            phase_events: shared.phase_events.load(Ordering::SeqCst),
            elapsed_s,
        })
    }
}

fn transition(phase: &mut ScanPhase, next: ScanPhase) {
    if *phase != next {
        trace!(from = ?*phase, to = ?next, "scan phase");
        *phase = next;
    }
}

/// Read row `index` of every channel, in order, into one record on `stream`.
async fn emit_row(
    record: &dyn ScanRecord,
    sink: &dyn RecordSink,
    stream: &str,
    channels: &[String],
    index: usize,
) -> AppResult<()> {
    sink.open_record(stream)
        .await
        .map_err(|e| DaqError::sink(stream, e))?;
    for channel in channels {
        let value = record
            .read_row(channel, index)
            .await
            .map_err(|e| DaqError::hardware(format!("{}.{}", record.name(), channel), e))?;
        sink.append(channel, serde_json::json!(value))
            .await
            .map_err(|e| DaqError::sink(stream, e))?;
    }
    sink.commit().await.map_err(|e| DaqError::sink(stream, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::DocumentRecorder;
    use crate::hardware::mock::MockScanRecord;

    fn config(poll_interval_s: f64) -> ScanMonitorConfig {
        ScanMonitorConfig {
            poll_interval_s,
            ..ScanMonitorConfig::default()
        }
    }

    #[test]
    fn poll_interval_bounds() {
        assert!(ScanMonitor::new(config(0.1)).is_ok());
        assert!(ScanMonitor::new(config(0.0)).is_ok());
        assert!(ScanMonitor::new(config(0.001)).is_ok());

        for bad in [0.1000001, -0.001, f64::NAN, f64::INFINITY] {
            let err = ScanMonitor::new(config(bad)).unwrap_err();
            assert!(err.is_configuration(), "{bad} should be rejected");
        }
    }

    #[test]
    fn phase_timeout_must_be_positive() {
        for bad in [0.0, -2.0, f64::NAN, f64::MAX] {
            let cfg = ScanMonitorConfig {
                phase_timeout_s: Some(bad),
                ..ScanMonitorConfig::default()
            };
            assert!(ScanMonitor::new(cfg).is_err(), "{bad} should be rejected");
        }

        let cfg = ScanMonitorConfig {
            phase_timeout_s: None,
            ..ScanMonitorConfig::default()
        };
        assert!(ScanMonitor::new(cfg).is_ok());
    }

    #[test]
    fn empty_stream_name_is_rejected() {
        let cfg = ScanMonitorConfig {
            running_stream: Some("  ".into()),
            ..ScanMonitorConfig::default()
        };
        assert!(ScanMonitor::new(cfg).is_err());
    }

    #[tokio::test]
    async fn emits_one_row_per_data_event() {
        let scan = MockScanRecord::linear("scan1", -1.0, 1.0, 5, Duration::from_millis(4));
        let recorder = DocumentRecorder::default();
        let monitor = ScanMonitor::new(config(0.001)).unwrap();

        let outcome = monitor
            .run(&scan, &recorder, &BTreeMap::new())
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(!outcome.stalled);
        assert_eq!(outcome.phase, ScanPhase::Idle);
        assert_eq!(outcome.rows_emitted, 5);
        assert_eq!(outcome.data_events, 5);

        let positions: Vec<f64> = recorder
            .events("primary")
            .iter()
            .map(|e| e.number("p1").unwrap())
            .collect();
        assert_eq!(positions, vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(recorder.events("settings").len(), 1);
        assert_eq!(scan.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failed_start_tears_down() {
        let scan = MockScanRecord::linear("scan1", 0.0, 1.0, 3, Duration::from_millis(2))
            .failing_start();
        let recorder = DocumentRecorder::default();
        let monitor = ScanMonitor::new(config(0.001)).unwrap();

        let err = monitor
            .run(&scan, &recorder, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Hardware { .. }));
        assert_eq!(scan.subscriber_count(), 0);
        assert_eq!(recorder.stops()[0].exit_status, ExitStatus::Fail);
    }
}
