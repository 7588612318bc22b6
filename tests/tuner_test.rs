//! Integration tests for single-pass and multi-pass axis tuning
//!
//! Uses `MockStage` with a `MockPeakDetector` whose response is a Gaussian of
//! the stage position.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daq_tune::blocking::WaitOptions;
use daq_tune::config::TunerSettings;
use daq_tune::documents::{DocumentRecorder, ExitStatus};
use daq_tune::hardware::capabilities::{DeviceRef, Detector, Movable, Readable, Triggerable};
use daq_tune::hardware::mock::{MockPeakDetector, MockStage};
use daq_tune::peak_stats::PeakSummary;
use daq_tune::tuner::{
    tune_axes, MultiPassOptions, PeakChoice, TunableAxis, TuneAxis, TuneHook, TuneRequest,
};
use daq_tune::DaqError;

fn fast_stage(position: f64) -> Arc<MockStage> {
    Arc::new(
        MockStage::with_position(position)
            .speed(1000.0)
            .settle_time(Duration::from_millis(1)),
    )
}

fn tuner_for(stage: &Arc<MockStage>, detectors: Vec<(&str, Arc<MockPeakDetector>)>) -> TuneAxis {
    TuneAxis::new(
        DeviceRef::new("m1", stage.clone() as Arc<dyn Movable>),
        detectors
            .into_iter()
            .map(|(name, d)| DeviceRef::new(name, d as Arc<dyn Detector>))
            .collect(),
    )
    .with_num_points(21)
}

#[tokio::test]
async fn test_invalid_peak_choice_rejected_before_motion() {
    let stage = fast_stage(0.0);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.0, 0.1, 100.0));

    assert!(TuneRequest::new(1.0, 10, "peak").unwrap_err().is_configuration());

    let settings = TunerSettings {
        peak_choice: "maximum".to_string(),
        ..TunerSettings::default()
    };
    let err = tuner_for(&stage, vec![("I0", det)])
        .configure(&settings)
        .err()
        .unwrap();
    assert!(matches!(err, DaqError::Configuration(_)));
    assert_eq!(stage.move_count(), 0);
}

#[tokio::test]
async fn test_malformed_request_rejected_before_motion() {
    let stage = fast_stage(0.0);
    let mut tuner = TuneAxis::new(
        DeviceRef::new("m1", stage.clone() as Arc<dyn Movable>),
        Vec::new(),
    );
    let recorder = DocumentRecorder::default();

    assert!(tuner.tune(&recorder).await.unwrap_err().is_configuration());

    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.0, 0.1, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)]);
    let request = TuneRequest {
        width: 1.0,
        num_points: 1,
        peak_choice: PeakChoice::Centroid,
    };
    assert!(tuner.tune_with(&recorder, &request).await.is_err());
    assert_eq!(stage.move_count(), 0);
    assert!(recorder.documents().is_empty());
}

#[tokio::test]
async fn test_failed_pass_never_relocates_axis() {
    let stage = fast_stage(0.37);
    let det = Arc::new(MockPeakDetector::flat(stage.clone(), 2.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)]);
    let recorder = DocumentRecorder::default();

    let result = tuner.tune(&recorder).await.unwrap();

    assert!(!result.tune_ok);
    assert_eq!(result.center, None);
    assert_eq!(result.final_position, result.initial_position);
    assert_eq!(stage.position().await.unwrap(), 0.37);
    assert_eq!(recorder.events("primary").len(), 21);
    assert!(recorder.events("PeakStats").is_empty());
}

#[tokio::test]
async fn test_zero_width_samples_one_position() {
    let stage = fast_stage(0.2);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.2, 0.1, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)]).with_width(0.0);
    let recorder = DocumentRecorder::default();

    let result = tuner.tune(&recorder).await.unwrap();
    assert!(!result.tune_ok);
    assert!(result.stats.x.iter().all(|&x| x == 0.2));
    assert_eq!(result.final_position, 0.2);
}

#[tokio::test]
async fn test_center_of_mass_choice() {
    let stage = fast_stage(0.0);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), -0.1, 0.1, 100.0));
    let mut tuner =
        tuner_for(&stage, vec![("I0", det)]).with_peak_choice(PeakChoice::CenterOfMass);
    let recorder = DocumentRecorder::default();

    let result = tuner.tune(&recorder).await.unwrap();
    assert!(result.tune_ok);
    assert_eq!(result.peak_choice, PeakChoice::CenterOfMass);
    assert_eq!(result.center, result.stats.com);
    assert!((result.final_position + 0.1).abs() < 0.02);
}

#[tokio::test]
async fn test_response_signal_selection() {
    let stage = fast_stage(0.0);
    let flat = Arc::new(MockPeakDetector::flat(stage.clone(), 1.0));
    let peaked = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.15, 0.1, 100.0));
    let recorder = DocumentRecorder::default();

    let mut by_default = tuner_for(&stage, vec![("I0", flat.clone()), ("diode", peaked.clone())]);
    assert!(!by_default.tune(&recorder).await.unwrap().tune_ok);

    let mut by_name = tuner_for(&stage, vec![("I0", flat), ("diode", peaked)])
        .with_signal_name("diode");
    let result = by_name.tune(&recorder).await.unwrap();
    assert!(result.tune_ok);
    assert!((result.final_position - 0.15).abs() < 0.01);

    // Every signal is recorded at every point
    let row = &recorder.events("primary")[0];
    assert!(row.data.contains_key("m1"));
    assert!(row.data.contains_key("I0"));
    assert!(row.data.contains_key("diode"));
}

#[tokio::test]
async fn test_multi_pass_stops_on_first_failed_pass() {
    let stage = fast_stage(0.0);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.23, 0.05, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)]);
    let recorder = DocumentRecorder::default();
    let options = MultiPassOptions {
        width: Some(1.0),
        pass_max: 4,
        ..MultiPassOptions::default()
    };

    let history = tuner.multi_pass_tune(&recorder, &options).await.unwrap();

    assert!(history.len() < 4);
    let oks: Vec<bool> = history.iter().map(|r| r.tune_ok).collect();
    assert_eq!(oks, vec![true, true, false]);
    assert_eq!(
        history.iter().map(|r| r.width).collect::<Vec<_>>(),
        vec![1.0, -0.25, 0.0625]
    );

    let last = history.last().unwrap();
    assert_eq!(last.final_position, last.initial_position);
    assert_eq!(stage.position().await.unwrap(), last.initial_position);
    assert!((last.initial_position - 0.23).abs() < 0.01);
    assert_eq!(tuner.history().len(), 3);

    // One run per pass, each tagged with its pass number
    let starts = recorder.starts();
    assert_eq!(starts.len(), 3);
    assert_eq!(starts[2].metadata["pass"], 3);
    assert_eq!(starts[2].metadata["pass_max"], 4);
    assert_eq!(starts[0].plan_name, "TuneAxis.multi_pass_tune");
    assert_eq!(recorder.events("PeakStats").len(), 2);
}

#[tokio::test]
async fn test_multi_pass_runs_full_budget_when_every_pass_succeeds() {
    let stage = fast_stage(0.0);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.05, 0.2, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)])
        .with_peak_detector(|s: &PeakSummary| s.max.is_some());
    let recorder = DocumentRecorder::default();
    let options = MultiPassOptions {
        width: Some(2.0),
        step_factor: 2.0,
        pass_max: 3,
        snake: Some(false),
        ..MultiPassOptions::default()
    };

    let history = tuner.multi_pass_tune(&recorder, &options).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.tune_ok));
    assert_eq!(
        history.iter().map(|r| r.width).collect::<Vec<_>>(),
        vec![2.0, 1.0, 0.5]
    );

    // A fresh multi-pass run starts a fresh history
    let again = tuner.multi_pass_tune(&recorder, &options).await.unwrap();
    assert_eq!(again.len(), 3);
    assert_eq!(tuner.history().len(), 3);
}

#[tokio::test]
async fn test_snake_width_schedule() {
    let stage = fast_stage(0.0);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.0, 0.3, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)])
        .with_peak_detector(|s: &PeakSummary| s.max.is_some());
    let recorder = DocumentRecorder::default();
    let options = MultiPassOptions {
        width: Some(1.5),
        step_factor: 3.0,
        pass_max: 4,
        ..MultiPassOptions::default()
    };

    let history = tuner.multi_pass_tune(&recorder, &options).await.unwrap();
    assert_eq!(history.len(), 4);
    for (k, pair) in history.windows(2).enumerate() {
        assert!(pair[0].width.signum() != pair[1].width.signum(), "pass {k}");
    }
    for (k, result) in history.iter().enumerate() {
        let expected = 1.5 / 3f64.powi(k as i32);
        assert!((result.width.abs() - expected).abs() < 1e-12);
    }
}

#[tokio::test]
async fn test_move_timeout_ends_pass_without_error() {
    let stage = fast_stage(0.4);
    stage.stall_next_moves(1);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.4, 0.1, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)]).with_move_wait(
        WaitOptions::default()
            .with_poll_interval(Duration::from_millis(2))
            .with_timeout(Duration::from_millis(50)),
    );
    let recorder = DocumentRecorder::default();

    let result = tuner.tune(&recorder).await.unwrap();

    assert!(result.timed_out);
    assert!(!result.tune_ok);
    assert_eq!(result.final_position, 0.4);
    assert_eq!(stage.position().await.unwrap(), 0.4);
    assert_eq!(recorder.stops()[0].exit_status, ExitStatus::Fail);
}

#[tokio::test]
async fn test_trigger_timeout_ends_pass_without_error() {
    let stage = fast_stage(0.0);
    let det = Arc::new(
        MockPeakDetector::gaussian(stage.clone(), 0.0, 0.1, 100.0)
            .with_readout(Duration::from_millis(500)),
    );
    let mut tuner = tuner_for(&stage, vec![("I0", det)]).with_trigger_wait(
        WaitOptions::default()
            .with_poll_interval(Duration::from_millis(2))
            .with_timeout(Duration::from_millis(30)),
    );
    let recorder = DocumentRecorder::default();

    let result = tuner.tune(&recorder).await.unwrap();
    assert!(result.timed_out);
    assert!(!result.tune_ok);
    assert_eq!(stage.position().await.unwrap(), 0.0);
    assert!(recorder.events("primary").is_empty());
}

#[tokio::test]
async fn test_hardware_fault_propagates_from_multi_pass() {
    let stage = fast_stage(0.0);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.0, 0.1, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)]);
    stage.fail_after_moves(30);
    let recorder = DocumentRecorder::default();

    let err = tuner
        .multi_pass_tune(&recorder, &MultiPassOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Hardware { .. }));
    // the first pass (21 points + final move) completed before the fault
    assert_eq!(tuner.history().len(), 1);
}

struct CountingHook(AtomicUsize);

#[async_trait]
impl TuneHook for CountingHook {
    async fn run(&self, _axis: &DeviceRef<dyn Movable>) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_tune_axes_runs_hooks_and_stops_on_error() {
    let stage_a = fast_stage(0.0);
    let det_a = Arc::new(MockPeakDetector::gaussian(stage_a.clone(), 0.1, 0.1, 100.0));
    let pre = Arc::new(CountingHook(AtomicUsize::new(0)));
    let post = Arc::new(CountingHook(AtomicUsize::new(0)));
    let axis_a = TunableAxis::new(DeviceRef::new("m1", stage_a.clone() as Arc<dyn Movable>))
        .with_tuner(tuner_for(&stage_a, vec![("I0", det_a)]))
        .with_options(MultiPassOptions {
            pass_max: 2,
            ..MultiPassOptions::default()
        })
        .with_pre_tune(Some(pre.clone()))
        .with_post_tune(Some(post.clone()));

    let recorder = DocumentRecorder::default();
    let mut axes = vec![axis_a];
    let reports = tune_axes(&mut axes, &recorder).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].axis, "m1");
    assert!(!reports[0].passes.is_empty());
    assert_eq!(pre.0.load(Ordering::SeqCst), 1);
    assert_eq!(post.0.load(Ordering::SeqCst), 1);

    let json = serde_json::to_value(&reports).unwrap();
    assert!(json[0]["passes"][0]["tune_ok"].is_boolean());

    // An axis without a tuner ends the sequence with a configuration error
    let stage_b = fast_stage(0.0);
    axes.push(TunableAxis::new(DeviceRef::new("m2", stage_b as Arc<dyn Movable>)));
    let err = tune_axes(&mut axes, &recorder).await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(pre.0.load(Ordering::SeqCst), 2);
}

/// Detector whose arm command never completes.
struct HangingArmDetector;

#[async_trait]
impl Triggerable for HangingArmDetector {
    async fn arm(&self) -> anyhow::Result<()> {
        std::future::pending().await
    }

    async fn trigger(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Readable for HangingArmDetector {
    async fn read(&self) -> anyhow::Result<f64> {
        Ok(1.0)
    }
}

#[tokio::test]
async fn test_arm_timeout_skips_scan() {
    let stage = fast_stage(0.3);
    let mut tuner = TuneAxis::new(
        DeviceRef::new("m1", stage.clone() as Arc<dyn Movable>),
        vec![DeviceRef::new("I0", Arc::new(HangingArmDetector) as Arc<dyn Detector>)],
    )
    .with_num_points(21)
    .with_trigger_wait(
        WaitOptions::default()
            .with_poll_interval(Duration::from_millis(2))
            .with_timeout(Duration::from_millis(20)),
    );
    let recorder = DocumentRecorder::default();

    let result = tuner.tune(&recorder).await.unwrap();

    assert!(result.timed_out);
    assert!(!result.tune_ok);
    assert_eq!(result.final_position, 0.3);
    assert!(recorder.events("primary").is_empty());
    // only the move back to the initial position
    assert_eq!(stage.move_count(), 1);
    assert_eq!(stage.position().await.unwrap(), 0.3);
    let stop = &recorder.stops()[0];
    assert_eq!(stop.exit_status, ExitStatus::Fail);
    assert!(stop.reason.contains("timed out"));
}

#[tokio::test]
async fn test_unusable_timeout_settings_are_configuration_errors() {
    let stage = fast_stage(0.0);
    let cases = [
        (Some(-1.0), None),
        (Some(f64::NAN), None),
        (None, Some(f64::MAX)),
        (None, Some(0.0)),
    ];
    for (move_timeout_s, trigger_timeout_s) in cases {
        let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.0, 0.1, 100.0));
        let settings = TunerSettings {
            move_timeout_s,
            trigger_timeout_s,
            ..TunerSettings::default()
        };
        let err = tuner_for(&stage, vec![("I0", det)])
            .configure(&settings)
            .err()
            .unwrap();
        assert!(err.is_configuration(), "{move_timeout_s:?}/{trigger_timeout_s:?}: {err}");
    }

    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.0, 0.1, 100.0));
    let settings = TunerSettings {
        move_timeout_s: Some(2.5),
        trigger_timeout_s: Some(0.5),
        ..TunerSettings::default()
    };
    assert!(tuner_for(&stage, vec![("I0", det)]).configure(&settings).is_ok());
    assert_eq!(stage.move_count(), 0);
}

#[tokio::test]
async fn test_rejected_request_keeps_history() {
    let stage = fast_stage(0.0);
    let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.1, 0.1, 100.0));
    let mut tuner = tuner_for(&stage, vec![("I0", det)]);
    let recorder = DocumentRecorder::default();

    tuner.tune(&recorder).await.unwrap();
    assert_eq!(tuner.history().len(), 1);
    let moves = stage.move_count();

    let bad = TuneRequest {
        width: 1.0,
        num_points: 1,
        peak_choice: PeakChoice::Centroid,
    };
    let err = tuner.tune_with(&recorder, &bad).await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(tuner.history().len(), 1);
    assert!(tuner.history()[0].tune_ok);
    assert_eq!(stage.move_count(), moves);
}
