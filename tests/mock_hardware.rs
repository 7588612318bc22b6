//! Integration tests for mock hardware implementations
//!
//! These tests verify that MockStage, MockPeakDetector and MockScanRecord
//! implement the capability traits and exhibit realistic behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use daq_tune::blocking::{spawn_async_call, CallOutcome, WaitOptions};
use daq_tune::hardware::capabilities::{Movable, Readable, ScanRecord, Triggerable};
use daq_tune::hardware::mock::{MockPeakDetector, MockScanRecord, MockStage};

// =============================================================================
// MockStage Tests
// =============================================================================

#[tokio::test]
async fn test_mock_stage_timing() {
    let stage = MockStage::new();

    // 2mm at 10mm/sec should take ~200ms
    let start = Instant::now();
    stage.move_abs(2.0).await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed.as_millis() >= 190 && elapsed.as_millis() <= 400,
        "Expected ~200ms, got {}ms",
        elapsed.as_millis()
    );
}

#[tokio::test]
async fn test_mock_stage_settle_timing() {
    let stage = MockStage::new().speed(1000.0);

    stage.move_abs(1.0).await.unwrap();

    let start = Instant::now();
    stage.wait_settled().await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed.as_millis() >= 45 && elapsed.as_millis() <= 150,
        "Expected ~50ms, got {}ms",
        elapsed.as_millis()
    );
}

#[tokio::test]
async fn test_mock_stage_multiple_moves() {
    let stage = MockStage::new().speed(1000.0);

    for i in 1..=5 {
        let target = i as f64 * 2.0;
        stage.move_abs(target).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), target);
    }
    assert_eq!(stage.move_count(), 5);
}

#[tokio::test]
async fn test_stalled_move_times_out_through_pending_call() {
    let stage = Arc::new(MockStage::new().speed(1000.0));
    stage.stall_next_moves(1);

    let s = stage.clone();
    let call = spawn_async_call(async move { s.move_abs(5.0).await });
    let outcome = call
        .wait(
            WaitOptions::default()
                .with_poll_interval(Duration::from_millis(2))
                .with_timeout(Duration::from_millis(40)),
        )
        .await;
    assert!(outcome.is_timed_out());
    assert_eq!(stage.position().await.unwrap(), 0.0);

    // Only the next move was stalled
    let s = stage.clone();
    let outcome = spawn_async_call(async move { s.move_abs(5.0).await })
        .wait(WaitOptions::default())
        .await;
    assert!(matches!(outcome, CallOutcome::Completed(())));
    assert_eq!(stage.position().await.unwrap(), 5.0);
}

// =============================================================================
// MockPeakDetector Tests
// =============================================================================

#[tokio::test]
async fn test_detector_unarmed_trigger_fails() {
    let stage = Arc::new(MockStage::new());
    let det = MockPeakDetector::gaussian(stage, 0.0, 0.1, 100.0);

    assert!(det.trigger().await.is_err(), "Trigger should fail when not armed");
    assert!(!det.is_armed().await.unwrap());
    assert_eq!(det.trigger_count(), 0);
}

#[tokio::test]
async fn test_detector_readout_timing() {
    let stage = Arc::new(MockStage::new());
    let det = MockPeakDetector::gaussian(stage, 0.0, 0.1, 100.0)
        .with_readout(Duration::from_millis(30));
    det.arm().await.unwrap();

    let start = Instant::now();
    det.trigger().await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed.as_millis() >= 25 && elapsed.as_millis() <= 120,
        "Expected ~30ms, got {}ms",
        elapsed.as_millis()
    );
}

#[tokio::test]
async fn test_synchronized_stage_detector() {
    let stage = Arc::new(
        MockStage::new()
            .speed(1000.0)
            .settle_time(Duration::from_millis(1)),
    );
    let det = MockPeakDetector::gaussian(stage.clone(), 0.5, 0.2, 50.0).with_background(2.0);
    det.arm().await.unwrap();

    let positions = [0.0, 0.25, 0.5, 0.75, 1.0];
    let mut readings = Vec::new();
    for (i, &pos) in positions.iter().enumerate() {
        stage.move_abs(pos).await.unwrap();
        stage.wait_settled().await.unwrap();
        det.trigger().await.unwrap();

        let value = det.read().await.unwrap();
        assert!((value - det.response(pos)).abs() < 1e-12);
        assert_eq!(det.trigger_count(), (i + 1) as u64);
        readings.push(value);
    }

    // Symmetric about the peak, largest at the center
    assert!((readings[0] - readings[4]).abs() < 1e-9);
    assert!((readings[1] - readings[3]).abs() < 1e-9);
    assert!((readings[2] - 52.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_flat_detector_has_no_peak() {
    let stage = Arc::new(MockStage::new());
    let det = MockPeakDetector::flat(stage, 3.0);
    for x in [-10.0, 0.0, 0.5, 10.0] {
        assert_eq!(det.response(x), 3.0);
    }
}

// =============================================================================
// MockScanRecord Tests
// =============================================================================

#[tokio::test]
async fn test_scan_record_rejects_double_start() {
    let scan = MockScanRecord::linear("scan1", 0.0, 1.0, 5, Duration::from_millis(10));
    scan.start().await.unwrap();
    assert!(scan.is_running());
    assert!(scan.start().await.is_err());
}

#[tokio::test]
async fn test_scan_record_failing_start() {
    let scan = MockScanRecord::linear("scan1", 0.0, 1.0, 5, Duration::from_millis(10))
        .failing_start();
    assert!(scan.start().await.is_err());
    assert!(!scan.is_running());
}

#[tokio::test]
async fn test_scan_record_settings_snapshot() {
    let scan = MockScanRecord::new("scan7", vec![0.1, 0.2], Duration::from_millis(5));
    let settings = scan.read_settings().await.unwrap();
    assert_eq!(settings["name"], "scan7");
    assert_eq!(settings["npts"], 2);
    assert_eq!(scan.name(), "scan7");
    assert_eq!(scan.channels(), vec!["p1".to_string(), "d1".to_string()]);
    assert!(scan.read_channel_array("nope").await.is_err());
}
