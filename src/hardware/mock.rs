//! Mock Hardware Implementations
//!
//! Simulated devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockStage` - Simulated motion stage with realistic timing and fault injection
//! - `MockPeakDetector` - Triggerable detector whose response is a Gaussian of a stage position
//! - `MockScanRecord` - Hardware scan engine that reports progress only through notifications
//!
//! # Performance Characteristics
//!
//! - MockStage: 10mm/sec motion speed, 50ms settling time (both adjustable)
//! - MockPeakDetector: 1ms readout
//! - MockScanRecord: one row per `point_interval`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::hardware::capabilities::{
    Movable, PvValue, Readable, ScanRecord, SubscriptionHandle, Triggerable, ValueCallback,
};

// =============================================================================
// MockStage - Simulated Motion Stage
// =============================================================================

/// Mock motion stage with realistic timing
///
/// Simulates a linear stage with:
/// - 10mm/sec motion speed
/// - 50ms settling time after motion
/// - Thread-safe position tracking
/// - Injectable faults (failing moves, moves that never complete)
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new();
/// stage.move_abs(10.0).await?; // Takes ~1 second
/// assert_eq!(stage.position().await?, 10.0);
/// ```
pub struct MockStage {
    position: Arc<RwLock<f64>>,
    speed_mm_per_sec: f64,
    settle_time: Duration,
    move_count: AtomicU64,
    fail_after_moves: AtomicU64,
    stalled_moves: AtomicU64,
}

impl MockStage {
    /// Create new mock stage at position 0.0mm
    pub fn new() -> Self {
        Self::with_position(0.0)
    }

    /// Create new mock stage at specified initial position
    pub fn with_position(initial_position: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(initial_position)),
            speed_mm_per_sec: 10.0,
            settle_time: Duration::from_millis(50),
            move_count: AtomicU64::new(0),
            fail_after_moves: AtomicU64::new(u64::MAX),
            stalled_moves: AtomicU64::new(0),
        }
    }

    /// Create mock stage with custom speed
    pub fn with_speed(speed_mm_per_sec: f64) -> Self {
        Self {
            speed_mm_per_sec,
            ..Self::new()
        }
    }

    /// Set the motion speed (builder style)
    pub fn speed(mut self, speed_mm_per_sec: f64) -> Self {
        self.speed_mm_per_sec = speed_mm_per_sec;
        self
    }

    /// Set the settling time (builder style)
    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Make every move after the first `n` return an error
    pub fn fail_after_moves(&self, n: u64) {
        self.fail_after_moves.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` moves hang forever without changing position
    pub fn stall_next_moves(&self, n: u64) {
        self.stalled_moves.store(n, Ordering::SeqCst);
    }

    /// Number of `move_abs` calls issued so far (including failed ones)
    pub fn move_count(&self) -> u64 {
        self.move_count.load(Ordering::SeqCst)
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, target: f64) -> Result<()> {
        let issued = self.move_count.fetch_add(1, Ordering::SeqCst);
        if issued >= self.fail_after_moves.load(Ordering::SeqCst) {
            anyhow::bail!("MockStage: motor fault on move #{}", issued + 1);
        }
        if self
            .stalled_moves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!(target, "MockStage: move stalled");
            std::future::pending::<()>().await;
        }

        let current = *self.position.read().await;
        let distance = (target - current).abs();
        let delay = Duration::from_secs_f64(distance / self.speed_mm_per_sec);

        debug!(from = current, to = target, ?delay, "MockStage: moving");

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(delay).await;

        *self.position.write().await = target;
        trace!(position = target, "MockStage: reached target");
        Ok(())
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = *self.position.read().await;
        self.move_abs(current + distance).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn wait_settled(&self) -> Result<()> {
        sleep(self.settle_time).await;
        Ok(())
    }
}

// =============================================================================
// MockPeakDetector - Gaussian response of a stage position
// =============================================================================

/// Detector whose signal is `background + amplitude * exp(-(x - center)^2 / (2 sigma^2))`,
/// with `x` the position of the attached stage at trigger time.
///
/// # Example
///
/// ```rust,ignore
/// let stage = Arc::new(MockStage::new());
/// let det = MockPeakDetector::gaussian(stage.clone(), 0.2, 0.05, 1e5);
/// det.arm().await?;
/// det.trigger().await?;
/// let counts = det.read().await?;
/// ```
pub struct MockPeakDetector {
    stage: Arc<MockStage>,
    center: f64,
    sigma: f64,
    amplitude: f64,
    background: f64,
    readout: Duration,
    armed: AtomicBool,
    latest: RwLock<f64>,
    trigger_count: AtomicU64,
}

impl MockPeakDetector {
    /// Gaussian peak with a background of 1.0
    pub fn gaussian(stage: Arc<MockStage>, center: f64, sigma: f64, amplitude: f64) -> Self {
        Self {
            stage,
            center,
            sigma,
            amplitude,
            background: 1.0,
            readout: Duration::from_millis(1),
            armed: AtomicBool::new(false),
            latest: RwLock::new(0.0),
            trigger_count: AtomicU64::new(0),
        }
    }

    /// Constant signal, no peak anywhere
    pub fn flat(stage: Arc<MockStage>, level: f64) -> Self {
        Self::gaussian(stage, 0.0, 1.0, 0.0).with_background(level)
    }

    /// Set the background level
    pub fn with_background(mut self, background: f64) -> Self {
        self.background = background;
        self
    }

    /// Set the per-trigger readout time
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Signal value at position `x`
    pub fn response(&self, x: f64) -> f64 {
        let arg = if self.sigma > 0.0 {
            -(x - self.center).powi(2) / (2.0 * self.sigma.powi(2))
        } else {
            f64::NEG_INFINITY
        };
        self.background + self.amplitude * arg.exp()
    }

    /// Number of triggers accepted so far
    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Triggerable for MockPeakDetector {
    async fn arm(&self) -> Result<()> {
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        if !self.armed.load(Ordering::SeqCst) {
            anyhow::bail!("MockPeakDetector: Cannot trigger - not armed");
        }
        let x = *self.stage.position.read().await;
        sleep(self.readout).await;
        *self.latest.write().await = self.response(x);
        self.trigger_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.armed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Readable for MockPeakDetector {
    async fn read(&self) -> Result<f64> {
        Ok(*self.latest.read().await)
    }
}

// =============================================================================
// MockScanRecord - Notification-driven hardware scan
// =============================================================================

const POSITIONER: &str = "p1";
const DETECTOR: &str = "d1";

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    execute: BTreeMap<u64, ValueCallback>,
    phase: BTreeMap<u64, ValueCallback>,
}

#[derive(Default)]
struct ScanData {
    arrays: BTreeMap<String, Vec<f64>>,
}

struct ScanInner {
    name: String,
    positions: Vec<f64>,
    point_interval: Duration,
    stall_after: Option<usize>,
    fail_start: bool,
    subscribers: Mutex<Subscribers>,
    data: Mutex<ScanData>,
    execute: Mutex<PvValue>,
    phase: Mutex<PvValue>,
    running: AtomicBool,
}

impl ScanInner {
    fn set_execute(&self, value: PvValue) {
        *self.execute.lock() = value.clone();
        let callbacks: Vec<ValueCallback> =
            self.subscribers.lock().execute.values().cloned().collect();
        for cb in callbacks {
            cb(&value);
        }
    }

    fn set_phase(&self, value: PvValue) {
        *self.phase.lock() = value.clone();
        let callbacks: Vec<ValueCallback> =
            self.subscribers.lock().phase.values().cloned().collect();
        for cb in callbacks {
            cb(&value);
        }
    }

    fn record_point(&self, x: f64) {
        let y = 1.0 + 100.0 * (-(x * x) / 2.0).exp();
        let mut data = self.data.lock();
        for (key, value) in [(POSITIONER, x), (DETECTOR, y)] {
            data.arrays.entry(key.to_string()).or_default().push(value);
        }
    }

    async fn simulate(self: Arc<Self>) {
        let half = self.point_interval / 2;
        for (index, &x) in self.positions.iter().enumerate() {
            if self.stall_after == Some(index) {
                debug!(scan = %self.name, index, "MockScanRecord: stalling");
                return;
            }
            self.set_phase(PvValue::Text("MOVE POSITIONERS".into()));
            sleep(half).await;
            self.record_point(x);
            self.set_phase(PvValue::Int(15));
            sleep(half).await;
        }
        self.set_phase(PvValue::Int(0));
        self.running.store(false, Ordering::SeqCst);
        self.set_execute(PvValue::Int(0));
    }
}

/// Simulated sscan-style record.
///
/// After `start()` it visits each position, posting a "RECORD SCALAR DATA" phase
/// (value 15) per point, then returns the execute control to 0. Channels are
/// a positioner `p1` and a detector `d1` peaked at 0.
pub struct MockScanRecord {
    inner: Arc<ScanInner>,
}

impl MockScanRecord {
    /// Scan over the given positions, one row every `point_interval`
    pub fn new(name: &str, positions: Vec<f64>, point_interval: Duration) -> Self {
        Self {
            inner: Arc::new(ScanInner {
                name: name.to_string(),
                positions,
                point_interval,
                stall_after: None,
                fail_start: false,
                subscribers: Mutex::new(Subscribers::default()),
                data: Mutex::new(ScanData::default()),
                execute: Mutex::new(PvValue::Int(0)),
                phase: Mutex::new(PvValue::Int(0)),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Evenly spaced scan of `num_points` points over `[start, stop]`
    pub fn linear(name: &str, start: f64, stop: f64, num_points: usize, point_interval: Duration) -> Self {
        let positions = crate::tuner::linspace(start, stop, num_points);
        Self::new(name, positions, point_interval)
    }

    /// Go silent (no more notifications, never idle) before row `index`
    pub fn stall_after(self, index: usize) -> Self {
        self.map_inner(|inner| inner.stall_after = Some(index))
    }

    /// Make `start()` fail
    pub fn failing_start(self) -> Self {
        self.map_inner(|inner| inner.fail_start = true)
    }

    fn map_inner(self, f: impl FnOnce(&mut ScanInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    /// Active execute + phase subscriptions
    pub fn subscriber_count(&self) -> usize {
        let subs = self.inner.subscribers.lock();
        subs.execute.len() + subs.phase.len()
    }

    /// Whether the simulated scan is still running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanRecord for MockScanRecord {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn channels(&self) -> Vec<String> {
        vec![POSITIONER.to_string(), DETECTOR.to_string()]
    }

    fn subscribe_execute(&self, callback: ValueCallback) -> SubscriptionHandle {
        let mut subs = self.inner.subscribers.lock();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.execute.insert(id, callback);
        SubscriptionHandle::new(id)
    }

    fn subscribe_phase(&self, callback: ValueCallback) -> SubscriptionHandle {
        let mut subs = self.inner.subscribers.lock();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.phase.insert(id, callback);
        SubscriptionHandle::new(id)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subs = self.inner.subscribers.lock();
        subs.execute.remove(&handle.id());
        subs.phase.remove(&handle.id());
    }

    async fn start(&self) -> Result<()> {
        if self.inner.fail_start {
            anyhow::bail!("MockScanRecord: execute write rejected");
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("MockScanRecord: scan already running");
        }
        *self.inner.data.lock() = ScanData::default();
        self.inner.set_execute(PvValue::Int(1));
        tokio::spawn(Arc::clone(&self.inner).simulate());
        Ok(())
    }

    async fn read_execute(&self) -> Result<PvValue> {
        Ok(self.inner.execute.lock().clone())
    }

    async fn read_channel_array(&self, channel: &str) -> Result<Vec<f64>> {
        if !self.channels().iter().any(|c| c == channel) {
            anyhow::bail!("MockScanRecord: unknown channel '{}'", channel);
        }
        Ok(self
            .inner
            .data
            .lock()
            .arrays
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_row(&self, channel: &str, index: usize) -> Result<f64> {
        self.inner
            .data
            .lock()
            .arrays
            .get(channel)
            .and_then(|values| values.get(index))
            .copied()
            .ok_or_else(|| anyhow!("MockScanRecord: no row {} for channel '{}'", index, channel))
    }

    async fn read_settings(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let inner = &self.inner;
        let mut settings = BTreeMap::new();
        settings.insert("name".to_string(), serde_json::json!(inner.name));
        settings.insert("npts".to_string(), serde_json::json!(inner.positions.len()));
        settings.insert(
            "point_interval_s".to_string(),
            serde_json::json!(inner.point_interval.as_secs_f64()),
        );
        settings.insert(
            "execute".to_string(),
            serde_json::to_value(&*inner.execute.lock())?,
        );
        settings.insert(
            "phase".to_string(),
            serde_json::to_value(&*inner.phase.lock())?,
        );
        settings.insert(
            "positions".to_string(),
            serde_json::json!(inner.positions),
        );
        Ok(settings)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_stage() -> MockStage {
        MockStage::new()
            .speed(1000.0)
            .settle_time(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_mock_stage_absolute_move() {
        let stage = fast_stage();
        assert_eq!(stage.position().await.unwrap(), 0.0);

        stage.move_abs(10.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 10.0);

        stage.move_abs(25.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 25.0);
        assert_eq!(stage.move_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_stage_relative_move() {
        let stage = fast_stage();

        stage.move_rel(5.0).await.unwrap();
        stage.move_rel(10.0).await.unwrap();
        stage.move_rel(-3.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 12.0);
    }

    #[tokio::test]
    async fn test_mock_stage_fault_injection() {
        let stage = fast_stage();
        stage.fail_after_moves(1);
        stage.move_abs(1.0).await.unwrap();
        assert!(stage.move_abs(2.0).await.is_err());
        assert_eq!(stage.position().await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_mock_stage_stalled_move() {
        let stage = fast_stage();
        stage.stall_next_moves(1);
        let stalled =
            tokio::time::timeout(Duration::from_millis(30), stage.move_abs(3.0)).await;
        assert!(stalled.is_err());
        stage.move_abs(4.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 4.0);
    }

    #[tokio::test]
    async fn test_peak_detector_follows_stage() {
        let stage = Arc::new(fast_stage());
        let det = MockPeakDetector::gaussian(stage.clone(), 1.0, 0.1, 100.0);

        assert!(det.trigger().await.is_err());
        det.arm().await.unwrap();

        stage.move_abs(1.0).await.unwrap();
        det.trigger().await.unwrap();
        assert!((det.read().await.unwrap() - 101.0).abs() < 1e-9);

        stage.move_abs(5.0).await.unwrap();
        det.trigger().await.unwrap();
        assert!((det.read().await.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(det.trigger_count(), 2);
    }

    #[tokio::test]
    async fn test_scan_record_posts_rows_then_idles() {
        let scan = MockScanRecord::linear("scan1", -1.0, 1.0, 3, Duration::from_millis(4));
        let rows = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(AtomicBool::new(false));

        let r = rows.clone();
        scan.subscribe_phase(Arc::new(move |v: &PvValue| {
            if v.is_enum(15, "RECORD SCALAR DATA") {
                r.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let i = idle.clone();
        scan.subscribe_execute(Arc::new(move |v: &PvValue| {
            if v.is_enum(0, "IDLE") {
                i.store(true, Ordering::SeqCst);
            }
        }));

        scan.start().await.unwrap();
        for _ in 0..200 {
            if idle.load(Ordering::SeqCst) {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        assert!(idle.load(Ordering::SeqCst));
        assert_eq!(rows.load(Ordering::SeqCst), 3);
        assert_eq!(scan.read_channel_array("p1").await.unwrap(), vec![-1.0, 0.0, 1.0]);
        assert!(!scan.is_running());
    }

    #[tokio::test]
    async fn test_scan_record_unsubscribe() {
        let scan = MockScanRecord::linear("scan1", 0.0, 1.0, 2, Duration::from_millis(2));
        let h1 = scan.subscribe_execute(Arc::new(|_: &PvValue| {}));
        let h2 = scan.subscribe_phase(Arc::new(|_: &PvValue| {}));
        assert_eq!(scan.subscriber_count(), 2);
        scan.unsubscribe(h1);
        scan.unsubscribe(h2);
        assert_eq!(scan.subscriber_count(), 0);
    }
}
