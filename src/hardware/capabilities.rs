//! Atomic Hardware Capabilities
//!
//! Fine-grained capability traits that devices implement. Orchestration code is
//! written against trait bounds rather than concrete drivers:
//!
//! - A stage implements: `Movable`
//! - A counter or diode implements: `Triggerable + Readable` (and so `Detector`)
//! - A hardware scan engine implements: `ScanRecord`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Notifications
//!
//! `ScanRecord` exposes two subscribable process variables, the *execute* control
//! and the *phase* indicator. Callbacks run on the driver's own execution context:
//! they must only set flags and must never block, emit data, or unsubscribe.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capability: Motion Control
///
/// Devices that can move to positions (stages, actuators, goniometers).
///
/// # Contract
/// - Positions are in device-native units (typically mm or degrees)
/// - `move_abs` and `move_rel` initiate motion but may return before completion
/// - `wait_settled` blocks until motion completes
/// - `position` returns current position (may be approximate during motion)
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Get current position
    ///
    /// May be approximate if device is currently moving.
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle
    ///
    /// Blocks until device reports motion is complete.
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: External Triggering
///
/// Devices that can be armed and triggered (counters, detectors, cameras).
///
/// # Contract
/// - `arm()` prepares device for trigger (may configure hardware buffers)
/// - `trigger()` starts an acquisition and returns once its data is ready
/// - Calling `trigger()` on unarmed device should return Err
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Arm device for trigger
    async fn arm(&self) -> Result<()>;

    /// Trigger an acquisition and wait until it is ready to read
    async fn trigger(&self) -> Result<()>;

    /// Check if device is currently armed
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_armed(&self) -> Result<bool> {
        anyhow::bail!("Armed state query not supported by this device")
    }
}

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (counters, power meters, diodes).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read current value
    async fn read(&self) -> Result<f64>;
}

/// Combined trait for sensors that are triggered and then read.
///
/// Exists to enable trait objects; implement the individual traits and get this
/// automatically via the blanket impl.
pub trait Detector: Triggerable + Readable {}

impl<T: Triggerable + Readable> Detector for T {}

/// A device together with the name it is recorded under.
pub struct DeviceRef<T: ?Sized> {
    /// Name used as the data key in emitted records
    pub name: String,
    /// The device itself
    pub device: Arc<T>,
}

impl<T: ?Sized> DeviceRef<T> {
    /// Wrap a shared device under `name`
    pub fn new(name: impl Into<String>, device: Arc<T>) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }
}

impl<T: ?Sized> Clone for DeviceRef<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            device: Arc::clone(&self.device),
        }
    }
}

impl<T: ?Sized> fmt::Debug for DeviceRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRef")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Process variables and subscriptions
// ============================================================================

/// Value carried by a change notification.
///
/// Control-system enums arrive either as their integer index or their label,
/// depending on how the channel was connected, so both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer or enum index
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// String or enum label
    Text(String),
}

impl PvValue {
    /// True if this is either the integer `index` or the label `label`
    /// (label comparison ignores ASCII case).
    pub fn is_enum(&self, index: i64, label: &str) -> bool {
        match self {
            PvValue::Int(v) => *v == index,
            PvValue::Float(v) => *v == index as f64,
            PvValue::Text(s) => s.eq_ignore_ascii_case(label),
        }
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::Int(value)
    }
}

impl From<&str> for PvValue {
    fn from(value: &str) -> Self {
        PvValue::Text(value.to_string())
    }
}

/// Callback invoked on every value change of a subscribed process variable.
pub type ValueCallback = Arc<dyn Fn(&PvValue) + Send + Sync>;

/// Handle returned when subscribing, used for unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl SubscriptionHandle {
    /// Create a new handle with the given ID.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the internal ID (for debugging/logging).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Execute control value meaning "idle / scan finished".
pub const EXECUTE_IDLE: (i64, &str) = (0, "IDLE");

/// Phase indicator value meaning "a new data row is ready".
pub const PHASE_RECORD_SCALAR_DATA: (i64, &str) = (15, "RECORD SCALAR DATA");

/// Capability: Hardware-driven Scan
///
/// A device that runs a whole multi-point acquisition on its own once started
/// (an sscan-style record). Progress is reported only through notifications.
///
/// # Contract
/// - `subscribe_*` must be callable before `start()`; callbacks fire on every change
/// - `start()` writes the execute control and returns once the command is issued;
///   from then until the scan ends, [`read_execute`](Self::read_execute) must not
///   report [`EXECUTE_IDLE`]
/// - the execute control returns to [`EXECUTE_IDLE`] when the scan ends
/// - the phase indicator passes through [`PHASE_RECORD_SCALAR_DATA`] once per row,
///   after that row's values are stored at its index in the channel arrays
/// - `unsubscribe` is synchronous; no callback for that handle fires after it returns
#[async_trait]
pub trait ScanRecord: Send + Sync {
    /// Device name, used in logs and run metadata
    fn name(&self) -> &str;

    /// Restrict acquisition to the channels that are actually configured.
    ///
    /// # Default Implementation
    /// No-op.
    async fn select_channels(&self) -> Result<()> {
        Ok(())
    }

    /// Names of the channels read for every row, in read order
    fn channels(&self) -> Vec<String>;

    /// Subscribe to execute-control changes
    fn subscribe_execute(&self, callback: ValueCallback) -> SubscriptionHandle;

    /// Subscribe to phase-indicator changes
    fn subscribe_phase(&self, callback: ValueCallback) -> SubscriptionHandle;

    /// Remove a subscription made by either `subscribe_*` method
    fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Issue the start command
    async fn start(&self) -> Result<()>;

    /// Current value of the execute control
    async fn read_execute(&self) -> Result<PvValue>;

    /// Value of `channel` at row `index` (0-based) of the running scan.
    ///
    /// # Default Implementation
    /// Element `index` of [`read_channel_array`](Self::read_channel_array).
    async fn read_row(&self, channel: &str, index: usize) -> Result<f64> {
        let values = self.read_channel_array(channel).await?;
        values.get(index).copied().ok_or_else(|| {
            anyhow::anyhow!(
                "row {} of channel '{}' not acquired yet ({} rows)",
                index,
                channel,
                values.len()
            )
        })
    }

    /// Read the full accumulated array of one channel
    async fn read_channel_array(&self, channel: &str) -> Result<Vec<f64>>;

    /// Snapshot of every readable setting of the device
    async fn read_settings(&self) -> Result<BTreeMap<String, serde_json::Value>>;
}
