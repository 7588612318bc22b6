//! Blocking-call adapter.
//!
//! Runs work on an independent execution path and publishes its outcome through a
//! [`Status`], so the orchestrating task can keep polling instead of blocking.
//!
//! The contract is two-step: *start* ([`spawn_blocking_call`], [`spawn_async_call`])
//! returns a [`PendingCall`] immediately, then *await* ([`PendingCall::wait`]) polls
//! the status every `poll_interval`, yielding to the runtime between checks.
//!
//! # Timeouts do not cancel
//!
//! When the timeout elapses first, the status is marked failed and the call is
//! reported as [`CallOutcome::TimedOut`]. The underlying work is **not** killed: a
//! blocking function keeps running on its thread until it returns, and any
//! resources it holds stay held until then. Its late result is discarded.
//!
//! # Example
//!
//! ```rust,no_run
//! use daq_tune::blocking::{run_blocker, WaitOptions};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let status = run_blocker(
//!     || {
//!         std::thread::sleep(Duration::from_millis(50));
//!         Ok(())
//!     },
//!     WaitOptions::default().with_timeout(Duration::from_secs(1)),
//! )
//! .await;
//! assert!(status.succeeded());
//! # }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::status::Status;

/// Default sleep between status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How to await a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitOptions {
    /// Sleep between checks
    pub poll_interval: Duration,
    /// Give up (and mark the status failed) after this long; `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

impl WaitOptions {
    /// Set the poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set or clear the timeout
    pub fn with_optional_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of awaiting a [`PendingCall`].
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// The call returned a value before the deadline
    Completed(T),
    /// The call returned an error (or panicked) before the deadline
    Failed(anyhow::Error),
    /// The deadline passed first; the call may still be running
    TimedOut,
}

impl<T> CallOutcome<T> {
    /// Whether the outcome is [`CallOutcome::TimedOut`]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, CallOutcome::TimedOut)
    }
}

type Slot<T> = Arc<Mutex<Option<anyhow::Result<T>>>>;

/// Handle to work started by [`spawn_blocking_call`] or [`spawn_async_call`].
pub struct PendingCall<T> {
    status: Status,
    slot: Slot<T>,
}

impl<T> PendingCall<T> {
    fn new() -> (Self, Status, Slot<T>) {
        let status = Status::new();
        let slot: Slot<T> = Arc::new(Mutex::new(None));
        (
            Self {
                status: status.clone(),
                slot: slot.clone(),
            },
            status,
            slot,
        )
    }

    /// Completion signal for this call.
    pub fn status(&self) -> Status {
        self.status.clone()
    }

    /// Poll until the call finishes or the timeout elapses.
    pub async fn wait(self, options: WaitOptions) -> CallOutcome<T> {
        if poll_until_done(&self.status, &options).await {
            return CallOutcome::TimedOut;
        }
        match self.slot.lock().take() {
            Some(Ok(value)) => CallOutcome::Completed(value),
            Some(Err(err)) => CallOutcome::Failed(err),
            None => CallOutcome::Failed(anyhow!("call finished without reporting an outcome")),
        }
    }
}

fn publish<T>(status: &Status, slot: &Slot<T>, result: anyhow::Result<T>) {
    let ok = result.is_ok();
    *slot.lock() = Some(result);
    let applied = if ok {
        status.mark_success()
    } else {
        status.mark_failure()
    };
    if !applied {
        debug!("call finished after its status was already terminal; outcome discarded");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Start a blocking function on the runtime's blocking pool.
///
/// Must be called from within a tokio runtime. A panic inside `func` is reported
/// as [`CallOutcome::Failed`].
pub fn spawn_blocking_call<F, T>(func: F) -> PendingCall<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (pending, status, slot) = PendingCall::new();
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(AssertUnwindSafe(func)).unwrap_or_else(|payload| {
            Err(anyhow!(
                "blocking call panicked: {}",
                panic_message(payload.as_ref())
            ))
        });
        publish(&status, &slot, result);
    });
    pending
}

/// Start an async operation (typically a device command) as its own task.
///
/// Same contract as [`spawn_blocking_call`]: the future keeps running after a
/// timeout is reported.
pub fn spawn_async_call<Fut, T>(future: Fut) -> PendingCall<T>
where
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (pending, status, slot) = PendingCall::new();
    tokio::spawn(async move {
        let result = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(anyhow!("async call panicked: {}", panic_message(payload.as_ref())))
            });
        publish(&status, &slot, result);
    });
    pending
}

/// Run `func` on a separate thread and await it.
///
/// Returns the call's completion signal: succeeded if `func` returned `Ok` in time,
/// failed if it errored, panicked or timed out.
pub async fn run_blocker<F>(func: F, options: WaitOptions) -> Status
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    let pending = spawn_blocking_call(func);
    let status = pending.status();
    match pending.wait(options).await {
        CallOutcome::Completed(()) => {}
        CallOutcome::Failed(err) => warn!(error = %err, "blocking call failed"),
        CallOutcome::TimedOut => warn!(
            timeout = ?options.timeout,
            "blocking call timed out; abandoning its result"
        ),
    }
    status
}

/// Poll `status` until it is done, marking it failed if the timeout elapses.
///
/// Returns whether the status is successful once the wait ends.
pub async fn wait_for_status(status: &Status, options: WaitOptions) -> bool {
    poll_until_done(status, &options).await;
    status.succeeded()
}

/// Returns `true` if this wait timed out and performed the failure transition.
async fn poll_until_done(status: &Status, options: &WaitOptions) -> bool {
    let deadline = options.timeout.map(|t| Instant::now() + t);
    while !status.is_done() {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return status.mark_failure();
            }
        }
        if options.poll_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            sleep(options.poll_interval).await;
        }
    }
    false
}

/// Run `func` on a new named OS thread.
///
/// For callers that want a plain thread rather than the runtime's blocking pool.
pub fn run_in_thread<F>(name: &str, func: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(func)
}
