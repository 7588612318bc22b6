//! Completion signal for asynchronous operations.
//!
//! A [`Status`] answers two questions about one asynchronous operation: has it
//! finished, and did it succeed. It starts pending and is moved to a terminal
//! state exactly once; later attempts are ignored.
//!
//! Clones share the same state, so the writer (a device callback, a spawned task)
//! and any number of readers (poll loops) can each hold one.
//!
//! ```rust
//! use daq_tune::status::Status;
//!
//! let status = Status::new();
//! let writer = status.clone();
//! assert!(!status.is_done());
//!
//! assert!(writer.mark_failure());
//! assert!(!writer.mark_success()); // already terminal, ignored
//! assert!(status.is_done());
//! assert!(!status.succeeded());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const PENDING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;

/// Single-writer, multi-reader completion flag.
#[derive(Clone, Default)]
pub struct Status {
    state: Arc<AtomicU8>,
}

impl Status {
    /// Create a pending status.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the operation finished successfully.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn mark_success(&self) -> bool {
        self.finish(SUCCEEDED)
    }

    /// Mark the operation finished unsuccessfully.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn mark_failure(&self) -> bool {
        self.finish(FAILED)
    }

    fn finish(&self, terminal: u8) -> bool {
        self.state
            .compare_exchange(PENDING, terminal, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the operation has reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Whether the operation succeeded. Only meaningful once [`is_done`](Self::is_done).
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state.load(Ordering::Acquire) == SUCCEEDED
    }

    /// `None` while pending, otherwise the success flag.
    #[must_use]
    pub fn outcome(&self) -> Option<bool> {
        match self.state.load(Ordering::Acquire) {
            PENDING => None,
            s => Some(s == SUCCEEDED),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("done", &self.is_done())
            .field("success", &self.succeeded())
            .finish()
    }
}
