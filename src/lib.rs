//! # DAQ Tune Core Library
//!
//! Asynchronous scan-and-tune orchestration for instruments built from
//! independently moving axes and independently triggered detectors.
//!
//! ## Crate Structure
//!
//! - **`status`**: `Status`, the single-writer completion signal shared between a
//!   device callback and a poll loop.
//! - **`blocking`**: runs blocking functions or device futures off the orchestrating
//!   task and awaits them with a poll interval and an optional timeout.
//! - **`hardware`**: capability traits (`Movable`, `Triggerable`, `Readable`,
//!   `ScanRecord`) and mock devices for testing without hardware.
//! - **`documents`**: the `RecordSink` data boundary and an in-memory document recorder.
//! - **`scan`**: `ScanMonitor`, the watch-and-poll driver for hardware-run scans.
//! - **`peak_stats`**: peak estimators (center of mass, half-max center, FWHM).
//! - **`tuner`**: single-pass and multi-pass axis tuning, tunable axes.
//! - **`config`** / **`logging`**: figment configuration and tracing setup.
//! - **`error`**: the `DaqError` enum.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use daq_tune::documents::DocumentRecorder;
//! use daq_tune::hardware::mock::{MockPeakDetector, MockStage};
//! use daq_tune::hardware::{DeviceRef, Detector, Movable};
//! use daq_tune::tuner::{MultiPassOptions, TuneAxis};
//!
//! # async fn example() -> daq_tune::error::AppResult<()> {
//! let stage = Arc::new(MockStage::new());
//! let det = Arc::new(MockPeakDetector::gaussian(stage.clone(), 0.1, 0.05, 1e4));
//! let mut tuner = TuneAxis::new(
//!     DeviceRef::new("m1", stage as Arc<dyn Movable>),
//!     vec![DeviceRef::new("I0", det as Arc<dyn Detector>)],
//! );
//! let recorder = DocumentRecorder::default();
//! let passes = tuner.multi_pass_tune(&recorder, &MultiPassOptions::default()).await?;
//! println!("final position: {:?}", passes.last().map(|p| p.final_position));
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod config;
pub mod documents;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod peak_stats;
pub mod scan;
pub mod status;
pub mod tuner;

pub use error::{AppResult, DaqError};
pub use status::Status;
