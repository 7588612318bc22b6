//! Hardware-run scan orchestration.

pub mod monitor;

pub use monitor::{ScanMonitor, ScanMonitorConfig, ScanOutcome, ScanPhase};
