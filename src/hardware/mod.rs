//! Hardware Abstractions
//!
//! Capability traits consumed by the orchestration core, plus simulated devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    DeviceRef, Detector, Movable, PvValue, Readable, ScanRecord, SubscriptionHandle, Triggerable,
    ValueCallback,
};
