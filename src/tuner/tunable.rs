//! Axes that carry their own tuner.
//!
//! A [`TunableAxis`] bundles an axis with an optional [`TuneAxis`] and hooks run
//! before and after tuning. The default hooks log the axis position.
//! [`tune_axes`] tunes several of them in order.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{MultiPassOptions, TuneAxis, TuneResult};
use crate::documents::RecordSink;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{DeviceRef, Movable};

/// Action run around a tune.
#[async_trait]
pub trait TuneHook: Send + Sync {
    /// Run the hook for `axis`
    async fn run(&self, axis: &DeviceRef<dyn Movable>) -> anyhow::Result<()>;
}

/// Logs the axis name and position.
#[derive(Debug, Clone)]
pub struct LogPositionHook {
    label: &'static str,
}

impl LogPositionHook {
    /// Hook logging under `label` (e.g. "pre-tune")
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

#[async_trait]
impl TuneHook for LogPositionHook {
    async fn run(&self, axis: &DeviceRef<dyn Movable>) -> anyhow::Result<()> {
        let position = axis.device.position().await?;
        info!(axis = %axis.name, position, "{}", self.label);
        Ok(())
    }
}

/// Results of tuning one axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisTuneReport {
    /// Axis name
    pub axis: String,
    /// Every pass of the multi-pass run
    pub passes: Vec<TuneResult>,
}

impl AxisTuneReport {
    /// Whether the last pass found a peak
    pub fn tune_ok(&self) -> bool {
        self.passes.last().is_some_and(|r| r.tune_ok)
    }
}

/// An axis with an attached tuner.
pub struct TunableAxis {
    axis: DeviceRef<dyn Movable>,
    tuner: Option<TuneAxis>,
    options: MultiPassOptions,
    pre_tune: Option<Arc<dyn TuneHook>>,
    post_tune: Option<Arc<dyn TuneHook>>,
}

impl TunableAxis {
    /// Axis without a tuner, with the logging hooks installed
    pub fn new(axis: DeviceRef<dyn Movable>) -> Self {
        Self {
            axis,
            tuner: None,
            options: MultiPassOptions::default(),
            pre_tune: Some(Arc::new(LogPositionHook::new("pre-tune"))),
            post_tune: Some(Arc::new(LogPositionHook::new("post-tune"))),
        }
    }

    /// Attach a tuner
    pub fn with_tuner(mut self, tuner: TuneAxis) -> Self {
        self.tuner = Some(tuner);
        self
    }

    /// Multi-pass options used by [`tune`](Self::tune)
    pub fn with_options(mut self, options: MultiPassOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace (or with `None`, remove) the pre-tune hook
    pub fn with_pre_tune(mut self, hook: Option<Arc<dyn TuneHook>>) -> Self {
        self.pre_tune = hook;
        self
    }

    /// Replace (or with `None`, remove) the post-tune hook
    pub fn with_post_tune(mut self, hook: Option<Arc<dyn TuneHook>>) -> Self {
        self.post_tune = hook;
        self
    }

    /// Axis name
    pub fn name(&self) -> &str {
        &self.axis.name
    }

    /// Attached tuner, if any
    pub fn tuner(&self) -> Option<&TuneAxis> {
        self.tuner.as_ref()
    }

    /// Run the pre-tune hook, a multi-pass tune, then the post-tune hook.
    ///
    /// An axis without a tuner is a configuration error.
    pub async fn tune(&mut self, sink: &dyn RecordSink) -> AppResult<AxisTuneReport> {
        let tuner = self.tuner.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!("axis '{}' has no tuner", self.axis.name))
        })?;
        if let Some(hook) = &self.pre_tune {
            hook.run(&self.axis)
                .await
                .map_err(|e| DaqError::hardware(&self.axis.name, e))?;
        }
        let passes = tuner.multi_pass_tune(sink, &self.options).await?;
        if let Some(hook) = &self.post_tune {
            hook.run(&self.axis)
                .await
                .map_err(|e| DaqError::hardware(&self.axis.name, e))?;
        }
        Ok(AxisTuneReport {
            axis: self.axis.name.clone(),
            passes,
        })
    }
}

/// Tune each axis in turn. The first error stops the sequence.
pub async fn tune_axes(
    axes: &mut [TunableAxis],
    sink: &dyn RecordSink,
) -> AppResult<Vec<AxisTuneReport>> {
    let mut reports = Vec::with_capacity(axes.len());
    for axis in axes.iter_mut() {
        reports.push(axis.tune(sink).await?);
    }
    Ok(reports)
}
