//! Common type definitions for kiln.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scalar metrics keyed by name.
pub type Metrics = BTreeMap<String, f64>;

/// Floating point precision used for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Precision {
    /// 16-bit mixed precision.
    Half,
    /// 32-bit full precision.
    #[default]
    Full,
}

impl Precision {
    /// Number of bits.
    pub fn bits(&self) -> u32 {
        match self {
            Self::Half => 16,
            Self::Full => 32,
        }
    }
}

impl TryFrom<u32> for Precision {
    type Error = KilnError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            16 => Ok(Self::Half),
            32 => Ok(Self::Full),
            other => Err(KilnError::misconfigured(
                "precision",
                format!("must be 16 or 32, got {other}"),
            )),
        }
    }
}

/// Output of a training, validation or test step, or of an epoch-end hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Loss to backpropagate. Required for training steps.
    pub loss: Option<f64>,
    /// Metrics sent to loggers.
    #[serde(default)]
    pub log: Metrics,
    /// Metrics shown in progress reporting.
    #[serde(default)]
    pub progress_bar: Metrics,
    /// Any other scalars, visible to callbacks and policies.
    #[serde(default)]
    pub values: Metrics,
}

impl StepOutput {
    /// Output with only a loss.
    pub fn with_loss(loss: f64) -> Self {
        Self {
            loss: Some(loss),
            ..Default::default()
        }
    }

    /// Add a logged metric.
    pub fn log(mut self, name: impl Into<String>, value: f64) -> Self {
        self.log.insert(name.into(), value);
        self
    }

    /// Add a progress metric.
    pub fn progress(mut self, name: impl Into<String>, value: f64) -> Self {
        self.progress_bar.insert(name.into(), value);
        self
    }

    /// Add a callback-visible value.
    pub fn value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Everything policies may monitor: the loss, plain values, and logged
    /// and progress metrics, later sources overriding earlier ones.
    pub fn callback_metrics(&self) -> Metrics {
        let mut metrics = Metrics::new();
        if let Some(loss) = self.loss {
            metrics.insert("loss".to_string(), loss);
        }
        metrics.extend(self.values.iter().map(|(k, v)| (k.clone(), *v)));
        metrics.extend(self.progress_bar.iter().map(|(k, v)| (k.clone(), *v)));
        metrics.extend(self.log.iter().map(|(k, v)| (k.clone(), *v)));
        metrics
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Completed normally.
    Success,
    /// Stopped by user cancellation or preemption.
    Interrupted,
    /// Stopped by an error.
    Failed,
}

impl RunStatus {
    /// Status string passed to loggers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device a process computes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA-style accelerator index.
    Gpu(usize),
    /// TPU core index.
    Tpu(usize),
}

/// Where and how a module should place itself for this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DevicePlacement {
    /// Root device of this process.
    pub device: DeviceKind,
    /// All devices the module is replicated over in this process
    /// (more than one under data-parallel modes).
    pub device_ids: Vec<usize>,
    /// Precision to run in.
    pub precision: Precision,
    /// Whether mixed precision is active.
    pub use_amp: bool,
    /// Rank of this process.
    pub rank: usize,
    /// Total processes.
    pub world_size: usize,
}

/// Trainer-derived properties bound onto the module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainerBinding {
    /// Current epoch (0-based).
    pub current_epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: usize,
    /// Whether the module runs on a GPU.
    pub on_gpu: bool,
    /// Whether the module runs on a TPU.
    pub on_tpu: bool,
    /// Data-parallel mode.
    pub use_dp: bool,
    /// Distributed data-parallel mode.
    pub use_ddp: bool,
    /// DDP2 mode.
    pub use_ddp2: bool,
    /// Single accelerator.
    pub single_gpu: bool,
    /// Mixed precision.
    pub use_amp: bool,
    /// Precision in bits.
    pub precision: u32,
    /// Whether the run is a test run.
    pub testing: bool,
    /// Rank of this process.
    pub proc_rank: usize,
    /// Total processes.
    pub world_size: usize,
}

/// What the loop should do after `on_batch_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchControl {
    /// Run the batch.
    #[default]
    Continue,
    /// Skip this batch and end the current epoch.
    StopEpoch,
}

/// Capabilities a module declares.
///
/// The trainer validates the declared set against the training contract
/// before any work is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Implements `training_step`.
    pub training_step: bool,
    /// Implements `train_dataloader`.
    pub train_dataloader: bool,
    /// Implements `configure_optimizers`.
    pub configure_optimizers: bool,
    /// Implements `training_epoch_end`.
    pub training_epoch_end: bool,
    /// Implements `validation_step`.
    pub validation_step: bool,
    /// Implements `val_dataloader`.
    pub val_dataloader: bool,
    /// Implements `validation_epoch_end`.
    pub validation_epoch_end: bool,
    /// Implements `test_step`.
    pub test_step: bool,
    /// Implements `test_dataloader`.
    pub test_dataloader: bool,
    /// Implements `test_epoch_end`.
    pub test_epoch_end: bool,
}

impl Capabilities {
    /// The minimum set every trainable module provides.
    pub fn training() -> Self {
        Self {
            training_step: true,
            train_dataloader: true,
            configure_optimizers: true,
            ..Default::default()
        }
    }

    /// Add validation step, loader and epoch end.
    pub fn with_validation(mut self) -> Self {
        self.validation_step = true;
        self.val_dataloader = true;
        self.validation_epoch_end = true;
        self
    }

    /// Names of the declared capabilities, in contract order.
    pub fn declared(&self) -> Vec<&'static str> {
        [
            ("training_step", self.training_step),
            ("train_dataloader", self.train_dataloader),
            ("configure_optimizers", self.configure_optimizers),
            ("training_epoch_end", self.training_epoch_end),
            ("validation_step", self.validation_step),
            ("val_dataloader", self.val_dataloader),
            ("validation_epoch_end", self.validation_epoch_end),
            ("test_step", self.test_step),
            ("test_dataloader", self.test_dataloader),
            ("test_epoch_end", self.test_epoch_end),
        ]
        .into_iter()
        .filter_map(|(name, declared)| declared.then_some(name))
        .collect()
    }

    /// Add test step, loader and epoch end.
    pub fn with_test(mut self) -> Self {
        self.test_step = true;
        self.test_dataloader = true;
        self.test_epoch_end = true;
        self
    }
}

/// Running mean over the last `window` values.
#[derive(Debug, Clone)]
pub struct RunningMean {
    window: usize,
    values: std::collections::VecDeque<f64>,
}

impl RunningMean {
    /// Create with the given window length.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            values: std::collections::VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Push a value, evicting the oldest if the window is full.
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Current mean, if any value was pushed.
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
        }
    }

    /// Most recent value.
    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Drop all values.
    pub fn reset(&mut self) {
        self.values.clear();
    }
}
