//! Core trait definitions.
//!
//! These are the seams between the trainer and everything it orchestrates
//! but does not implement: the user's module, its data, the optimizers from
//! the tensor library, callbacks and experiment loggers.

use crate::config::WeightsSummary;
use crate::error::{KilnError, Result};
use crate::state::TrainerState;
use crate::types::{
    BatchControl, Capabilities, DevicePlacement, Metrics, RunStatus, StepOutput, TrainerBinding,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// A re-iterable source of batches.
///
/// Loaders handed to the trainer must be `Send + 'static`: spawned and
/// threaded launchers move them across thread boundaries, and loaders must
/// not hold state that cannot be rebuilt in another process.
pub trait DataLoader<B>: Send {
    /// Number of batches per pass, `None` if unknown.
    fn len(&self) -> Option<usize>;

    /// Start a new pass over the data.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<B>> + '_>;

    /// Enable or disable shuffling for subsequent passes.
    fn set_shuffle(&mut self, _shuffle: bool) {}

    /// Whether passes are shuffled.
    fn shuffle(&self) -> bool {
        false
    }
}

/// Optimizer interface consumed from the tensor library.
pub trait Optimizer: Send {
    /// Apply accumulated gradients.
    fn step(&mut self) -> Result<()>;

    /// Clear gradients.
    fn zero_grad(&mut self) -> Result<()>;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Set the learning rate.
    fn set_learning_rate(&mut self, lr: f64);

    /// Serializable internal state.
    fn state_dict(&self) -> Result<Value>;

    /// Restore internal state.
    fn load_state_dict(&mut self, state: &Value) -> Result<()>;
}

/// Learning rate scheduler interface.
pub trait LrScheduler: Send {
    /// Advance the schedule and return the learning rate to apply.
    ///
    /// `metric` carries the monitored value for plateau schedulers.
    fn step(&mut self, metric: Option<f64>) -> Result<f64>;

    /// Whether this scheduler reacts to a monitored metric.
    fn is_plateau(&self) -> bool {
        false
    }

    /// Serializable internal state.
    fn state_dict(&self) -> Result<Value>;

    /// Restore internal state.
    fn load_state_dict(&mut self, state: &Value) -> Result<()>;
}

/// When a scheduler is stepped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerInterval {
    /// After every training batch.
    Step,
    /// After every epoch.
    #[default]
    Epoch,
}

/// A scheduler with optional stepping configuration.
pub struct SchedulerSpec {
    /// The scheduler.
    pub scheduler: Box<dyn LrScheduler>,
    /// Stepping interval.
    pub interval: Option<SchedulerInterval>,
    /// Step every N intervals.
    pub frequency: Option<usize>,
    /// Metric for plateau schedulers.
    pub monitor: Option<String>,
}

impl SchedulerSpec {
    /// Scheduler with default configuration.
    pub fn new(scheduler: Box<dyn LrScheduler>) -> Self {
        Self {
            scheduler,
            interval: None,
            frequency: None,
            monitor: None,
        }
    }

    /// Set the interval.
    pub fn interval(mut self, interval: SchedulerInterval) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set the frequency.
    pub fn frequency(mut self, frequency: usize) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Set the monitored metric.
    pub fn monitor(mut self, monitor: impl Into<String>) -> Self {
        self.monitor = Some(monitor.into());
        self
    }
}

/// An optimizer with its optional scheduler and update frequency.
pub struct OptimizerEntry {
    /// The optimizer.
    pub optimizer: Box<dyn Optimizer>,
    /// Its scheduler.
    pub lr_scheduler: Option<SchedulerSpec>,
    /// Consecutive batches this optimizer is used for.
    pub frequency: Option<usize>,
}

impl OptimizerEntry {
    /// Entry with only an optimizer.
    pub fn new(optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            optimizer,
            lr_scheduler: None,
            frequency: None,
        }
    }

    /// Attach a scheduler.
    pub fn with_scheduler(mut self, scheduler: SchedulerSpec) -> Self {
        self.lr_scheduler = Some(scheduler);
        self
    }

    /// Set the frequency.
    pub fn with_frequency(mut self, frequency: usize) -> Self {
        self.frequency = Some(frequency);
        self
    }
}

/// Every shape `configure_optimizers` may return.
pub enum OptimizerConfig {
    /// No optimizer; the run uses a no-op optimizer.
    None,
    /// One optimizer.
    Single(Box<dyn Optimizer>),
    /// Several optimizers, used in order.
    Many(Vec<Box<dyn Optimizer>>),
    /// Optimizers and schedulers, scheduler `i` driving optimizer `i`.
    WithSchedulers(Vec<Box<dyn Optimizer>>, Vec<SchedulerSpec>),
    /// One optimizer entry.
    Entry(OptimizerEntry),
    /// Several optimizer entries.
    Entries(Vec<OptimizerEntry>),
}

/// The user's computation unit.
///
/// Only the methods named in [`Capabilities`] are optional; the trainer
/// checks the declared set before a run and never calls an undeclared
/// optional method.
pub trait TrainModule: Send {
    /// Batch type produced by this module's loaders.
    type Batch: Send + 'static;

    /// Declared capability set.
    fn capabilities(&self) -> Capabilities;

    /// Compute the training loss for one batch.
    fn training_step(
        &mut self,
        batch: &Self::Batch,
        batch_idx: usize,
        optimizer_idx: Option<usize>,
    ) -> Result<StepOutput>;

    /// Aggregate training step outputs at the end of an epoch.
    fn training_epoch_end(&mut self, _outputs: &[StepOutput]) -> Result<Option<StepOutput>> {
        Ok(None)
    }

    /// Evaluate one validation batch.
    fn validation_step(
        &mut self,
        _batch: &Self::Batch,
        _batch_idx: usize,
        _dataloader_idx: usize,
    ) -> Result<StepOutput> {
        Err(not_implemented("validation_step"))
    }

    /// Aggregate validation outputs, one vector per loader.
    fn validation_epoch_end(&mut self, _outputs: &[Vec<StepOutput>]) -> Result<Option<StepOutput>> {
        Ok(None)
    }

    /// Evaluate one test batch.
    fn test_step(
        &mut self,
        _batch: &Self::Batch,
        _batch_idx: usize,
        _dataloader_idx: usize,
    ) -> Result<StepOutput> {
        Err(not_implemented("test_step"))
    }

    /// Aggregate test outputs, one vector per loader.
    fn test_epoch_end(&mut self, _outputs: &[Vec<StepOutput>]) -> Result<Option<StepOutput>> {
        Ok(None)
    }

    /// Optimizers and schedulers for this run.
    fn configure_optimizers(&mut self) -> Result<OptimizerConfig> {
        Err(not_implemented("configure_optimizers"))
    }

    /// Training data.
    fn train_dataloader(&mut self) -> Result<Box<dyn DataLoader<Self::Batch>>> {
        Err(not_implemented("train_dataloader"))
    }

    /// Validation data, one loader per validation set.
    fn val_dataloaders(&mut self) -> Result<Vec<Box<dyn DataLoader<Self::Batch>>>> {
        Err(not_implemented("val_dataloader"))
    }

    /// Test data, one loader per test set.
    fn test_dataloaders(&mut self) -> Result<Vec<Box<dyn DataLoader<Self::Batch>>>> {
        Err(not_implemented("test_dataloader"))
    }

    /// Download or prepare data. Runs once in the launching process.
    fn prepare_data(&mut self) -> Result<()> {
        Ok(())
    }

    /// Backpropagate an (already accumulation-scaled) loss.
    fn backward(&mut self, _loss: f64, _optimizer_idx: usize) -> Result<()> {
        Ok(())
    }

    /// Called after every backward pass.
    fn on_after_backward(&mut self) -> Result<()> {
        Ok(())
    }

    /// Total gradient norm, if the module tracks gradients.
    fn gradient_norm(&self) -> Option<f64> {
        None
    }

    /// Multiply every gradient by `factor`.
    fn scale_gradients(&mut self, _factor: f64) -> Result<()> {
        Ok(())
    }

    /// Lines describing the module, logged by rank zero before training.
    ///
    /// The default lists the declared capabilities. Modules with parameters
    /// should list layer names and sizes, one line per entry for
    /// [`WeightsSummary::Full`].
    fn summarize(&self, mode: WeightsSummary) -> Vec<String> {
        let declared = self.capabilities().declared();
        match mode {
            WeightsSummary::Top => vec![format!("{} capabilities: {}", declared.len(), declared.join(", "))],
            WeightsSummary::Full => declared.into_iter().map(str::to_string).collect(),
        }
    }

    /// Per-parameter gradient norms of the given order, for logging.
    fn grad_norms(&self, _norm_type: f64) -> Metrics {
        Metrics::new()
    }

    /// Apply one optimizer step.
    fn optimizer_step(
        &mut self,
        _epoch: usize,
        _batch_idx: usize,
        optimizer: &mut dyn Optimizer,
        _optimizer_idx: usize,
    ) -> Result<()> {
        optimizer.step()?;
        self.on_before_zero_grad(optimizer)?;
        optimizer.zero_grad()
    }

    /// Called between the optimizer step and zeroing gradients.
    fn on_before_zero_grad(&mut self, _optimizer: &mut dyn Optimizer) -> Result<()> {
        Ok(())
    }

    /// Switch between training and evaluation mode.
    fn set_training(&mut self, _training: bool) {}

    /// Move to, or replicate over, the devices of this process.
    fn configure_device(&mut self, _placement: &DevicePlacement) -> Result<()> {
        Ok(())
    }

    /// Receive trainer-derived properties.
    fn on_bind(&mut self, _binding: &TrainerBinding) {}

    /// Hyperparameters to log and checkpoint.
    fn hparams(&self) -> Option<Value> {
        None
    }

    /// Serializable weights.
    fn state_dict(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    /// Restore weights.
    fn load_state_dict(&mut self, _state: &Value) -> Result<()> {
        Ok(())
    }

    /// Add custom fields to a checkpoint being written.
    fn on_save_checkpoint(&self, _extra: &mut Map<String, Value>) {}

    /// Read custom fields from a checkpoint being restored.
    fn on_load_checkpoint(&mut self, _extra: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    /// Called once when training starts.
    fn on_train_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when training ends, including interrupted runs.
    fn on_train_end(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called at the start of every epoch.
    fn on_epoch_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called at the end of every epoch.
    fn on_epoch_end(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called before every training batch.
    fn on_batch_start(&mut self, _batch: &Self::Batch) -> Result<BatchControl> {
        Ok(BatchControl::Continue)
    }

    /// Called after every training batch.
    fn on_batch_end(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called before a validation pass.
    fn on_validation_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after a validation pass.
    fn on_validation_end(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called before a test pass.
    fn on_test_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after a test pass.
    fn on_test_end(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called before the sanity validation pass.
    fn on_sanity_check_start(&mut self) -> Result<()> {
        Ok(())
    }
}

fn not_implemented(method: &str) -> KilnError {
    KilnError::NotImplemented(format!("module does not implement `{method}`"))
}

/// Lifecycle callbacks.
///
/// Every registered callback sees every hook, in registration order.
pub trait Callback: Send {
    /// Before any trainer state is built.
    fn on_init_start(&mut self) {}

    /// After trainer state is fully built.
    fn on_init_end(&mut self, _state: &TrainerState) {}

    /// Training begins.
    fn on_train_start(&mut self, _state: &TrainerState) {}

    /// Training ends, including interrupted runs.
    fn on_train_end(&mut self, _state: &TrainerState) {}

    /// Epoch begins.
    fn on_epoch_start(&mut self, _state: &TrainerState) {}

    /// Epoch ends.
    fn on_epoch_end(&mut self, _state: &TrainerState) {}

    /// Training batch begins.
    fn on_batch_start(&mut self, _state: &TrainerState) {}

    /// Training batch ends.
    fn on_batch_end(&mut self, _state: &TrainerState) {}

    /// Validation pass begins.
    fn on_validation_start(&mut self, _state: &TrainerState) {}

    /// Validation pass ends.
    fn on_validation_end(&mut self, _state: &TrainerState) {}

    /// Test pass begins.
    fn on_test_start(&mut self, _state: &TrainerState) {}

    /// Test pass ends.
    fn on_test_end(&mut self, _state: &TrainerState) {}

    /// A checkpoint was written.
    fn on_save(&mut self, _path: &Path) {}
}

/// Experiment logger.
pub trait Logger: Send {
    /// Record hyperparameters.
    fn log_hyperparams(&mut self, params: &Value) -> Result<()>;

    /// Record metrics at a step.
    fn log_metrics(&mut self, metrics: &Metrics, step: usize) -> Result<()>;

    /// Persist anything buffered.
    fn save(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finish the experiment.
    fn finalize(&mut self, _status: RunStatus) -> Result<()> {
        self.save()
    }

    /// Experiment name.
    fn name(&self) -> String;

    /// Experiment version.
    fn version(&self) -> String;

    /// Directory the logger writes under, if any.
    fn save_dir(&self) -> Option<PathBuf> {
        None
    }
}
