//! Toy module, loaders and optimizers shared by the end-to-end tests.

#![allow(dead_code)]

use kiln_core::{
    BatchControl, Callback, Capabilities, DataLoader, KilnError, LrScheduler, Optimizer, OptimizerConfig,
    Result, StepOutput, TrainModule, TrainerBinding, TrainerConfig, TrainerState, WeightsSummary,
};
use kiln_distributed::ClusterEnvironment;
use kiln_trainer::{DeviceInventory, InterruptHandle, Trainer, TrainerBuilder};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

/// Everything the toy module and its collaborators observed.
#[derive(Debug, Default)]
pub struct Tally {
    /// `(batch_idx, optimizer_idx)` of every training step.
    pub training_steps: Vec<(usize, Option<usize>)>,
    /// `(batch_idx, optimizer_idx)` of every optimizer step.
    pub optimizer_steps: Vec<(usize, usize)>,
    /// Number of validation steps.
    pub validation_steps: usize,
    /// Number of test steps.
    pub test_steps: usize,
    /// Callback hooks, in call order.
    pub hooks: Vec<String>,
    /// Learning rates set by schedulers.
    pub learning_rates: Vec<f64>,
    /// Calls to `zero_grad` on any counting optimizer.
    pub zero_grads: usize,
    /// Summary depths requested by the trainer.
    pub summaries: Vec<WeightsSummary>,
}

pub type SharedTally = Arc<Mutex<Tally>>;

/// Loader over `0..n` with an optional known length.
pub struct Numbers {
    n: usize,
    sized: bool,
}

impl Numbers {
    pub fn new(n: usize) -> Self {
        Self { n, sized: true }
    }

    pub fn r#unsized(n: usize) -> Self {
        Self { n, sized: false }
    }
}

impl DataLoader<f64> for Numbers {
    fn len(&self) -> Option<usize> {
        self.sized.then_some(self.n)
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<f64>> + '_> {
        Box::new((0..self.n).map(|i| Ok(i as f64)))
    }
}

/// Optimizer that counts its steps.
pub struct CountingOptimizer {
    pub lr: f64,
    pub steps: usize,
    tally: SharedTally,
}

impl CountingOptimizer {
    pub fn new(lr: f64, tally: &SharedTally) -> Self {
        Self {
            lr,
            steps: 0,
            tally: Arc::clone(tally),
        }
    }
}

impl Optimizer for CountingOptimizer {
    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.tally.lock().zero_grads += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
        self.tally.lock().learning_rates.push(lr);
    }

    fn state_dict(&self) -> Result<Value> {
        Ok(json!({ "lr": self.lr, "steps": self.steps }))
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<()> {
        self.lr = state["lr"].as_f64().unwrap_or(self.lr);
        self.steps = state["steps"].as_u64().unwrap_or(0) as usize;
        Ok(())
    }
}

/// Halves the learning rate on every step.
pub struct Halving {
    pub lr: f64,
    pub plateau: bool,
}

impl LrScheduler for Halving {
    fn step(&mut self, _metric: Option<f64>) -> Result<f64> {
        self.lr /= 2.0;
        Ok(self.lr)
    }

    fn is_plateau(&self) -> bool {
        self.plateau
    }

    fn state_dict(&self) -> Result<Value> {
        Ok(json!({ "lr": self.lr }))
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<()> {
        self.lr = state["lr"].as_f64().unwrap_or(self.lr);
        Ok(())
    }
}

/// How the toy module configures its optimizers.
pub enum OptimizerSetup {
    None,
    Single,
    /// Two optimizers taking turns for the given number of batches.
    Alternating(usize, usize),
    /// One optimizer with a halving scheduler.
    Scheduled(kiln_core::SchedulerInterval, bool),
}

/// A module whose weight is the number of optimizer steps it has seen.
pub struct ToyModule {
    pub caps: Capabilities,
    pub train_batches: usize,
    pub val_batches: usize,
    pub test_batches: usize,
    /// Validation loss reported at each epoch; the last value repeats.
    pub val_losses: Vec<f64>,
    pub optimizers: OptimizerSetup,
    pub weight: f64,
    pub epoch: usize,
    pub interrupt_at: Option<(usize, InterruptHandle)>,
    pub fail_at: Option<(usize, KilnError)>,
    pub stop_epoch_at: Option<usize>,
    pub tally: SharedTally,
}

impl ToyModule {
    pub fn new(train_batches: usize) -> Self {
        Self {
            caps: Capabilities::training(),
            train_batches,
            val_batches: 0,
            test_batches: 0,
            val_losses: vec![1.0],
            optimizers: OptimizerSetup::Single,
            weight: 0.0,
            epoch: 0,
            interrupt_at: None,
            fail_at: None,
            stop_epoch_at: None,
            tally: SharedTally::default(),
        }
    }

    pub fn with_validation(mut self, val_batches: usize, val_losses: Vec<f64>) -> Self {
        self.caps = self.caps.with_validation();
        self.val_batches = val_batches;
        self.val_losses = val_losses;
        self
    }

    pub fn with_test(mut self, test_batches: usize) -> Self {
        self.caps = self.caps.with_test();
        self.test_batches = test_batches;
        self
    }

    pub fn with_optimizers(mut self, setup: OptimizerSetup) -> Self {
        self.optimizers = setup;
        self
    }

    fn val_loss(&self) -> f64 {
        let idx = self.epoch.min(self.val_losses.len().saturating_sub(1));
        self.val_losses.get(idx).copied().unwrap_or(1.0)
    }
}

impl TrainModule for ToyModule {
    type Batch = f64;

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn training_step(&mut self, batch: &f64, batch_idx: usize, optimizer_idx: Option<usize>) -> Result<StepOutput> {
        if self.fail_at.as_ref().is_some_and(|(at, _)| *at == batch_idx) {
            if let Some((_, error)) = self.fail_at.take() {
                return Err(error);
            }
        }
        self.tally.lock().training_steps.push((batch_idx, optimizer_idx));
        Ok(StepOutput::with_loss(1.0 + batch).log("train_loss", 1.0 + batch))
    }

    fn validation_step(&mut self, _batch: &f64, _batch_idx: usize, _dataloader_idx: usize) -> Result<StepOutput> {
        self.tally.lock().validation_steps += 1;
        Ok(StepOutput::default().value("val_loss", self.val_loss()))
    }

    fn validation_epoch_end(&mut self, outputs: &[Vec<StepOutput>]) -> Result<Option<StepOutput>> {
        let losses: Vec<f64> = outputs
            .iter()
            .flatten()
            .filter_map(|o| o.values.get("val_loss").copied())
            .collect();
        let mean = losses.iter().sum::<f64>() / losses.len().max(1) as f64;
        Ok(Some(StepOutput::default().value("val_loss", mean).log("val_loss", mean)))
    }

    fn test_step(&mut self, batch: &f64, _batch_idx: usize, _dataloader_idx: usize) -> Result<StepOutput> {
        self.tally.lock().test_steps += 1;
        Ok(StepOutput::default().value("test_loss", *batch))
    }

    fn test_epoch_end(&mut self, outputs: &[Vec<StepOutput>]) -> Result<Option<StepOutput>> {
        let n = outputs.iter().map(Vec::len).sum::<usize>();
        Ok(Some(StepOutput::default().value("test_batches", n as f64)))
    }

    fn configure_optimizers(&mut self) -> Result<OptimizerConfig> {
        let tally = &self.tally;
        Ok(match &self.optimizers {
            OptimizerSetup::None => OptimizerConfig::None,
            OptimizerSetup::Single => OptimizerConfig::Single(Box::new(CountingOptimizer::new(0.1, tally))),
            OptimizerSetup::Alternating(a, b) => OptimizerConfig::Entries(vec![
                kiln_core::OptimizerEntry::new(Box::new(CountingOptimizer::new(0.1, tally))).with_frequency(*a),
                kiln_core::OptimizerEntry::new(Box::new(CountingOptimizer::new(0.2, tally))).with_frequency(*b),
            ]),
            OptimizerSetup::Scheduled(interval, plateau) => OptimizerConfig::WithSchedulers(
                vec![Box::new(CountingOptimizer::new(0.8, tally))],
                vec![kiln_core::SchedulerSpec::new(Box::new(Halving {
                    lr: 0.8,
                    plateau: *plateau,
                }))
                .interval(*interval)],
            ),
        })
    }

    fn train_dataloader(&mut self) -> Result<Box<dyn DataLoader<f64>>> {
        Ok(Box::new(Numbers::new(self.train_batches)))
    }

    fn val_dataloaders(&mut self) -> Result<Vec<Box<dyn DataLoader<f64>>>> {
        Ok(vec![Box::new(Numbers::new(self.val_batches))])
    }

    fn test_dataloaders(&mut self) -> Result<Vec<Box<dyn DataLoader<f64>>>> {
        Ok(vec![Box::new(Numbers::new(self.test_batches))])
    }

    fn optimizer_step(
        &mut self,
        _epoch: usize,
        batch_idx: usize,
        optimizer: &mut dyn Optimizer,
        optimizer_idx: usize,
    ) -> Result<()> {
        self.tally.lock().optimizer_steps.push((batch_idx, optimizer_idx));
        self.weight += 1.0;
        optimizer.step()?;
        optimizer.zero_grad()
    }

    fn summarize(&self, mode: WeightsSummary) -> Vec<String> {
        self.tally.lock().summaries.push(mode);
        vec![format!("weight: {}", self.weight)]
    }

    fn on_bind(&mut self, binding: &TrainerBinding) {
        self.epoch = binding.current_epoch;
    }

    fn on_batch_start(&mut self, batch: &f64) -> Result<BatchControl> {
        let idx = *batch as usize;
        if let Some((at, handle)) = &self.interrupt_at {
            if *at == idx {
                handle.interrupt();
            }
        }
        if self.stop_epoch_at == Some(idx) {
            return Ok(BatchControl::StopEpoch);
        }
        Ok(BatchControl::Continue)
    }

    fn state_dict(&self) -> Result<Value> {
        Ok(json!({ "weight": self.weight }))
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<()> {
        self.weight = state["weight"].as_f64().unwrap_or(0.0);
        Ok(())
    }
}

/// Records every hook name into the tally.
pub struct HookRecorder(pub SharedTally);

impl HookRecorder {
    fn push(&self, hook: &str) {
        self.0.lock().hooks.push(hook.to_string());
    }
}

impl Callback for HookRecorder {
    fn on_init_start(&mut self) {
        self.push("init_start");
    }

    fn on_init_end(&mut self, _state: &TrainerState) {
        self.push("init_end");
    }

    fn on_train_start(&mut self, _state: &TrainerState) {
        self.push("train_start");
    }

    fn on_train_end(&mut self, _state: &TrainerState) {
        self.push("train_end");
    }

    fn on_epoch_start(&mut self, _state: &TrainerState) {
        self.push("epoch_start");
    }

    fn on_epoch_end(&mut self, _state: &TrainerState) {
        self.push("epoch_end");
    }

    fn on_batch_start(&mut self, _state: &TrainerState) {
        self.push("batch_start");
    }

    fn on_batch_end(&mut self, _state: &TrainerState) {
        self.push("batch_end");
    }

    fn on_validation_start(&mut self, _state: &TrainerState) {
        self.push("validation_start");
    }

    fn on_validation_end(&mut self, _state: &TrainerState) {
        self.push("validation_end");
    }

    fn on_test_start(&mut self, _state: &TrainerState) {
        self.push("test_start");
    }

    fn on_test_end(&mut self, _state: &TrainerState) {
        self.push("test_end");
    }

    fn on_save(&mut self, _path: &Path) {
        self.push("save");
    }
}

/// Single-epoch configuration that writes nothing unless asked to.
pub fn quiet_config(dir: &Path) -> TrainerConfig {
    TrainerConfig {
        max_epochs: Some(1),
        default_save_path: Some(dir.to_path_buf()),
        logger: false,
        checkpoint_callback: false,
        early_stop_callback: Some(false),
        progress_bar_refresh_rate: 0,
        num_sanity_val_steps: 0,
        ..Default::default()
    }
}

/// Builder isolated from the process environment, devices and signals.
pub fn isolated() -> TrainerBuilder {
    Trainer::builder()
        .environment(ClusterEnvironment::from_vars(Vec::<(String, String)>::new()))
        .devices(DeviceInventory::cpu_only())
        .interrupt_handle(InterruptHandle::new())
}

pub fn trainer(config: TrainerConfig) -> Trainer {
    isolated().config(config).build().unwrap()
}
