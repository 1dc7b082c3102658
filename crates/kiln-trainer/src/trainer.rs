//! The trainer and its builder.
//!
//! A [`Trainer`] owns the resolved configuration, every policy engine and
//! the [`TrainerState`] of its process. The run itself is split across
//! modules:
//!
//! - `launcher` picks the process topology and runs the worker body
//! - `training_loop` drives epochs and batches
//! - `evaluation` runs validation, testing and the sanity pass
//!
//! # Example
//!
//! ```ignore
//! let mut trainer = Trainer::builder()
//!     .config(TrainerConfig { max_epochs: Some(3), ..Default::default() })
//!     .callback(MyCallback::default())
//!     .build()?;
//! let status = trainer.fit(&mut model)?;
//! ```

use crate::accumulation::{AccumulationPolicy, ClippingPolicy};
use crate::callbacks::{CallbackRegistry, ProgressCallback};
use crate::checkpoint::{Checkpoint, CheckpointIo};
use crate::data_loading::{DataLoaders, DataLoadingPolicy, LoaderSet};
use crate::early_stopping::EarlyStopping;
use crate::loggers::{JsonlLogger, LoggerCollection, DEFAULT_EXPERIMENT_NAME};
use crate::logging::{LoggerConnector, LoggingCadence};
use crate::model_checkpoint::ModelCheckpoint;
use crate::optimizers::OptimizerBundle;
use crate::signals::InterruptHandle;
use crate::strategy::{DeviceInventory, ExecutionStrategy};
use kiln_core::{
    Callback, Capabilities, CompatibilityWarning, KilnError, Logger, Metrics, ResolvedConfig, Result,
    RunStatus, Stage, TrainModule, TrainerConfig, TrainerState, WarningCache,
};
use kiln_distributed::{ClusterEnvironment, ProcessGroup};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Tag of the rendezvous TPU workers meet at before training.
pub const PRETRAIN_RENDEZVOUS: &str = "kiln.Trainer.run_pretrain_routine";

const MINIMUM_CONTRACT: &str = "kiln `Trainer` expects as minimum a `training_step()`, \
                                `train_dataloader()` and `configure_optimizers()` to be defined.";

/// Orchestrates training, validation and testing of a [`TrainModule`].
pub struct Trainer {
    pub(crate) config: TrainerConfig,
    pub(crate) state: TrainerState,
    pub(crate) warnings: WarningCache,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) logger: LoggerConnector,
    pub(crate) checkpoint_io: CheckpointIo,
    pub(crate) checkpoint_callback: Option<ModelCheckpoint>,
    pub(crate) early_stopping: Option<EarlyStopping>,
    pub(crate) accumulation: AccumulationPolicy,
    pub(crate) clipping: ClippingPolicy,
    pub(crate) data_policy: DataLoadingPolicy,
    pub(crate) cadence: LoggingCadence,
    pub(crate) strategy: ExecutionStrategy,
    pub(crate) env: ClusterEnvironment,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) group: Option<ProcessGroup>,
    pub(crate) local_rank: usize,
    pub(crate) optimizers: OptimizerBundle,
    pub(crate) batch_loss_value: f64,
    pub(crate) launches: usize,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("stage", &self.state.stage)
            .field("strategy", &self.strategy)
            .field("current_epoch", &self.state.current_epoch)
            .field("global_step", &self.state.global_step)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Builder for [`Trainer`].
#[derive(Default)]
pub struct TrainerBuilder {
    config: TrainerConfig,
    compat: Vec<CompatibilityWarning>,
    callbacks: Vec<Box<dyn Callback>>,
    loggers: Vec<Box<dyn Logger>>,
    checkpoint_callback: Option<ModelCheckpoint>,
    early_stopping: Option<EarlyStopping>,
    inventory: Option<DeviceInventory>,
    environment: Option<ClusterEnvironment>,
    interrupt: Option<InterruptHandle>,
    warnings: Option<WarningCache>,
}

impl TrainerBuilder {
    /// Use `config` as is.
    pub fn config(mut self, config: TrainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a resolved configuration; its compatibility warnings are emitted
    /// when the trainer is built.
    pub fn resolved(mut self, resolved: ResolvedConfig) -> Self {
        self.config = resolved.config;
        self.compat = resolved.warnings;
        self
    }

    /// Register a callback. Hooks run in registration order.
    pub fn callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Add an experiment logger, replacing the default one.
    pub fn logger(mut self, logger: impl Logger + 'static) -> Self {
        self.loggers.push(Box::new(logger));
        self
    }

    /// Replace the default checkpoint policy.
    pub fn checkpoint_callback(mut self, policy: ModelCheckpoint) -> Self {
        self.checkpoint_callback = Some(policy);
        self
    }

    /// Replace the default early stopping policy.
    pub fn early_stopping(mut self, policy: EarlyStopping) -> Self {
        self.early_stopping = Some(policy);
        self
    }

    /// Devices available to the run instead of the detected ones.
    pub fn devices(mut self, inventory: DeviceInventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Environment to read instead of the process environment.
    pub fn environment(mut self, env: ClusterEnvironment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Interrupt flags to poll instead of the process-wide signal handle.
    pub fn interrupt_handle(mut self, handle: InterruptHandle) -> Self {
        self.interrupt = Some(handle);
        self
    }

    /// Share a warning cache with the caller.
    pub fn warnings(mut self, warnings: WarningCache) -> Self {
        self.warnings = Some(warnings);
        self
    }

    /// Validate the configuration and build the trainer.
    pub fn build(self) -> Result<Trainer> {
        let TrainerBuilder {
            mut config,
            compat,
            callbacks,
            loggers,
            checkpoint_callback,
            early_stopping,
            inventory,
            environment,
            interrupt,
            warnings,
        } = self;

        let env = environment.unwrap_or_else(ClusterEnvironment::from_process_env);
        if env.is_spawned_worker() {
            if let Some(snapshot) = env.config_snapshot() {
                config = serde_json::from_str(snapshot)?;
                debug!("using the launcher's configuration snapshot");
            }
        }

        let mut registry = CallbackRegistry::new();
        for callback in callbacks {
            registry.push(callback);
        }
        if config.progress_bar_refresh_rate > 0 {
            registry.push(Box::new(ProgressCallback::new(config.progress_bar_refresh_rate)));
        }
        registry.on_init_start();

        let warnings = warnings.unwrap_or_default();
        for warning in &compat {
            warnings.compat(warning);
        }

        config.validate()?;
        config.apply_fast_dev_run();

        let inventory = inventory.unwrap_or_else(|| DeviceInventory::detect(&env));
        let strategy = ExecutionStrategy::resolve(&config, &inventory, &env, &warnings)?;

        let logger: Option<Box<dyn Logger>> = if loggers.len() > 1 {
            Some(Box::new(LoggerCollection::new(loggers)))
        } else if let Some(logger) = loggers.into_iter().next() {
            Some(logger)
        } else if config.logger {
            Some(Box::new(JsonlLogger::new(config.save_root(), DEFAULT_EXPERIMENT_NAME)?))
        } else {
            None
        };

        let checkpoint_callback = checkpoint_callback.or_else(|| {
            config
                .checkpoint_callback
                .then(ModelCheckpoint::default)
        });
        let early_stopping = early_stopping.or(match config.early_stop_callback {
            Some(true) => Some(EarlyStopping::default().strict(true)),
            None => Some(EarlyStopping::default().strict(false)),
            Some(false) => None,
        });

        let accumulation = AccumulationPolicy::new(config.accumulate_grad_batches.clone());
        let state = TrainerState {
            accumulate_grad_batches: accumulation.factor(0),
            ..TrainerState::default()
        };

        let mut trainer = Trainer {
            accumulation,
            clipping: ClippingPolicy::new(config.gradient_clip_val),
            data_policy: DataLoadingPolicy::from_config(&config),
            cadence: LoggingCadence::new(config.row_log_interval, config.log_save_interval),
            checkpoint_io: CheckpointIo::new(config.weights_root()),
            logger: LoggerConnector::new(logger),
            interrupt: interrupt.unwrap_or_else(InterruptHandle::global),
            callbacks: registry,
            checkpoint_callback,
            early_stopping,
            strategy,
            env,
            state,
            warnings,
            config,
            group: None,
            local_rank: 0,
            optimizers: OptimizerBundle::empty(),
            batch_loss_value: 0.0,
            launches: 0,
        };
        trainer.callbacks.on_init_end(&trainer.state);

        info!(
            strategy = %trainer.strategy.kind(),
            world_size = trainer.strategy.world_size(),
            precision = trainer.strategy.precision().bits(),
            "Trainer ready"
        );
        Ok(trainer)
    }
}

impl Trainer {
    /// Start building a trainer.
    pub fn builder() -> TrainerBuilder {
        TrainerBuilder::default()
    }

    /// Trainer with `config` and default policies.
    pub fn new(config: TrainerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Trainer from untyped options, deprecated names included.
    pub fn from_options(options: Map<String, Value>) -> Result<Self> {
        Self::builder()
            .resolved(TrainerConfig::from_options(options)?)
            .build()
    }

    /// Trainer from a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder()
            .resolved(TrainerConfig::from_yaml_file(path)?)
            .build()
    }

    /// Train `model` with its own loaders.
    pub fn fit<M>(&mut self, model: &mut M) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        self.fit_with(model, DataLoaders::none())
    }

    /// Train `model`, preferring the given loaders over the module's own.
    pub fn fit_with<M>(&mut self, model: &mut M, loaders: DataLoaders<M::Batch>) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        self.state.testing = false;
        self.launch(model, loaders)
    }

    /// Evaluate `model` on its test loaders.
    pub fn test<M>(&mut self, model: &mut M) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        self.test_with(model, DataLoaders::none())
    }

    /// Evaluate `model`, preferring the given test loaders over the
    /// module's own. Results land in [`Trainer::callback_metrics`].
    pub fn test_with<M>(&mut self, model: &mut M, loaders: DataLoaders<M::Batch>) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        self.state.testing = true;
        let result = self.launch(model, loaders);
        self.state.testing = false;
        result
    }

    /// Train as one rank of an already formed process group.
    ///
    /// The caller is the launcher here: `prepare_data` is not called.
    pub fn fit_with_group<M>(
        &mut self,
        model: &mut M,
        loaders: DataLoaders<M::Batch>,
        group: ProcessGroup,
    ) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        self.state.testing = false;
        let local_rank = group.rank() % self.strategy.procs_per_node().max(1);
        let result = self
            .attach(model, &loaders)
            .and_then(|()| self.run_worker(model, loaders, group, local_rank));
        self.settle(result)
    }

    /// Write a checkpoint of `model` and the current training progress.
    ///
    /// Returns `false` on processes other than rank zero, which never write.
    pub fn save_checkpoint<M>(&self, model: &M, path: impl AsRef<Path>) -> Result<bool>
    where
        M: TrainModule + ?Sized,
    {
        let best = self.checkpoint_callback.as_ref().and_then(|c| c.best());
        let checkpoint = self.dump_checkpoint(model, self.state.current_epoch + 1, best)?;
        self.checkpoint_io.save(&checkpoint, path.as_ref())
    }

    /// Resolved configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Live trainer state.
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Current epoch.
    pub fn current_epoch(&self) -> usize {
        self.state.current_epoch
    }

    /// Optimizer steps taken.
    pub fn global_step(&self) -> usize {
        self.state.global_step
    }

    /// Latest value of every metric.
    pub fn callback_metrics(&self) -> &Metrics {
        &self.state.callback_metrics
    }

    /// Metrics meant for progress reporting.
    pub fn progress_bar_metrics(&self) -> &Metrics {
        &self.state.progress_bar_metrics
    }

    /// Whether the last run was interrupted.
    pub fn interrupted(&self) -> bool {
        self.state.interrupted
    }

    /// Selected execution strategy.
    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.strategy
    }

    /// Warnings emitted so far.
    pub fn warnings(&self) -> &WarningCache {
        &self.warnings
    }

    /// Checkpoint policy, if enabled.
    pub fn checkpoint_callback(&self) -> Option<&ModelCheckpoint> {
        self.checkpoint_callback.as_ref()
    }

    /// Early stopping policy, if enabled.
    pub fn early_stopping(&self) -> Option<&EarlyStopping> {
        self.early_stopping.as_ref()
    }

    /// Flags polled at batch and epoch boundaries.
    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    /// Normalized optimizers of the last run.
    pub fn optimizers(&self) -> &OptimizerBundle {
        &self.optimizers
    }

    /// Experiment version, if a logger is attached.
    pub fn logger_version(&self) -> Option<String> {
        self.logger.version()
    }

    /// Enter `AttachingModel`: reset progress, check the module contract
    /// and bind trainer flags onto the module.
    pub(crate) fn attach<M>(&mut self, model: &mut M, overrides: &DataLoaders<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        self.state.transition(Stage::AttachingModel)?;
        self.state.reset_progress();
        self.interrupt.reset();
        check_model_configuration(&model.capabilities(), overrides, self.state.testing, &self.warnings)?;
        self.bind_model(model);
        Ok(())
    }

    /// Close out a run that may have failed before its worker body started.
    pub(crate) fn settle(&mut self, result: Result<RunStatus>) -> Result<RunStatus> {
        if result.is_err() {
            // Failures can surface in any stage.
            self.state.stage = Stage::Finalized;
        }
        result
    }

    pub(crate) fn bind_model<M>(&self, model: &mut M)
    where
        M: TrainModule + ?Sized,
    {
        let mut binding = self
            .strategy
            .binding(self.state.proc_rank, self.state.world_size, self.state.testing);
        binding.current_epoch = self.state.current_epoch;
        binding.global_step = self.state.global_step;
        model.on_bind(&binding);
    }

    pub(crate) fn barrier(&self) -> Result<()> {
        if let Some(group) = &self.group {
            if group.world_size() > 1 {
                group.barrier()?;
            }
        }
        Ok(())
    }

    /// Everything between worker setup and the first epoch.
    pub(crate) fn run_pretrain_routine<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        self.bind_model(model);
        if let Some(hparams) = model.hparams() {
            self.logger.log_hyperparams(&hparams)?;
        }
        self.logger.flush()?;

        if self.strategy.is_distributed() {
            self.barrier()?;
        }
        if self.strategy.on_tpu() {
            if let Some(group) = &self.group {
                group.rendezvous(PRETRAIN_RENDEZVOUS)?;
            }
        }

        self.configure_checkpoint_dir();
        self.restore_weights(model)?;

        if self.state.testing {
            self.state.transition(Stage::Testing)?;
            return self.run_test(model, loaders);
        }

        if self.state.is_rank_zero() {
            if let Some(mode) = self.config.weights_summary {
                for line in model.summarize(mode) {
                    info!(target: "kiln::summary", "{line}");
                }
            }
        }

        let caps = model.capabilities();
        self.state.disable_validation = !(caps.validation_step
            && (self.data_policy.val_percent > 0.0 || self.config.fast_dev_run));

        model.on_sanity_check_start()?;
        if !self.state.disable_validation && self.config.num_sanity_val_steps > 0 {
            self.state.transition(Stage::SanityChecking)?;
            self.run_sanity_check(model, loaders)?;
        }

        self.train(model, loaders)
    }

    fn configure_checkpoint_dir(&mut self) {
        let Some(policy) = self.checkpoint_callback.as_mut() else {
            return;
        };
        let dir = match (self.logger.name(), self.logger.version()) {
            (Some(name), Some(version)) => self
                .logger
                .save_dir()
                .unwrap_or_else(|| self.config.save_root())
                .join(name)
                .join(format!("version_{version}"))
                .join("checkpoints"),
            _ => self.config.weights_root().join("checkpoints"),
        };
        policy.set_default_dir(dir);
    }

    /// Restore from the latest preemption checkpoint, else from
    /// `resume_from_checkpoint`.
    fn restore_weights<M>(&mut self, model: &mut M) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        let resume = self.config.resume_from_checkpoint.clone();
        if let Some(path) = self.checkpoint_io.restore_path(resume.as_deref())? {
            let checkpoint = self.checkpoint_io.load(&path)?;
            self.restore_training_state(model, &checkpoint)?;
        }
        self.barrier()
    }

    pub(crate) fn restore_training_state<M>(&mut self, model: &mut M, checkpoint: &Checkpoint) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        model.load_state_dict(&checkpoint.model_state)?;
        model.on_load_checkpoint(&checkpoint.extra)?;
        if self.state.testing {
            return Ok(());
        }

        self.optimizers
            .load_states(&checkpoint.optimizer_states, &checkpoint.lr_schedulers)?;
        self.state.global_step = checkpoint.global_step;
        self.state.current_epoch = checkpoint.epoch;

        if let (Some(policy), Some(best)) = (self.checkpoint_callback.as_mut(), checkpoint.checkpoint_callback_best) {
            policy.restore_best(best);
        }
        if let (Some(policy), Some(state)) = (self.early_stopping.as_mut(), checkpoint.early_stopping.as_ref()) {
            policy.load_state(state);
        }
        info!(
            epoch = checkpoint.epoch,
            step = checkpoint.global_step,
            "Restored training state"
        );
        Ok(())
    }

    /// Snapshot the module and training progress.
    ///
    /// `resume_epoch` is the epoch a run restored from this record starts at.
    pub(crate) fn dump_checkpoint<M>(&self, model: &M, resume_epoch: usize, best: Option<f64>) -> Result<Checkpoint>
    where
        M: TrainModule + ?Sized,
    {
        let mut checkpoint = Checkpoint::new(resume_epoch, self.state.global_step, model.state_dict()?);
        checkpoint.optimizer_states = self.optimizers.optimizer_states()?;
        checkpoint.lr_schedulers = self.optimizers.scheduler_states()?;
        checkpoint.hparams = model.hparams();
        checkpoint.checkpoint_callback_best = best;
        checkpoint.early_stopping = self.early_stopping.as_ref().map(|e| e.state());
        model.on_save_checkpoint(&mut checkpoint.extra);
        Ok(checkpoint)
    }

    /// Run the checkpoint policy for a finished check.
    pub(crate) fn run_checkpoint_policy<M>(&mut self, model: &M, resume_epoch: usize) -> Result<Option<PathBuf>>
    where
        M: TrainModule + ?Sized,
    {
        if !self.state.is_rank_zero() {
            return Ok(None);
        }
        let Some(mut policy) = self.checkpoint_callback.take() else {
            return Ok(None);
        };
        let metrics = self.state.callback_metrics.clone();
        let saved = policy.on_validation_end(self.state.current_epoch, &metrics, &self.warnings, |path, best| {
            let checkpoint = self.dump_checkpoint(model, resume_epoch, best)?;
            self.checkpoint_io.save(&checkpoint, path).map(|_| ())
        });
        self.checkpoint_callback = Some(policy);
        let saved = saved?;
        if let Some(path) = &saved {
            self.callbacks.on_save(path);
        }
        Ok(saved)
    }
}

/// Check a module's declared capabilities against the trainer contract.
pub(crate) fn check_model_configuration<B>(
    caps: &Capabilities,
    overrides: &DataLoaders<B>,
    testing: bool,
    warnings: &WarningCache,
) -> Result<()> {
    if testing {
        let has_test_loader = caps.test_dataloader || overrides.test.is_some();
        if !caps.test_step && !has_test_loader {
            return Err(KilnError::misconfigured(
                "test_step",
                "`Trainer.test` needs a `test_step()` and a `test_dataloader()` to be defined.",
            ));
        }
        return check_test_pairing(caps, overrides, warnings);
    }

    if !caps.training_step {
        return Err(KilnError::misconfigured(
            "training_step",
            format!("No `training_step()` method defined. {MINIMUM_CONTRACT}"),
        ));
    }
    if !(caps.train_dataloader || overrides.train.is_some()) {
        return Err(KilnError::misconfigured(
            "train_dataloader",
            format!("No `train_dataloader()` method defined. {MINIMUM_CONTRACT}"),
        ));
    }
    if !caps.configure_optimizers {
        return Err(KilnError::misconfigured(
            "configure_optimizers",
            format!("No `configure_optimizers()` method defined. {MINIMUM_CONTRACT}"),
        ));
    }

    let has_val_loader = caps.val_dataloader || overrides.val.is_some();
    if has_val_loader && !caps.validation_step {
        return Err(KilnError::misconfigured(
            "validation_step",
            "You have passed in a `val_dataloader()` but have not defined `validation_step()`.",
        ));
    }
    if caps.validation_step && !has_val_loader {
        return Err(KilnError::misconfigured(
            "val_dataloader",
            "You have defined `validation_step()`, but have not passed in a `val_dataloader()`.",
        ));
    }
    if caps.validation_step && !caps.validation_epoch_end {
        warnings.warn(
            "You have defined a `val_dataloader()` and have defined a `validation_step()`, \
             you may also want to define `validation_epoch_end()` for accumulating stats.",
        );
    }
    check_test_pairing(caps, overrides, warnings)
}

/// A test step and a test loader come together or not at all.
fn check_test_pairing<B>(caps: &Capabilities, overrides: &DataLoaders<B>, warnings: &WarningCache) -> Result<()> {
    let has_test_loader = caps.test_dataloader || overrides.test.is_some();
    if has_test_loader && !caps.test_step {
        return Err(KilnError::misconfigured(
            "test_step",
            "You have passed in a `test_dataloader()` but have not defined `test_step()`.",
        ));
    }
    if caps.test_step && !has_test_loader {
        return Err(KilnError::misconfigured(
            "test_dataloader",
            "You have defined `test_step()`, but have not passed in a `test_dataloader()`.",
        ));
    }
    if caps.test_step && !caps.test_epoch_end {
        warnings.warn(
            "You have defined a `test_dataloader()` and have defined a `test_step()`, \
             you may also want to define `test_epoch_end()` for accumulating stats.",
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{DataLoader, OptimizerConfig, StepOutput};

    struct Numbers(usize);

    impl DataLoader<f64> for Numbers {
        fn len(&self) -> Option<usize> {
            Some(self.0)
        }

        fn batches(&mut self) -> Box<dyn Iterator<Item = Result<f64>> + '_> {
            Box::new((0..self.0).map(|i| Ok(i as f64)))
        }
    }

    fn loaders() -> DataLoaders<f64> {
        DataLoaders::none()
    }

    #[test]
    fn test_minimum_contract() {
        let warnings = WarningCache::new();
        let caps = Capabilities::training();
        assert!(check_model_configuration(&caps, &loaders(), false, &warnings).is_ok());

        let missing_opt = Capabilities {
            configure_optimizers: false,
            ..Capabilities::training()
        };
        let err = check_model_configuration(&missing_opt, &loaders(), false, &warnings).unwrap_err();
        assert!(err.to_string().contains("configure_optimizers"));
    }

    #[test]
    fn test_train_loader_override_satisfies_contract() {
        let warnings = WarningCache::new();
        let caps = Capabilities {
            train_dataloader: false,
            ..Capabilities::training()
        };
        assert!(check_model_configuration(&caps, &loaders(), false, &warnings).is_err());
        let overrides = DataLoaders::none().train(Numbers(3));
        assert!(check_model_configuration(&caps, &overrides, false, &warnings).is_ok());
    }

    #[test]
    fn test_validation_pairing() {
        let warnings = WarningCache::new();
        let step_only = Capabilities {
            validation_step: true,
            ..Capabilities::training()
        };
        let err = check_model_configuration(&step_only, &loaders(), false, &warnings).unwrap_err();
        assert!(err.is_misconfiguration());
        assert!(err.to_string().contains("have not passed in a `val_dataloader()`"));

        let overrides = DataLoaders::none().val(Numbers(2));
        let err = check_model_configuration(&Capabilities::training(), &overrides, false, &warnings).unwrap_err();
        assert!(err.to_string().contains("have not defined `validation_step()`"));

        // step + loader without epoch end only warns
        assert!(check_model_configuration(&step_only, &overrides, false, &warnings).is_ok());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_fit_checks_test_pairing() {
        let warnings = WarningCache::new();
        let step_only = Capabilities {
            test_step: true,
            ..Capabilities::training()
        };
        let err = check_model_configuration(&step_only, &loaders(), false, &warnings).unwrap_err();
        assert!(matches!(err, KilnError::Misconfiguration { ref option, .. } if option == "test_dataloader"));

        let loader_only = Capabilities {
            test_dataloader: true,
            ..Capabilities::training()
        };
        let err = check_model_configuration(&loader_only, &loaders(), false, &warnings).unwrap_err();
        assert!(matches!(err, KilnError::Misconfiguration { ref option, .. } if option == "test_step"));

        let overrides = DataLoaders::none().test(Numbers(2));
        assert!(check_model_configuration(&step_only, &overrides, false, &warnings).is_ok());
        assert_eq!(warnings.len(), 1);
        assert!(warnings.emitted()[0].contains("test_epoch_end"));
    }

    #[test]
    fn test_testing_requires_test_step() {
        let warnings = WarningCache::new();
        let err = check_model_configuration(&Capabilities::training(), &loaders(), true, &warnings).unwrap_err();
        assert!(err.to_string().contains("test_step"));
        let caps = Capabilities::training().with_test();
        assert!(check_model_configuration(&caps, &loaders(), true, &warnings).is_ok());
    }

    struct Empty;

    impl TrainModule for Empty {
        type Batch = f64;

        fn capabilities(&self) -> Capabilities {
            Capabilities::training()
        }

        fn training_step(&mut self, batch: &f64, _batch_idx: usize, _opt: Option<usize>) -> Result<StepOutput> {
            Ok(StepOutput::with_loss(*batch))
        }

        fn configure_optimizers(&mut self) -> Result<OptimizerConfig> {
            Ok(OptimizerConfig::None)
        }
    }

    #[test]
    fn test_builder_maps_early_stop_option() {
        let build = |early_stop_callback| {
            Trainer::builder()
                .config(TrainerConfig {
                    early_stop_callback,
                    logger: false,
                    ..Default::default()
                })
                .environment(ClusterEnvironment::from_vars(Vec::<(String, String)>::new()))
                .devices(DeviceInventory::cpu_only())
                .interrupt_handle(InterruptHandle::new())
                .build()
                .unwrap()
        };
        assert!(build(Some(false)).early_stopping().is_none());
        assert!(build(Some(true)).early_stopping().is_some());
        assert!(build(None).early_stopping().is_some());
    }

    #[test]
    fn test_save_checkpoint_before_fit() {
        let dir = tempfile::TempDir::new().unwrap();
        let trainer = Trainer::builder()
            .config(TrainerConfig {
                logger: false,
                default_save_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            })
            .environment(ClusterEnvironment::from_vars(Vec::<(String, String)>::new()))
            .devices(DeviceInventory::cpu_only())
            .interrupt_handle(InterruptHandle::new())
            .build()
            .unwrap();
        let path = dir.path().join("manual.ckpt");
        assert!(trainer.save_checkpoint(&Empty, &path).unwrap());
        let checkpoint = Checkpoint::read(&path).unwrap();
        assert_eq!(checkpoint.epoch, 1);
        assert_eq!(checkpoint.global_step, 0);
    }
}
