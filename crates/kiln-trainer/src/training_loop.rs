//! Epoch and batch loops.
//!
//! One process runs this loop single-threaded. Interrupts and preemption
//! requests are only observed between batches, and the stop decision at
//! each epoch end is the only collective call, so every rank makes the same
//! number of them.

use crate::data_loading::LoaderSet;
use crate::logging::prepare_metrics;
use crate::signals::requeue_job;
use crate::trainer::Trainer;
use kiln_core::{BatchControl, Capabilities, KilnError, Metrics, Result, SchedulerInterval, Stage, StepOutput, TrainModule};
use tracing::{debug, info, warn};

/// What one training batch produced.
#[derive(Debug, Default)]
struct BatchOutcome {
    stepped: bool,
    log: Metrics,
    progress_bar: Metrics,
    callback_metrics: Metrics,
    grad_norms: Metrics,
    outputs: Vec<StepOutput>,
}

impl BatchOutcome {
    fn absorb(&mut self, output: StepOutput) {
        self.log.extend(output.log.iter().map(|(k, v)| (k.clone(), *v)));
        self.progress_bar
            .extend(output.progress_bar.iter().map(|(k, v)| (k.clone(), *v)));
        self.callback_metrics.extend(output.callback_metrics());
        self.outputs.push(output);
    }
}

impl Trainer {
    /// Run epochs until `max_epochs`, `max_steps`, early stopping or an
    /// interrupt ends training.
    pub(crate) fn train<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        self.state.transition(Stage::Training)?;
        self.reset_train_loader(model, loaders)?;
        if !self.state.disable_validation {
            self.reset_val_loaders(model, loaders)?;
        }

        model.on_train_start()?;
        self.callbacks.on_train_start(&self.state);

        let caps = model.capabilities();
        let start = self.state.current_epoch;
        let end = self.config.max_epochs.unwrap_or(usize::MAX);
        for epoch in start..end {
            self.state.current_epoch = epoch;
            if epoch > start && self.data_policy.reload_every_epoch {
                self.reset_train_loader(model, loaders)?;
                if !self.state.disable_validation {
                    self.reset_val_loaders(model, loaders)?;
                }
            }

            self.state.accumulate_grad_batches = self.accumulation.factor(epoch);
            self.bind_model(model);
            model.on_epoch_start()?;
            self.callbacks.on_epoch_start(&self.state);

            let validated = self.run_training_epoch(model, loaders, &caps)?;

            if !self.state.interrupted {
                self.optimizers.update_learning_rates(
                    SchedulerInterval::Epoch,
                    self.state.batch_idx,
                    epoch,
                    &self.state.callback_metrics,
                )?;
                model.on_epoch_end()?;
                self.callbacks.on_epoch_end(&self.state);
            }

            let local_stop = self.state.interrupted || self.early_stop_decision(validated, &caps)?;
            if self.sync_stop(local_stop)? {
                if !self.state.interrupted {
                    self.state.should_stop = true;
                    info!(epoch, step = self.state.global_step, "Stopping training");
                }
                break;
            }
            if self.max_steps_reached() {
                info!(step = self.state.global_step, "Reached max_steps");
                break;
            }
        }
        Ok(())
    }

    /// One pass over the training loader. Returns whether validation ran.
    fn run_training_epoch<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>, caps: &Capabilities) -> Result<bool>
    where
        M: TrainModule + ?Sized,
    {
        let epoch = self.state.current_epoch;
        let num_batches = self.state.num_training_batches;
        let Some(train) = loaders.train.as_mut() else {
            return Err(KilnError::Runtime("the training loader was not resolved".to_string()));
        };
        let mut batches = train.batches().peekable();
        let mut epoch_outputs = Vec::new();
        let mut validated = false;
        let mut window_open = false;
        let mut batch_idx = 0;

        loop {
            if num_batches.is_some_and(|n| batch_idx >= n) {
                break;
            }
            if self.poll_interrupt(&*model)? {
                break;
            }
            let Some(batch) = batches.next() else {
                break;
            };
            let batch = batch?;
            let is_last = num_batches.is_some_and(|n| batch_idx + 1 >= n) || batches.peek().is_none();
            self.state.batch_idx = batch_idx;

            self.callbacks.on_batch_start(&self.state);
            if model.on_batch_start(&batch)? == BatchControl::StopEpoch {
                debug!(epoch, batch_idx, "on_batch_start ended the epoch");
                if self.can_validate_epoch() {
                    self.run_validation(model, loaders.val.as_mut(), is_last)?;
                    validated = true;
                }
                break;
            }

            let step_before = self.state.global_step;
            let outcome = self.run_training_batch(model, &batch, batch_idx, is_last)?;
            window_open = !outcome.stepped;

            if outcome.stepped {
                self.optimizers.update_learning_rates(
                    SchedulerInterval::Step,
                    batch_idx,
                    epoch,
                    &self.state.callback_metrics,
                )?;
            }

            if self.should_check_val(batch_idx, is_last) {
                self.run_validation(model, loaders.val.as_mut(), is_last)?;
                validated = true;
            }

            if self.cadence.should_log_row(batch_idx) || self.config.fast_dev_run {
                let mut row = outcome.log;
                row.extend(outcome.grad_norms);
                let (row, step) = prepare_metrics(&row, epoch, step_before);
                self.logger.record(row, step);
            }
            if self.cadence.should_flush(batch_idx) || is_last || self.config.fast_dev_run {
                self.logger.flush()?;
            }

            if caps.training_epoch_end {
                epoch_outputs.extend(outcome.outputs);
            }
            self.state.total_batch_idx += 1;
            batch_idx += 1;

            if self.max_steps_reached() || is_last {
                break;
            }
        }
        drop(batches);

        if window_open {
            self.discard_partial_window(epoch, batch_idx)?;
        }

        if self.state.interrupted {
            return Ok(validated);
        }

        if caps.training_epoch_end && !epoch_outputs.is_empty() {
            if let Some(output) = model.training_epoch_end(&epoch_outputs)? {
                self.absorb_epoch_output(&output)?;
            }
        }

        if !caps.validation_step {
            self.run_checkpoint_policy(&*model, epoch + 1)?;
        }
        Ok(validated)
    }

    /// Drop gradients and loss of an accumulation window the epoch ended
    /// inside of, so they never reach the next epoch's first step.
    fn discard_partial_window(&mut self, epoch: usize, batch_idx: usize) -> Result<()> {
        debug!(epoch, batch_idx, "discarding a partial accumulation window");
        for optimizer in self.optimizers.optimizers.iter_mut() {
            optimizer.zero_grad()?;
        }
        self.batch_loss_value = 0.0;
        Ok(())
    }

    /// Forward, backward and (at the end of an accumulation window) the
    /// optimizer step for every optimizer due on this batch.
    fn run_training_batch<M>(&mut self, model: &mut M, batch: &M::Batch, batch_idx: usize, is_last: bool) -> Result<BatchOutcome>
    where
        M: TrainModule + ?Sized,
    {
        let factor = self.state.accumulate_grad_batches;
        let should_step = self.accumulation.should_step(batch_idx, factor, is_last);
        let multiple = self.optimizers.optimizers.len() > 1;
        let mut outcome = BatchOutcome::default();

        for opt_idx in self.optimizers.optimizer_iteration(self.state.total_batch_idx) {
            let output = model.training_step(batch, batch_idx, multiple.then_some(opt_idx))?;
            let Some(loss) = output.loss else {
                return Err(KilnError::misconfigured(
                    "training_step",
                    "`training_step` must return a loss to optimize",
                ));
            };
            let scaled = loss / factor as f64;
            model.backward(scaled, opt_idx)?;
            model.on_after_backward()?;
            self.batch_loss_value += scaled;
            outcome.absorb(output);

            if should_step {
                if self.config.track_grad_norm > 0 {
                    outcome
                        .grad_norms
                        .extend(model.grad_norms(f64::from(self.config.track_grad_norm)));
                }
                self.clipping.clip(model)?;
                let Some(optimizer) = self.optimizers.optimizers.get_mut(opt_idx) else {
                    return Err(KilnError::Runtime(format!("no optimizer at index {opt_idx}")));
                };
                model.optimizer_step(self.state.current_epoch, batch_idx, &mut **optimizer, opt_idx)?;
                outcome.stepped = true;
            }
        }

        if outcome.stepped {
            self.state.running_loss.push(self.batch_loss_value);
            self.batch_loss_value = 0.0;
            self.state.global_step += 1;
        }

        self.state
            .callback_metrics
            .extend(outcome.callback_metrics.iter().map(|(k, v)| (k.clone(), *v)));
        self.state
            .progress_bar_metrics
            .extend(outcome.progress_bar.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(mean) = self.state.running_loss.mean() {
            self.state.progress_bar_metrics.insert("loss".to_string(), mean);
        }

        model.on_batch_end()?;
        self.callbacks.on_batch_end(&self.state);
        Ok(outcome)
    }

    /// Merge an epoch-end output into the metrics and log it.
    pub(crate) fn absorb_epoch_output(&mut self, output: &StepOutput) -> Result<()> {
        self.state.callback_metrics.extend(output.callback_metrics());
        self.state
            .progress_bar_metrics
            .extend(output.progress_bar.iter().map(|(k, v)| (k.clone(), *v)));
        if !output.log.is_empty() {
            let (row, step) = prepare_metrics(&output.log, self.state.current_epoch, self.state.global_step);
            self.logger.record(row, step);
            self.logger.flush()?;
        }
        Ok(())
    }

    fn reset_train_loader<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        loaders.reset_train(model, &self.data_policy)?;
        let len = loaders.train.as_ref().and_then(|loader| loader.len());
        self.state.num_training_batches = self.data_policy.num_training_batches(len);
        self.state.val_check_batch = self
            .data_policy
            .val_check_batch(self.state.num_training_batches)?;
        debug!(
            batches = ?self.state.num_training_batches,
            val_check_batch = ?self.state.val_check_batch,
            "training loader ready"
        );
        Ok(())
    }

    fn can_validate_epoch(&self) -> bool {
        !self.state.disable_validation
            && (self.state.current_epoch + 1) % self.config.check_val_every_n_epoch.max(1) == 0
    }

    fn should_check_val(&self, batch_idx: usize, is_last: bool) -> bool {
        if !self.can_validate_epoch() {
            return false;
        }
        match self.state.val_check_batch {
            Some(every) => (batch_idx + 1) % every.max(1) == 0,
            None => is_last,
        }
    }

    fn max_steps_reached(&self) -> bool {
        self.config
            .max_steps
            .is_some_and(|max| self.state.global_step >= max)
    }

    /// Whether early stopping ends training after this epoch.
    ///
    /// Checks run after a validation pass, or every epoch for modules
    /// without `validation_step`, once `min_epochs` and `min_steps` are met.
    fn early_stop_decision(&mut self, validated: bool, caps: &Capabilities) -> Result<bool> {
        let Some(policy) = self.early_stopping.as_mut() else {
            return Ok(false);
        };
        if !(validated || !caps.validation_step) {
            return Ok(false);
        }
        let met_min_epochs = self.state.current_epoch + 1 >= self.config.min_epochs;
        let met_min_steps = self
            .config
            .min_steps
            .map_or(true, |min| self.state.global_step >= min);
        let mins_met = met_min_epochs && met_min_steps;
        if !(mins_met || self.config.fast_dev_run) {
            return Ok(false);
        }
        let stop = policy.on_epoch_end(self.state.current_epoch, &self.state.callback_metrics, &self.warnings)?;
        Ok(stop && mins_met)
    }

    /// Any rank stopping stops all ranks.
    fn sync_stop(&self, local_stop: bool) -> Result<bool> {
        match &self.group {
            Some(group) if group.world_size() > 1 => Ok(group.any(local_stop)?),
            _ => Ok(local_stop),
        }
    }

    /// Observe interrupt and preemption requests at a batch boundary.
    fn poll_interrupt<M>(&mut self, model: &M) -> Result<bool>
    where
        M: TrainModule + ?Sized,
    {
        if self.interrupt.take_preempted() {
            info!(
                epoch = self.state.current_epoch,
                step = self.state.global_step,
                "Preemption requested, saving a checkpoint"
            );
            self.hpc_save(model)?;
            self.state.interrupted = true;
            return Ok(true);
        }
        if self.interrupt.is_interrupted() {
            if !self.state.interrupted {
                info!(
                    epoch = self.state.current_epoch,
                    batch = self.state.batch_idx,
                    "Interrupt detected, finishing the run gracefully"
                );
            }
            self.state.interrupted = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Write a preemption checkpoint and ask SLURM to requeue the job.
    fn hpc_save<M>(&mut self, model: &M) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        let best = self.checkpoint_callback.as_ref().and_then(|c| c.best());
        let checkpoint = self.dump_checkpoint(model, self.state.current_epoch, best)?;
        if let Some(path) = self.checkpoint_io.hpc_save(&checkpoint)? {
            self.callbacks.on_save(&path);
            if let Some(job_id) = self.env.slurm_job_id() {
                if let Err(e) = requeue_job(job_id) {
                    warn!("Failed to requeue job {}: {}", job_id, e);
                }
            }
        }
        Ok(())
    }
}
