//! Validation, testing and the sanity pass.
//!
//! Every evaluation goes through the same path: step outputs are collected
//! per loader, reduced by the module's epoch-end hook (or averaged key by
//! key when it has none) and merged into the trainer metrics.

use crate::data_loading::{loader_lengths, LoaderSet};
use crate::logging::prepare_metrics;
use crate::trainer::Trainer;
use kiln_core::{DataLoader, Metrics, Result, Stage, StepOutput, TrainModule};
use std::collections::BTreeMap;
use tracing::{debug, info};

impl Trainer {
    pub(crate) fn reset_val_loaders<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        loaders.reset_val(model, &self.data_policy)?;
        let lens = loaders.val.as_deref().map(loader_lengths).unwrap_or_default();
        self.state.num_val_batches = self.data_policy.num_eval_batches(&lens, false);
        debug!(batches = ?self.state.num_val_batches, "validation loaders ready");
        Ok(())
    }

    fn reset_test_loaders<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        loaders.reset_test(model, &self.data_policy)?;
        let lens = loaders.test.as_deref().map(loader_lengths).unwrap_or_default();
        self.state.num_test_batches = self.data_policy.num_eval_batches(&lens, true);
        debug!(batches = ?self.state.num_test_batches, "test loaders ready");
        Ok(())
    }

    /// Run a few validation batches before training so a broken
    /// validation path fails early. Only the early stopping metric check
    /// sees the results.
    pub(crate) fn run_sanity_check<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        self.reset_val_loaders(model, loaders)?;
        let Some(val) = loaders.val.as_mut() else {
            return Ok(());
        };
        let limits: Vec<usize> = self
            .state
            .num_val_batches
            .iter()
            .map(|n| (*n).min(self.config.num_sanity_val_steps))
            .collect();
        let outputs = evaluate(model, val, &limits, false)?;
        let reduced = reduce_outputs(model, &outputs, false)?;
        if let Some(policy) = &self.early_stopping {
            policy.check_metrics(&reduced.callback_metrics(), &self.warnings)?;
        }
        Ok(())
    }

    /// Validate during training, then run the checkpoint policy.
    ///
    /// A check after the last batch of an epoch records the next epoch as
    /// the resume point.
    pub(crate) fn run_validation<M>(
        &mut self,
        model: &mut M,
        val: Option<&mut Vec<Box<dyn DataLoader<M::Batch>>>>,
        is_last_batch: bool,
    ) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        let Some(val) = val else {
            return Ok(());
        };
        self.state.transition(Stage::Validating)?;
        let limits = self.state.num_val_batches.clone();
        self.run_eval_pass(model, val, &limits, false)?;
        self.state.transition(Stage::Training)?;

        let epoch = self.state.current_epoch;
        let resume_epoch = if is_last_batch { epoch + 1 } else { epoch };
        self.run_checkpoint_policy(&*model, resume_epoch)?;
        Ok(())
    }

    /// Evaluate on the test loaders.
    pub(crate) fn run_test<M>(&mut self, model: &mut M, loaders: &mut LoaderSet<M::Batch>) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        self.reset_test_loaders(model, loaders)?;
        let limits = self.state.num_test_batches.clone();
        if let Some(test) = loaders.test.as_mut() {
            self.run_eval_pass(model, test, &limits, true)?;
        }
        info!(metrics = ?self.state.callback_metrics, "Test complete");
        Ok(())
    }

    fn run_eval_pass<M>(
        &mut self,
        model: &mut M,
        loaders: &mut [Box<dyn DataLoader<M::Batch>>],
        limits: &[usize],
        test: bool,
    ) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        if test {
            model.on_test_start()?;
            self.callbacks.on_test_start(&self.state);
        } else {
            model.on_validation_start()?;
            self.callbacks.on_validation_start(&self.state);
        }

        if limits.iter().any(|n| *n > 0) {
            let outputs = evaluate(model, loaders, limits, test)?;
            let reduced = reduce_outputs(model, &outputs, test)?;
            self.absorb_eval_output(&reduced)?;
        }

        if test {
            model.on_test_end()?;
            self.callbacks.on_test_end(&self.state);
        } else {
            model.on_validation_end()?;
            self.callbacks.on_validation_end(&self.state);
        }
        Ok(())
    }

    fn absorb_eval_output(&mut self, output: &StepOutput) -> Result<()> {
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
}

/// Step through each loader up to its limit, in evaluation mode.
fn evaluate<M>(
    model: &mut M,
    loaders: &mut [Box<dyn DataLoader<M::Batch>>],
    limits: &[usize],
    test: bool,
) -> Result<Vec<Vec<StepOutput>>>
where
    M: TrainModule + ?Sized,
{
    model.set_training(false);
    let result = evaluate_loaders(model, loaders, limits, test);
    model.set_training(true);
    result
}

fn evaluate_loaders<M>(
    model: &mut M,
    loaders: &mut [Box<dyn DataLoader<M::Batch>>],
    limits: &[usize],
    test: bool,
) -> Result<Vec<Vec<StepOutput>>>
where
    M: TrainModule + ?Sized,
{
    let mut all = Vec::with_capacity(loaders.len());
    for (dataloader_idx, loader) in loaders.iter_mut().enumerate() {
        let limit = limits.get(dataloader_idx).copied().unwrap_or(0);
        let mut outputs = Vec::new();
        for (batch_idx, batch) in loader.batches().take(limit).enumerate() {
            let batch = batch?;
            let output = if test {
                model.test_step(&batch, batch_idx, dataloader_idx)?
            } else {
                model.validation_step(&batch, batch_idx, dataloader_idx)?
            };
            outputs.push(output);
        }
        all.push(outputs);
    }
    Ok(all)
}

/// Reduce evaluation outputs with the module's epoch-end hook, falling
/// back to a per-key mean.
fn reduce_outputs<M>(model: &mut M, outputs: &[Vec<StepOutput>], test: bool) -> Result<StepOutput>
where
    M: TrainModule + ?Sized,
{
    let caps = model.capabilities();
    let reduced = if test && caps.test_epoch_end {
        model.test_epoch_end(outputs)?
    } else if !test && caps.validation_epoch_end {
        model.validation_epoch_end(outputs)?
    } else {
        None
    };
    Ok(reduced.unwrap_or_else(|| mean_outputs(outputs)))
}

fn mean_outputs(outputs: &[Vec<StepOutput>]) -> StepOutput {
    let flat: Vec<&StepOutput> = outputs.iter().flatten().collect();
    let losses: Vec<f64> = flat.iter().filter_map(|o| o.loss).collect();
    StepOutput {
        loss: (!losses.is_empty()).then(|| losses.iter().sum::<f64>() / losses.len() as f64),
        log: mean_by_key(flat.iter().map(|o| &o.log)),
        progress_bar: mean_by_key(flat.iter().map(|o| &o.progress_bar)),
        values: mean_by_key(flat.iter().map(|o| &o.values)),
    }
}

fn mean_by_key<'a>(maps: impl Iterator<Item = &'a Metrics>) -> Metrics {
    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for map in maps {
        for (key, value) in map {
            let entry = sums.entry(key.as_str()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(key, (sum, count))| (key.to_string(), sum / count as f64))
        .collect()
}
