//! Loader resolution and percent-check truncation.
//!
//! Loaders come either from overrides handed to `fit`/`test` or from the
//! module's factories. An override replaces the factory for the whole run:
//! reloading keeps reusing it.

use kiln_core::{DataLoader, KilnError, Result, TrainModule, TrainerConfig, ValCheckInterval};

/// Loaders supplied alongside the module.
pub struct DataLoaders<B> {
    /// Replaces `train_dataloader`.
    pub train: Option<Box<dyn DataLoader<B>>>,
    /// Replaces `val_dataloaders`.
    pub val: Option<Vec<Box<dyn DataLoader<B>>>>,
    /// Replaces `test_dataloaders`.
    pub test: Option<Vec<Box<dyn DataLoader<B>>>>,
}

impl<B> Default for DataLoaders<B> {
    fn default() -> Self {
        Self {
            train: None,
            val: None,
            test: None,
        }
    }
}

impl<B> DataLoaders<B> {
    /// No overrides.
    pub fn none() -> Self {
        Self::default()
    }

    /// Override the training loader.
    pub fn train(mut self, loader: impl DataLoader<B> + 'static) -> Self {
        self.train = Some(Box::new(loader));
        self
    }

    /// Add a validation loader override.
    pub fn val(mut self, loader: impl DataLoader<B> + 'static) -> Self {
        self.val.get_or_insert_with(Vec::new).push(Box::new(loader));
        self
    }

    /// Add a test loader override.
    pub fn test(mut self, loader: impl DataLoader<B> + 'static) -> Self {
        self.test.get_or_insert_with(Vec::new).push(Box::new(loader));
        self
    }
}

/// Truncated batch count for a percent check.
///
/// `0` disables the phase; any positive percent keeps at least one batch.
pub fn percent_length(percent: f64, natural: usize) -> usize {
    if percent <= 0.0 || natural == 0 {
        return 0;
    }
    ((percent * natural as f64).floor() as usize).clamp(1, natural)
}

/// Effective percents and shuffling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataLoadingPolicy {
    /// Fraction of training batches per epoch.
    pub train_percent: f64,
    /// Fraction of validation batches per pass.
    pub val_percent: f64,
    /// Fraction of test batches.
    pub test_percent: f64,
    /// Force shuffling off so the same subset repeats every epoch.
    pub disable_shuffle: bool,
    /// One batch per phase.
    pub fast_dev_run: bool,
    /// Validation cadence inside an epoch.
    pub val_check_interval: ValCheckInterval,
    /// Rebuild loaders at every epoch.
    pub reload_every_epoch: bool,
}

impl DataLoadingPolicy {
    /// Derive from configuration. `overfit_pct > 0` overrides all three
    /// percents.
    pub fn from_config(config: &TrainerConfig) -> Self {
        let overfit = config.overfit_pct > 0.0;
        let pick = |p: f64| if overfit { config.overfit_pct } else { p };
        Self {
            train_percent: pick(config.train_percent_check),
            val_percent: pick(config.val_percent_check),
            test_percent: pick(config.test_percent_check),
            disable_shuffle: overfit,
            fast_dev_run: config.fast_dev_run,
            val_check_interval: config.val_check_interval,
            reload_every_epoch: config.reload_dataloaders_every_epoch,
        }
    }

    fn limit(&self, percent: f64, len: Option<usize>) -> Option<usize> {
        let n = len?;
        if self.fast_dev_run {
            return Some(n.min(1));
        }
        Some(percent_length(percent, n))
    }

    /// Training batches per epoch; `None` for a loader without a length.
    pub fn num_training_batches(&self, len: Option<usize>) -> Option<usize> {
        if self.fast_dev_run && len.is_none() {
            return Some(1);
        }
        self.limit(self.train_percent, len)
    }

    /// Batches per evaluation loader. Loaders without a length are capped
    /// only by `fast_dev_run`.
    pub fn num_eval_batches(&self, lens: &[Option<usize>], test: bool) -> Vec<usize> {
        let percent = if test { self.test_percent } else { self.val_percent };
        lens.iter()
            .map(|len| match len {
                Some(_) => self.limit(percent, *len).unwrap_or(0),
                None if self.fast_dev_run => 1,
                None if percent > 0.0 => usize::MAX,
                None => 0,
            })
            .collect()
    }

    /// Validate after this many training batches.
    ///
    /// `None` means "at the end of the epoch" for a loader without a length.
    pub fn val_check_batch(&self, num_training_batches: Option<usize>) -> Result<Option<usize>> {
        match (self.val_check_interval, num_training_batches) {
            (ValCheckInterval::Batches(n), Some(total)) => {
                let n = n as usize;
                if n > total && !self.fast_dev_run {
                    return Err(KilnError::misconfigured(
                        "val_check_interval",
                        format!(
                            "({n}) must be less than or equal to the number of training batches ({total}). \
                             If you want to disable validation set `val_percent_check` to 0.0 instead."
                        ),
                    ));
                }
                Ok(Some(n.min(total).max(1)))
            }
            (ValCheckInterval::Batches(n), None) => Ok(Some(n.max(1) as usize)),
            (ValCheckInterval::Fraction(f), Some(total)) => {
                Ok(Some(((total as f64 * f).floor() as usize).max(1)))
            }
            (ValCheckInterval::Fraction(f), None) => {
                if (f - 1.0).abs() > f64::EPSILON {
                    return Err(KilnError::misconfigured(
                        "val_check_interval",
                        format!(
                            "must be 1.0 when the training loader has no length, got {f}"
                        ),
                    ));
                }
                Ok(None)
            }
        }
    }
}

/// The loaders of one run and where they come from.
pub struct LoaderSet<B> {
    /// Training loader, once resolved.
    pub train: Option<Box<dyn DataLoader<B>>>,
    /// Validation loaders, once resolved.
    pub val: Option<Vec<Box<dyn DataLoader<B>>>>,
    /// Test loaders, once resolved.
    pub test: Option<Vec<Box<dyn DataLoader<B>>>>,
    train_override: bool,
    val_override: bool,
    test_override: bool,
}

impl<B> LoaderSet<B> {
    /// Start from the overrides handed to the run.
    pub fn new(overrides: DataLoaders<B>) -> Self {
        Self {
            train_override: overrides.train.is_some(),
            val_override: overrides.val.is_some(),
            test_override: overrides.test.is_some(),
            train: overrides.train,
            val: overrides.val,
            test: overrides.test,
        }
    }

    /// Whether a validation override was supplied.
    pub fn has_val_override(&self) -> bool {
        self.val_override
    }

    /// Whether a test override was supplied.
    pub fn has_test_override(&self) -> bool {
        self.test_override
    }

    /// Resolve the training loader: keep an override, otherwise (re)build
    /// from the module.
    pub fn reset_train<M>(&mut self, model: &mut M, policy: &DataLoadingPolicy) -> Result<()>
    where
        M: TrainModule<Batch = B> + ?Sized,
    {
        if !self.train_override {
            self.train = Some(model.train_dataloader()?);
        }
        if let Some(loader) = self.train.as_mut() {
            if policy.disable_shuffle && loader.shuffle() {
                tracing::debug!("overfit_pct set, disabling shuffle on the training loader");
                loader.set_shuffle(false);
            }
        }
        Ok(())
    }

    /// Resolve validation loaders.
    pub fn reset_val<M>(&mut self, model: &mut M, policy: &DataLoadingPolicy) -> Result<()>
    where
        M: TrainModule<Batch = B> + ?Sized,
    {
        if !self.val_override {
            self.val = Some(model.val_dataloaders()?);
        }
        disable_eval_shuffle(self.val.as_mut(), policy);
        Ok(())
    }

    /// Resolve test loaders.
    pub fn reset_test<M>(&mut self, model: &mut M, policy: &DataLoadingPolicy) -> Result<()>
    where
        M: TrainModule<Batch = B> + ?Sized,
    {
        if !self.test_override {
            self.test = Some(model.test_dataloaders()?);
        }
        disable_eval_shuffle(self.test.as_mut(), policy);
        Ok(())
    }
}

fn disable_eval_shuffle<B>(loaders: Option<&mut Vec<Box<dyn DataLoader<B>>>>, policy: &DataLoadingPolicy) {
    if !policy.disable_shuffle {
        return;
    }
    for loader in loaders.into_iter().flatten() {
        loader.set_shuffle(false);
    }
}

/// Natural lengths of a set of loaders.
pub fn loader_lengths<B>(loaders: &[Box<dyn DataLoader<B>>]) -> Vec<Option<usize>> {
    loaders.iter().map(|l| l.len()).collect()
}
