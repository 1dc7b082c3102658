//! Optimizer normalization and learning rate scheduling.
//!
//! `configure_optimizers` may return several shapes; [`init_optimizers`]
//! normalizes all of them into one [`OptimizerBundle`] of ordered
//! optimizers, per-optimizer scheduler entries and optional frequencies.

use kiln_core::{
    KilnError, LrScheduler, Metrics, Optimizer, OptimizerConfig, OptimizerEntry, Result,
    SchedulerInterval, SchedulerSpec, WarningCache,
};
use serde_json::Value;

/// Metric plateau schedulers watch unless told otherwise.
pub const DEFAULT_SCHEDULER_MONITOR: &str = "val_loss";

/// Optimizer that does nothing, used when a module configures none.
#[derive(Debug, Default, Clone)]
pub struct NoopOptimizer {
    lr: f64,
}

impl Optimizer for NoopOptimizer {
    fn step(&mut self) -> Result<()> {
        Ok(())
    }

    fn zero_grad(&mut self) -> Result<()> {
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn load_state_dict(&mut self, _state: &Value) -> Result<()> {
        Ok(())
    }
}

/// A scheduler with resolved stepping configuration.
pub struct LrSchedulerEntry {
    /// The scheduler.
    pub scheduler: Box<dyn LrScheduler>,
    /// Optimizer it drives.
    pub optimizer_idx: usize,
    /// When it steps.
    pub interval: SchedulerInterval,
    /// Step every N intervals.
    pub frequency: usize,
    /// Whether it needs a monitored metric.
    pub reduce_on_plateau: bool,
    /// Metric watched by plateau schedulers.
    pub monitor: String,
}

impl LrSchedulerEntry {
    fn from_spec(spec: SchedulerSpec, optimizer_idx: usize) -> Self {
        let reduce_on_plateau = spec.scheduler.is_plateau();
        Self {
            reduce_on_plateau,
            optimizer_idx,
            interval: spec.interval.unwrap_or_default(),
            frequency: spec.frequency.unwrap_or(1).max(1),
            monitor: spec
                .monitor
                .unwrap_or_else(|| DEFAULT_SCHEDULER_MONITOR.to_string()),
            scheduler: spec.scheduler,
        }
    }
}

/// Normalized optimizers of one run.
pub struct OptimizerBundle {
    /// Optimizers, in the order the module returned them.
    pub optimizers: Vec<Box<dyn Optimizer>>,
    /// Scheduler entries; absent schedulers are simply not listed.
    pub lr_schedulers: Vec<LrSchedulerEntry>,
    /// Consecutive batches per optimizer, empty when not cycling.
    pub frequencies: Vec<usize>,
}

impl std::fmt::Debug for OptimizerBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerBundle")
            .field("optimizers", &self.optimizers.len())
            .field("lr_schedulers", &self.lr_schedulers.len())
            .field("frequencies", &self.frequencies)
            .finish()
    }
}

/// Normalize whatever `configure_optimizers` returned.
pub fn init_optimizers(config: OptimizerConfig, warnings: &WarningCache) -> Result<OptimizerBundle> {
    match config {
        OptimizerConfig::None => {
            warnings.warn("configure_optimizers returned None, this fit will run with no optimizer");
            Ok(OptimizerBundle {
                optimizers: vec![Box::new(NoopOptimizer::default())],
                lr_schedulers: Vec::new(),
                frequencies: Vec::new(),
            })
        }
        OptimizerConfig::Single(optimizer) => Ok(OptimizerBundle {
            optimizers: vec![optimizer],
            lr_schedulers: Vec::new(),
            frequencies: Vec::new(),
        }),
        OptimizerConfig::Many(optimizers) => Ok(OptimizerBundle {
            optimizers,
            lr_schedulers: Vec::new(),
            frequencies: Vec::new(),
        }),
        OptimizerConfig::WithSchedulers(optimizers, schedulers) => {
            if schedulers.len() > optimizers.len() {
                return Err(KilnError::misconfigured(
                    "configure_optimizers",
                    format!(
                        "{} schedulers were returned for {} optimizers",
                        schedulers.len(),
                        optimizers.len()
                    ),
                ));
            }
            let lr_schedulers = schedulers
                .into_iter()
                .enumerate()
                .map(|(idx, spec)| LrSchedulerEntry::from_spec(spec, idx))
                .collect();
            Ok(OptimizerBundle {
                optimizers,
                lr_schedulers,
                frequencies: Vec::new(),
            })
        }
        OptimizerConfig::Entry(entry) => from_entries(vec![entry]),
        OptimizerConfig::Entries(entries) => from_entries(entries),
    }
}

fn from_entries(entries: Vec<OptimizerEntry>) -> Result<OptimizerBundle> {
    let with_frequency = entries.iter().filter(|e| e.frequency.is_some()).count();
    if with_frequency != 0 && with_frequency != entries.len() {
        return Err(KilnError::misconfigured(
            "configure_optimizers",
            "A frequency must be given to each optimizer.",
        ));
    }
    if entries.iter().any(|e| e.frequency == Some(0)) {
        return Err(KilnError::misconfigured(
            "configure_optimizers",
            "optimizer frequencies must be at least 1",
        ));
    }

    let mut bundle = OptimizerBundle {
        optimizers: Vec::with_capacity(entries.len()),
        lr_schedulers: Vec::new(),
        frequencies: Vec::new(),
    };
    for (idx, entry) in entries.into_iter().enumerate() {
        bundle.optimizers.push(entry.optimizer);
        if let Some(spec) = entry.lr_scheduler {
            bundle.lr_schedulers.push(LrSchedulerEntry::from_spec(spec, idx));
        }
        if let Some(freq) = entry.frequency {
            bundle.frequencies.push(freq);
        }
    }
    Ok(bundle)
}

impl OptimizerBundle {
    /// No optimizers at all, as used by evaluation-only runs.
    pub fn empty() -> Self {
        Self {
            optimizers: Vec::new(),
            lr_schedulers: Vec::new(),
            frequencies: Vec::new(),
        }
    }

    /// Whether no optimizer is configured.
    pub fn is_empty(&self) -> bool {
        self.optimizers.is_empty()
    }

    /// Indices of the optimizers used for the batch at `total_batch_idx`.
    ///
    /// With frequencies, optimizers take turns for that many consecutive
    /// batches each; without, every optimizer runs on every batch.
    pub fn optimizer_iteration(&self, total_batch_idx: usize) -> Vec<usize> {
        if self.frequencies.is_empty() {
            return (0..self.optimizers.len()).collect();
        }
        let cycle: usize = self.frequencies.iter().sum();
        let place = total_batch_idx % cycle.max(1);
        let mut cumulative = 0;
        for (idx, freq) in self.frequencies.iter().enumerate() {
            cumulative += freq;
            if cumulative > place {
                return vec![idx];
            }
        }
        vec![0]
    }

    /// Step the schedulers of `interval` that are due.
    ///
    /// `batch_idx` and `epoch` are the just-finished batch and epoch.
    pub fn update_learning_rates(
        &mut self,
        interval: SchedulerInterval,
        batch_idx: usize,
        epoch: usize,
        metrics: &Metrics,
    ) -> Result<()> {
        let idx = match interval {
            SchedulerInterval::Step => batch_idx + 1,
            SchedulerInterval::Epoch => epoch + 1,
        };
        for entry in self.lr_schedulers.iter_mut().filter(|e| e.interval == interval) {
            if idx % entry.frequency != 0 {
                continue;
            }
            let metric = if entry.reduce_on_plateau {
                match metrics.get(&entry.monitor) {
                    Some(value) => Some(*value),
                    None => {
                        let available = metrics.keys().cloned().collect::<Vec<_>>().join(",");
                        return Err(KilnError::misconfigured(
                            "lr_scheduler",
                            format!(
                                "ReduceLROnPlateau conditioned on metric {} which is not available. \
                                 Available metrics are: {}. Condition can be set using `monitor` \
                                 key in lr scheduler dict",
                                entry.monitor, available
                            ),
                        ));
                    }
                }
            } else {
                None
            };
            let lr = entry.scheduler.step(metric)?;
            if let Some(optimizer) = self.optimizers.get_mut(entry.optimizer_idx) {
                optimizer.set_learning_rate(lr);
            }
        }
        Ok(())
    }

    /// Optimizer states, in order.
    pub fn optimizer_states(&self) -> Result<Vec<Value>> {
        self.optimizers.iter().map(|o| o.state_dict()).collect()
    }

    /// Scheduler states, in order.
    pub fn scheduler_states(&self) -> Result<Vec<Value>> {
        self.lr_schedulers
            .iter()
            .map(|s| s.scheduler.state_dict())
            .collect()
    }

    /// Restore optimizer and scheduler states saved by the same
    /// configuration.
    pub fn load_states(&mut self, optimizers: &[Value], schedulers: &[Value]) -> Result<()> {
        if optimizers.len() != self.optimizers.len() {
            return Err(KilnError::Checkpoint(format!(
                "checkpoint has {} optimizer states but {} optimizers are configured",
                optimizers.len(),
                self.optimizers.len()
            )));
        }
        if schedulers.len() != self.lr_schedulers.len() {
            return Err(KilnError::Checkpoint(format!(
                "checkpoint has {} scheduler states but {} schedulers are configured",
                schedulers.len(),
                self.lr_schedulers.len()
            )));
        }
        for (optimizer, state) in self.optimizers.iter_mut().zip(optimizers) {
            optimizer.load_state_dict(state)?;
        }
        for (entry, state) in self.lr_schedulers.iter_mut().zip(schedulers) {
            entry.scheduler.load_state_dict(state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Opt {
        lr: f64,
        id: usize,
    }

    impl Optimizer for Opt {
        fn step(&mut self) -> Result<()> {
            Ok(())
        }
        fn zero_grad(&mut self) -> Result<()> {
            Ok(())
        }
        fn learning_rate(&self) -> f64 {
            self.lr
        }
        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }
        fn state_dict(&self) -> Result<Value> {
            Ok(serde_json::json!({"id": self.id, "lr": self.lr}))
        }
        fn load_state_dict(&mut self, state: &Value) -> Result<()> {
            self.lr = state["lr"].as_f64().unwrap_or_default();
            Ok(())
        }
    }

    fn opt(id: usize) -> Box<dyn Optimizer> {
        Box::new(Opt { lr: 1.0, id })
    }

    struct Halve {
        lr: f64,
        plateau: bool,
        seen: Arc<Mutex<Vec<Option<f64>>>>,
    }

    impl LrScheduler for Halve {
        fn step(&mut self, metric: Option<f64>) -> Result<f64> {
            self.seen.lock().push(metric);
            self.lr /= 2.0;
            Ok(self.lr)
        }
        fn is_plateau(&self) -> bool {
            self.plateau
        }
        fn state_dict(&self) -> Result<Value> {
            Ok(serde_json::json!({"lr": self.lr}))
        }
        fn load_state_dict(&mut self, state: &Value) -> Result<()> {
            self.lr = state["lr"].as_f64().unwrap_or_default();
            Ok(())
        }
    }

    fn halve(plateau: bool) -> (Box<dyn LrScheduler>, Arc<Mutex<Vec<Option<f64>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Halve {
                lr: 1.0,
                plateau,
                seen: seen.clone(),
            }),
            seen,
        )
    }

    #[test]
    fn test_single_optimizer_shapes() {
        let warnings = WarningCache::new();
        let bundle = init_optimizers(OptimizerConfig::Single(opt(0)), &warnings).unwrap();
        assert_eq!(bundle.optimizers.len(), 1);
        assert_eq!(bundle.lr_schedulers.len(), 0);
        assert_eq!(bundle.frequencies.len(), 0);
    }

    #[test]
    fn test_many_preserves_order() {
        let warnings = WarningCache::new();
        let bundle = init_optimizers(OptimizerConfig::Many(vec![opt(7), opt(9)]), &warnings).unwrap();
        let ids: Vec<_> = bundle
            .optimizers
            .iter()
            .map(|o| o.state_dict().unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![7, 9]);
        assert_eq!(bundle.optimizer_iteration(5), vec![0, 1]);
    }

    #[test]
    fn test_entries_with_frequencies() {
        let warnings = WarningCache::new();
        let (s1, _) = halve(false);
        let (s2, _) = halve(false);
        let entries = vec![
            OptimizerEntry::new(opt(0))
                .with_scheduler(SchedulerSpec::new(s1))
                .with_frequency(2),
            OptimizerEntry::new(opt(1))
                .with_scheduler(SchedulerSpec::new(s2))
                .with_frequency(3),
        ];
        let bundle = init_optimizers(OptimizerConfig::Entries(entries), &warnings).unwrap();
        assert_eq!(bundle.frequencies, vec![2, 3]);
        let picks: Vec<usize> = (0..10).map(|i| bundle.optimizer_iteration(i)[0]).collect();
        assert_eq!(picks, vec![0, 0, 1, 1, 1, 0, 0, 1, 1, 1]);
        let entry = &bundle.lr_schedulers[1];
        assert_eq!(entry.optimizer_idx, 1);
        assert_eq!(entry.interval, SchedulerInterval::Epoch);
        assert_eq!(entry.frequency, 1);
        assert_eq!(entry.monitor, "val_loss");
    }

    #[test]
    fn test_partial_frequencies_rejected() {
        let warnings = WarningCache::new();
        let entries = vec![
            OptimizerEntry::new(opt(0)).with_frequency(2),
            OptimizerEntry::new(opt(1)),
        ];
        let err = init_optimizers(OptimizerConfig::Entries(entries), &warnings).unwrap_err();
        assert!(err.to_string().contains("A frequency must be given to each optimizer."));
    }

    #[test]
    fn test_none_uses_noop_and_warns() {
        let warnings = WarningCache::new();
        let bundle = init_optimizers(OptimizerConfig::None, &warnings).unwrap();
        assert_eq!(bundle.optimizers.len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_scheduler_frequency_and_interval() {
        let warnings = WarningCache::new();
        let (sched, seen) = halve(false);
        let spec = SchedulerSpec::new(sched)
            .interval(SchedulerInterval::Step)
            .frequency(2);
        let mut bundle =
            init_optimizers(OptimizerConfig::WithSchedulers(vec![opt(0)], vec![spec]), &warnings).unwrap();
        for batch_idx in 0..4 {
            bundle
                .update_learning_rates(SchedulerInterval::Step, batch_idx, 0, &Metrics::new())
                .unwrap();
        }
        bundle
            .update_learning_rates(SchedulerInterval::Epoch, 3, 0, &Metrics::new())
            .unwrap();
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(bundle.optimizers[0].learning_rate(), 0.25);
    }

    #[test]
    fn test_plateau_needs_metric() {
        let warnings = WarningCache::new();
        let (sched, seen) = halve(true);
        let mut bundle = init_optimizers(
            OptimizerConfig::Entry(OptimizerEntry::new(opt(0)).with_scheduler(SchedulerSpec::new(sched))),
            &warnings,
        )
        .unwrap();
        let err = bundle
            .update_learning_rates(
                SchedulerInterval::Epoch,
                0,
                0,
                &Metrics::from([("loss".to_string(), 1.0)]),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Available metrics are: loss"));

        bundle
            .update_learning_rates(
                SchedulerInterval::Epoch,
                0,
                0,
                &Metrics::from([("val_loss".to_string(), 0.3)]),
            )
            .unwrap();
        assert_eq!(*seen.lock(), vec![Some(0.3)]);
    }

    #[test]
    fn test_state_roundtrip() {
        let warnings = WarningCache::new();
        let (sched, _) = halve(false);
        let mut bundle = init_optimizers(
            OptimizerConfig::WithSchedulers(vec![opt(0)], vec![SchedulerSpec::new(sched)]),
            &warnings,
        )
        .unwrap();
        bundle
            .update_learning_rates(SchedulerInterval::Epoch, 0, 0, &Metrics::new())
            .unwrap();
        let opt_states = bundle.optimizer_states().unwrap();
        let sched_states = bundle.scheduler_states().unwrap();

        let (fresh_sched, _) = halve(false);
        let mut fresh = init_optimizers(
            OptimizerConfig::WithSchedulers(vec![opt(0)], vec![SchedulerSpec::new(fresh_sched)]),
            &warnings,
        )
        .unwrap();
        fresh.load_states(&opt_states, &sched_states).unwrap();
        assert_eq!(fresh.optimizers[0].learning_rate(), 0.5);
        assert_eq!(fresh.scheduler_states().unwrap(), sched_states);
    }

    #[test]
    fn test_scheduler_count_mismatch_rejected() {
        let warnings = WarningCache::new();
        let (sched, _) = halve(false);
        let mut bundle = init_optimizers(
            OptimizerConfig::WithSchedulers(vec![opt(0)], vec![SchedulerSpec::new(sched)]),
            &warnings,
        )
        .unwrap();
        let opt_states = bundle.optimizer_states().unwrap();

        let err = bundle.load_states(&opt_states, &[]).unwrap_err();
        assert!(matches!(err, KilnError::Checkpoint(ref msg) if msg.contains("scheduler states")));
        // nothing is restored when the counts disagree
        assert_eq!(bundle.optimizers[0].learning_rate(), 1.0);
    }
}
