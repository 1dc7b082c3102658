//! Early stopping on a monitored metric.

use crate::checkpoint::EarlyStoppingState;
use crate::model_checkpoint::MonitorMode;
use kiln_core::{KilnError, Metrics, Result, WarningCache};

/// Stops training once the monitored metric has not improved for
/// `patience` consecutive checks.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: String,
    min_delta: f64,
    patience: usize,
    mode: MonitorMode,
    strict: bool,
    verbose: bool,
    wait: usize,
    best: f64,
    stopped_epoch: Option<usize>,
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new("val_loss")
    }
}

impl EarlyStopping {
    /// Monitor `monitor` with patience 3 and no minimum delta.
    pub fn new(monitor: impl Into<String>) -> Self {
        let monitor = monitor.into();
        let mode = MonitorMode::Auto.resolve(&monitor);
        Self {
            monitor,
            min_delta: 0.0,
            patience: 3,
            mode,
            strict: true,
            verbose: false,
            wait: 0,
            best: mode.worst(),
            stopped_epoch: None,
        }
    }

    /// Minimum change that counts as an improvement.
    pub fn min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    /// Checks tolerated without improvement.
    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    /// Comparison mode.
    pub fn mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode.resolve(&self.monitor);
        self.best = self.mode.worst();
        self
    }

    /// Whether a missing metric is an error.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Log every check.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Monitored metric.
    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    /// Checks since the last improvement.
    pub fn wait(&self) -> usize {
        self.wait
    }

    /// Epoch at which training was stopped.
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// Counters for a checkpoint.
    pub fn state(&self) -> EarlyStoppingState {
        EarlyStoppingState {
            wait: self.wait,
            patience: self.patience,
            best: self.best.is_finite().then_some(self.best),
        }
    }

    /// Restore counters from a checkpoint.
    pub fn load_state(&mut self, state: &EarlyStoppingState) {
        self.wait = state.wait;
        self.patience = state.patience;
        self.best = state.best.unwrap_or(self.mode.worst());
    }

    /// Whether the monitored metric is available.
    ///
    /// Strict mode fails on absence; lenient mode warns once.
    pub fn check_metrics(&self, metrics: &Metrics, warnings: &WarningCache) -> Result<bool> {
        if metrics.contains_key(&self.monitor) {
            return Ok(true);
        }
        let available = metrics.keys().cloned().collect::<Vec<_>>().join(",");
        let message = format!(
            "Early stopping conditioned on metric `{}` which is not available. Available metrics are: {}",
            self.monitor, available
        );
        if self.strict {
            return Err(KilnError::misconfigured("early_stop_callback", message));
        }
        warnings.warn(message);
        Ok(false)
    }

    /// Run one check. Returns whether training should stop.
    pub fn on_epoch_end(&mut self, epoch: usize, metrics: &Metrics, warnings: &WarningCache) -> Result<bool> {
        if !self.check_metrics(metrics, warnings)? {
            return Ok(false);
        }
        let Some(current) = metrics.get(&self.monitor).copied() else {
            return Ok(false);
        };

        let shifted = match self.mode {
            MonitorMode::Max => current - self.min_delta,
            _ => current + self.min_delta,
        };
        if self.mode.improves(shifted, self.best) {
            self.best = current;
            self.wait = 0;
        } else {
            self.wait += 1;
            if self.wait >= self.patience {
                self.stopped_epoch = Some(epoch);
                if self.verbose {
                    tracing::info!(epoch, monitor = %self.monitor, "Early stopping");
                }
                return Ok(true);
            }
        }
        if self.verbose {
            tracing::debug!(epoch, current, best = self.best, wait = self.wait, "Early stopping check");
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(v: f64) -> Metrics {
        Metrics::from([("val_loss".to_string(), v)])
    }

    #[test]
    fn test_stops_exactly_after_patience() {
        let warnings = WarningCache::new();
        let mut es = EarlyStopping::new("val_loss").patience(3);
        let values = [1.0, 0.8, 0.6, 0.7, 0.7, 0.9, 0.5];
        let mut stopped_at = None;
        for (epoch, v) in values.iter().enumerate() {
            if es.on_epoch_end(epoch, &m(*v), &warnings).unwrap() {
                stopped_at = Some(epoch);
                break;
            }
        }
        assert_eq!(stopped_at, Some(5));
        assert_eq!(es.stopped_epoch(), Some(5));
    }

    #[test]
    fn test_min_delta() {
        let warnings = WarningCache::new();
        let mut es = EarlyStopping::new("val_loss").patience(1).min_delta(0.1);
        assert!(!es.on_epoch_end(0, &m(1.0), &warnings).unwrap());
        assert!(es.on_epoch_end(1, &m(0.95), &warnings).unwrap());
    }

    #[test]
    fn test_strict_missing_metric_fails() {
        let warnings = WarningCache::new();
        let es = EarlyStopping::new("val_loss");
        let err = es
            .check_metrics(&Metrics::from([("loss".to_string(), 1.0)]), &warnings)
            .unwrap_err();
        assert!(err.is_misconfiguration());
        assert!(err.to_string().contains("Available metrics are: loss"));
    }

    #[test]
    fn test_lenient_missing_metric_warns_once() {
        let warnings = WarningCache::new();
        let mut es = EarlyStopping::new("val_loss").strict(false).patience(1);
        for epoch in 0..5 {
            assert!(!es.on_epoch_end(epoch, &Metrics::new(), &warnings).unwrap());
        }
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_max_mode_for_accuracy() {
        let warnings = WarningCache::new();
        let mut es = EarlyStopping::new("val_acc").patience(1);
        let acc = |v: f64| Metrics::from([("val_acc".to_string(), v)]);
        assert!(!es.on_epoch_end(0, &acc(0.5), &warnings).unwrap());
        assert!(!es.on_epoch_end(1, &acc(0.6), &warnings).unwrap());
        assert!(es.on_epoch_end(2, &acc(0.55), &warnings).unwrap());
    }

    #[test]
    fn test_state_roundtrip() {
        let warnings = WarningCache::new();
        let mut es = EarlyStopping::new("val_loss");
        es.on_epoch_end(0, &m(1.0), &warnings).unwrap();
        es.on_epoch_end(1, &m(2.0), &warnings).unwrap();
        let state = es.state();
        let mut restored = EarlyStopping::new("val_loss");
        restored.load_state(&state);
        assert_eq!(restored.wait(), 1);
        assert_eq!(restored.state(), state);
    }
}
