//! Logging cadence and the rank-zero logger connector.
//!
//! Metrics are aggregated every `row_log_interval` batches into a buffer
//! and only handed to the experiment logger every `log_save_interval`
//! batches. Processes other than rank zero never touch the logger.

use kiln_core::{Logger, Metrics, Result, RunStatus};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;

/// When to aggregate and when to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingCadence {
    row_log_interval: usize,
    log_save_interval: usize,
}

impl LoggingCadence {
    /// Create from the two intervals.
    pub fn new(row_log_interval: usize, log_save_interval: usize) -> Self {
        Self {
            row_log_interval: row_log_interval.max(1),
            log_save_interval: log_save_interval.max(1),
        }
    }

    /// Whether metrics of batch `batch_idx` are aggregated.
    pub fn should_log_row(&self, batch_idx: usize) -> bool {
        batch_idx % self.row_log_interval == 0
    }

    /// Whether buffered metrics are flushed after batch `batch_idx`.
    pub fn should_flush(&self, batch_idx: usize) -> bool {
        (batch_idx + 1) % self.log_save_interval == 0
    }
}

/// Add `epoch` and resolve the step a row is logged at.
///
/// An explicit `step` metric overrides `global_step` and is removed from
/// the row.
pub fn prepare_metrics(metrics: &Metrics, epoch: usize, global_step: usize) -> (Metrics, usize) {
    let mut row = metrics.clone();
    let step = match row.remove("step") {
        Some(step) if step >= 0.0 => step as usize,
        _ => global_step,
    };
    row.insert("epoch".to_string(), epoch as f64);
    (row, step)
}

/// Gate between the trainer and the experiment logger.
pub struct LoggerConnector {
    logger: Option<Box<dyn Logger>>,
    rank_zero: bool,
    pending: VecDeque<(Metrics, usize)>,
}

impl LoggerConnector {
    /// Wrap an optional logger.
    pub fn new(logger: Option<Box<dyn Logger>>) -> Self {
        Self {
            logger,
            rank_zero: true,
            pending: VecDeque::new(),
        }
    }

    /// Set whether this process is rank zero.
    pub fn set_rank_zero(&mut self, rank_zero: bool) {
        self.rank_zero = rank_zero;
    }

    /// Whether a logger is attached.
    pub fn is_enabled(&self) -> bool {
        self.logger.is_some()
    }

    fn active(&mut self) -> Option<&mut Box<dyn Logger>> {
        if self.rank_zero {
            self.logger.as_mut()
        } else {
            None
        }
    }

    /// Experiment name, if a logger is attached.
    pub fn name(&self) -> Option<String> {
        self.logger.as_ref().map(|l| l.name())
    }

    /// Experiment version, if a logger is attached.
    pub fn version(&self) -> Option<String> {
        self.logger.as_ref().map(|l| l.version())
    }

    /// Logger output directory.
    pub fn save_dir(&self) -> Option<PathBuf> {
        self.logger.as_ref().and_then(|l| l.save_dir())
    }

    /// Record hyperparameters.
    pub fn log_hyperparams(&mut self, params: &Value) -> Result<()> {
        match self.active() {
            Some(logger) => logger.log_hyperparams(params),
            None => Ok(()),
        }
    }

    /// Buffer a row until the next flush.
    pub fn record(&mut self, metrics: Metrics, step: usize) {
        if self.rank_zero && self.logger.is_some() && !metrics.is_empty() {
            self.pending.push_back((metrics, step));
        }
    }

    /// Number of buffered rows.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Hand buffered rows to the logger and persist them.
    ///
    /// A row stays buffered until the logger accepts it, so a failed write
    /// keeps it and every row after it for the next flush.
    pub fn flush(&mut self) -> Result<()> {
        let logger = match self.logger.as_mut() {
            Some(logger) if self.rank_zero => logger,
            _ => {
                self.pending.clear();
                return Ok(());
            }
        };
        while let Some((metrics, step)) = self.pending.front() {
            logger.log_metrics(metrics, *step)?;
            self.pending.pop_front();
        }
        logger.save()
    }

    /// Flush and finish the experiment.
    pub fn finalize(&mut self, status: RunStatus) -> Result<()> {
        self.flush()?;
        match self.active() {
            Some(logger) => logger.finalize(status),
            None => Ok(()),
        }
    }
}
