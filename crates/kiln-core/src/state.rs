//! Mutable run-time record of a trainer.

use crate::error::{KilnError, Result};
use crate::types::{Metrics, RunningMean};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Window of optimizer-step losses averaged into the running loss.
pub const RUNNING_LOSS_WINDOW: usize = 20;

/// Lifecycle stage of a trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Building configuration and policies.
    #[default]
    Initializing,
    /// Binding a module and its loaders.
    AttachingModel,
    /// Pre-training validation pass.
    SanityChecking,
    /// Inside the epoch loop.
    Training,
    /// Validation interleaved with training.
    Validating,
    /// Standalone evaluation in test mode.
    Testing,
    /// Run complete, loggers flushed.
    Finalized,
}

impl Stage {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Initializing, AttachingModel)
                | (AttachingModel, SanityChecking)
                | (AttachingModel, Training)
                | (AttachingModel, Testing)
                | (AttachingModel, Finalized)
                | (SanityChecking, Training)
                | (SanityChecking, Finalized)
                | (Training, Validating)
                | (Training, Finalized)
                | (Validating, Training)
                | (Validating, Finalized)
                | (Testing, Finalized)
                | (Finalized, AttachingModel)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::AttachingModel => "attaching_model",
            Self::SanityChecking => "sanity_checking",
            Self::Training => "training",
            Self::Validating => "validating",
            Self::Testing => "testing",
            Self::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Everything that changes while a trainer runs.
///
/// Owned by the trainer; callbacks only ever see a shared reference.
#[derive(Debug, Clone)]
pub struct TrainerState {
    /// Lifecycle stage.
    pub stage: Stage,
    /// Current epoch (0-based).
    pub current_epoch: usize,
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Batch index within the current epoch.
    pub batch_idx: usize,
    /// Batches consumed across all epochs.
    pub total_batch_idx: usize,
    /// Mean of the most recent optimizer-step losses.
    pub running_loss: RunningMean,
    /// Latest values of every metric produced so far.
    pub callback_metrics: Metrics,
    /// Metrics intended for progress reporting.
    pub progress_bar_metrics: Metrics,
    /// Set when a run was cancelled.
    pub interrupted: bool,
    /// Set while running in test mode.
    pub testing: bool,
    /// Set when early stopping requested the run to end.
    pub should_stop: bool,
    /// Training batches per epoch, `None` for loaders without a length.
    pub num_training_batches: Option<usize>,
    /// Validation batches per loader.
    pub num_val_batches: Vec<usize>,
    /// Test batches per loader.
    pub num_test_batches: Vec<usize>,
    /// Validate after this many training batches, `None` for end of epoch
    /// on loaders without a length.
    pub val_check_batch: Option<usize>,
    /// Whether validation is skipped entirely.
    pub disable_validation: bool,
    /// Accumulation factor in effect for the current epoch.
    pub accumulate_grad_batches: usize,
    /// Rank of this process.
    pub proc_rank: usize,
    /// Total processes.
    pub world_size: usize,
}

impl Default for TrainerState {
    fn default() -> Self {
        Self {
            stage: Stage::Initializing,
            current_epoch: 0,
            global_step: 0,
            batch_idx: 0,
            total_batch_idx: 0,
            running_loss: RunningMean::new(RUNNING_LOSS_WINDOW),
            callback_metrics: Metrics::new(),
            progress_bar_metrics: Metrics::new(),
            interrupted: false,
            testing: false,
            should_stop: false,
            num_training_batches: None,
            num_val_batches: Vec::new(),
            num_test_batches: Vec::new(),
            val_check_batch: None,
            disable_validation: false,
            accumulate_grad_batches: 1,
            proc_rank: 0,
            world_size: 1,
        }
    }
}

impl TrainerState {
    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: Stage) -> Result<()> {
        if !self.stage.can_transition_to(next) {
            return Err(KilnError::Runtime(format!(
                "illegal trainer transition {} -> {}",
                self.stage, next
            )));
        }
        tracing::debug!(from = %self.stage, to = %next, "trainer stage");
        self.stage = next;
        Ok(())
    }

    /// Whether this process writes checkpoints and logs.
    pub fn is_rank_zero(&self) -> bool {
        self.proc_rank == 0
    }

    /// Clear per-run progress before a new fit.
    pub fn reset_progress(&mut self) {
        self.current_epoch = 0;
        self.global_step = 0;
        self.batch_idx = 0;
        self.total_batch_idx = 0;
        self.running_loss.reset();
        self.callback_metrics.clear();
        self.progress_bar_metrics.clear();
        self.interrupted = false;
        self.should_stop = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = TrainerState::default();
        state.transition(Stage::AttachingModel).unwrap();
        state.transition(Stage::SanityChecking).unwrap();
        state.transition(Stage::Training).unwrap();
        state.transition(Stage::Validating).unwrap();
        state.transition(Stage::Training).unwrap();
        state.transition(Stage::Finalized).unwrap();
        state.transition(Stage::AttachingModel).unwrap();
        state.transition(Stage::Testing).unwrap();
        state.transition(Stage::Finalized).unwrap();
    }

    #[test]
    fn test_illegal_transition() {
        let mut state = TrainerState::default();
        assert!(state.transition(Stage::Training).is_err());
        assert_eq!(state.stage, Stage::Initializing);
    }
}
