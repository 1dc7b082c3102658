//! Callback registry and built-in callbacks.
//!
//! - [`CallbackRegistry`] - ordered fan-out of lifecycle hooks
//! - [`ProgressCallback`] - periodic progress lines through `tracing`

use kiln_core::{Callback, TrainerState};
use std::path::Path;

/// Registered callbacks, invoked in registration order.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Vec<Box<dyn Callback>>,
}

macro_rules! forward {
    ($($(#[$doc:meta])* $hook:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $hook(&mut self, state: &TrainerState) {
                for callback in &mut self.callbacks {
                    callback.$hook(state);
                }
            }
        )*
    };
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback.
    pub fn push(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Before any trainer state is built.
    pub fn on_init_start(&mut self) {
        for callback in &mut self.callbacks {
            callback.on_init_start();
        }
    }

    /// A checkpoint was written.
    pub fn on_save(&mut self, path: &Path) {
        for callback in &mut self.callbacks {
            callback.on_save(path);
        }
    }

    forward! {
        /// Trainer state fully built.
        on_init_end;
        /// Training begins.
        on_train_start;
        /// Training ends.
        on_train_end;
        /// Epoch begins.
        on_epoch_start;
        /// Epoch ends.
        on_epoch_end;
        /// Batch begins.
        on_batch_start;
        /// Batch ends.
        on_batch_end;
        /// Validation begins.
        on_validation_start;
        /// Validation ends.
        on_validation_end;
        /// Test begins.
        on_test_start;
        /// Test ends.
        on_test_end;
    }
}

/// Logs progress every `refresh_rate` batches.
pub struct ProgressCallback {
    refresh_rate: usize,
}

impl ProgressCallback {
    /// Create a new progress callback. A rate of 0 disables output.
    pub fn new(refresh_rate: usize) -> Self {
        Self { refresh_rate }
    }
}

impl Callback for ProgressCallback {
    fn on_train_start(&mut self, state: &TrainerState) {
        if self.refresh_rate > 0 {
            tracing::info!(
                batches = ?state.num_training_batches,
                world_size = state.world_size,
                "Training started"
            );
        }
    }

    fn on_batch_end(&mut self, state: &TrainerState) {
        if self.refresh_rate == 0 || (state.batch_idx + 1) % self.refresh_rate != 0 {
            return;
        }
        let loss = state.running_loss.mean().unwrap_or(f64::NAN);
        tracing::info!(
            epoch = state.current_epoch,
            batch = state.batch_idx,
            step = state.global_step,
            loss = loss,
            metrics = ?state.progress_bar_metrics,
            "Training step"
        );
    }

    fn on_epoch_end(&mut self, state: &TrainerState) {
        if self.refresh_rate > 0 {
            tracing::info!(
                epoch = state.current_epoch,
                step = state.global_step,
                metrics = ?state.callback_metrics,
                "Epoch complete"
            );
        }
    }

    fn on_validation_end(&mut self, state: &TrainerState) {
        if self.refresh_rate > 0 && !state.testing {
            tracing::info!(metrics = ?state.progress_bar_metrics, "Validation complete");
        }
    }

    fn on_train_end(&mut self, state: &TrainerState) {
        if self.refresh_rate > 0 {
            tracing::info!(
                step = state.global_step,
                interrupted = state.interrupted,
                "Training complete"
            );
        }
    }
}
