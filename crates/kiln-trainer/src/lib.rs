//! Training-loop orchestration for kiln.
//!
//! This crate provides:
//! - The [`Trainer`] and its builder
//! - Gradient accumulation and clipping
//! - Dataloader percent checks and validation cadence
//! - Logging cadence and experiment logger plumbing
//! - Checkpointing, best-k model selection and early stopping
//! - Optimizer and scheduler normalization
//! - Execution strategies and the launchers behind them
//! - Interrupt and preemption handling
//!
//! ```ignore
//! use kiln_trainer::prelude::*;
//!
//! let mut trainer = Trainer::builder()
//!     .config(TrainerConfig { max_epochs: Some(10), ..Default::default() })
//!     .early_stopping(EarlyStopping::new("val_loss").patience(5))
//!     .build()?;
//! trainer.fit(&mut model)?;
//! ```

#![warn(missing_docs)]

pub mod accumulation;
pub mod callbacks;
pub mod checkpoint;
pub mod data_loading;
pub mod early_stopping;
mod evaluation;
pub mod launcher;
pub mod loggers;
pub mod logging;
pub mod model_checkpoint;
pub mod optimizers;
pub mod precision;
pub mod signals;
pub mod strategy;
pub mod trainer;
mod training_loop;

pub use accumulation::*;
pub use callbacks::*;
pub use checkpoint::*;
pub use data_loading::*;
pub use early_stopping::*;
pub use launcher::{worker_env, ENV_INITIAL_WEIGHTS, ENV_LAUNCH_INDEX};
pub use loggers::*;
pub use logging::*;
pub use model_checkpoint::*;
pub use optimizers::*;
pub use precision::*;
pub use signals::*;
pub use strategy::*;
pub use trainer::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::checkpoint::Checkpoint;
    pub use crate::data_loading::DataLoaders;
    pub use crate::early_stopping::EarlyStopping;
    pub use crate::loggers::{JsonlLogger, LoggerCollection};
    pub use crate::model_checkpoint::{ModelCheckpoint, MonitorMode};
    pub use crate::signals::InterruptHandle;
    pub use crate::strategy::{DeviceInventory, ExecutionStrategy, LauncherKind};
    pub use crate::trainer::{Trainer, TrainerBuilder};
    pub use kiln_core::prelude::*;
}
