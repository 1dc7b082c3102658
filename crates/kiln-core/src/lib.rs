//! Core types, traits, and configuration for kiln.
//!
//! This crate provides the foundational abstractions used throughout the kiln
//! workspace, including:
//!
//! - The collaborator traits the trainer orchestrates: modules, loaders,
//!   optimizers, schedulers, callbacks and experiment loggers
//! - `TrainerConfig` and the deprecated option alias table
//! - The trainer state record and lifecycle stages
//! - Error handling and de-duplicated warnings

#![warn(missing_docs)]

mod config;
pub mod deprecated;
mod error;
mod state;
mod traits;
mod types;
mod warnings;

pub use config::*;
pub use error::*;
pub use state::*;
pub use traits::*;
pub use types::*;
pub use warnings::{CompatibilityWarning, WarningCache};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{KilnError, Result};
    pub use crate::state::{Stage, TrainerState};
    pub use crate::traits::*;
    pub use crate::types::*;
    pub use crate::warnings::{CompatibilityWarning, WarningCache};
}
