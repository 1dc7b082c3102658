//! Error types for kiln.

use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for kiln operations.
#[derive(Error, Debug)]
pub enum KilnError {
    /// Invalid or contradictory configuration, or a model that does not honor
    /// the training contract. Always fatal.
    #[error("Misconfiguration of `{option}`: {message}")]
    Misconfiguration {
        /// The offending option or capability.
        option: String,
        /// What was expected.
        message: String,
    },

    /// Failure raised by user code or the tensor library. Never retried.
    #[error("Runtime failure: {0}")]
    Runtime(String),

    /// User-initiated cancellation raised from inside a hook or step.
    ///
    /// The trainer turns this into the interrupted finalize path; it is never
    /// returned from `fit`.
    #[error("Run interrupted")]
    Interrupted,

    /// A spawned worker process exited abnormally.
    #[error("Worker process {rank} failed: {status}")]
    WorkerFailed {
        /// Local rank of the failed worker.
        rank: usize,
        /// Exit status description.
        status: String,
    },

    /// Checkpoint read/write errors.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Process-group errors.
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Requested capability is not provided by the module.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl KilnError {
    /// Build a misconfiguration error naming the option and its contract.
    pub fn misconfigured(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Misconfiguration {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Whether this error is the user-cancellation signal.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Whether this error is a configuration error.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, Self::Misconfiguration { .. })
    }
}
