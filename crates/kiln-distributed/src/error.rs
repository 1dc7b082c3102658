//! Error types for process-group operations.

use kiln_core::KilnError;
use thiserror::Error;

/// Errors that can occur while forming or using a process group.
#[derive(Error, Debug)]
pub enum DistributedError {
    // === IO & Network Errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout waiting for {0} after {1:?}")]
    ConnectionTimeout(String, std::time::Duration),

    #[error("Max retries ({max_retries}) exceeded connecting to {addr}")]
    MaxRetriesExceeded { addr: String, max_retries: u32 },

    #[error("Peer {0} closed its connection")]
    PeerLost(usize),

    // === Collective Operation Errors ===
    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Rendezvous mismatch: rank {rank} arrived at `{actual}`, expected `{expected}`")]
    RendezvousMismatch {
        rank: usize,
        expected: String,
        actual: String,
    },

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid environment variable {name}={value}: {reason}")]
    Environment {
        name: String,
        value: String,
        reason: String,
    },

    // === Process Errors ===
    #[error("Failed to spawn worker {rank}: {reason}")]
    Spawn { rank: usize, reason: String },

    #[error("Worker {rank} exited abnormally: {status}")]
    WorkerFailed { rank: usize, status: String },

    // === Shutdown Errors ===
    #[error("Operation cancelled")]
    Cancelled,
}

impl DistributedError {
    /// Check if this error is recoverable (can retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionTimeout(_, _))
    }

    /// Check if this error is fatal (cannot continue).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RendezvousMismatch { .. }
                | Self::WorkerFailed { .. }
                | Self::PeerLost(_)
                | Self::Cancelled
        )
    }
}

impl From<DistributedError> for KilnError {
    fn from(err: DistributedError) -> Self {
        match err {
            DistributedError::WorkerFailed { rank, status } => KilnError::WorkerFailed { rank, status },
            DistributedError::Environment { ref name, .. } => {
                KilnError::misconfigured(name.clone(), err.to_string())
            }
            other => KilnError::Distributed(other.to_string()),
        }
    }
}

/// Result type alias for distributed operations.
pub type DistributedResult<T> = Result<T, DistributedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_failure_maps_to_kiln_error() {
        let err: KilnError = DistributedError::WorkerFailed {
            rank: 2,
            status: "exit status: 1".into(),
        }
        .into();
        assert!(matches!(err, KilnError::WorkerFailed { rank: 2, .. }));
    }

    #[test]
    fn test_environment_error_names_variable() {
        let err: KilnError = DistributedError::Environment {
            name: "SLURM_NTASKS".into(),
            value: "four".into(),
            reason: "not an integer".into(),
        }
        .into();
        assert!(err.is_misconfiguration());
        assert!(err.to_string().contains("SLURM_NTASKS"));
    }

    #[test]
    fn test_classification() {
        assert!(DistributedError::Cancelled.is_fatal());
        assert!(DistributedError::ConnectionTimeout("x".into(), Default::default()).is_recoverable());
        assert!(!DistributedError::Protocol("x".into()).is_fatal());
    }
}
