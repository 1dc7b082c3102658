//! Cooperative interruption and cluster preemption.
//!
//! Signals only flip flags. The training loop polls them at batch and epoch
//! boundaries, so a step in flight always completes.
//!
//! - SIGINT / SIGTERM: interrupt. A second SIGINT exits immediately.
//! - SIGUSR1 (unix): preemption, handled as checkpoint + requeue + interrupt.

use kiln_core::{KilnError, Result};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Shared interrupt and preemption flags.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    interrupted: Arc<AtomicBool>,
    preempted: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Fresh handle with both flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide handle driven by OS signals.
    ///
    /// The first call installs the handlers on a background thread; later
    /// calls return the same handle.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<InterruptHandle> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let handle = InterruptHandle::new();
                install_signal_handlers(handle.clone());
                handle
            })
            .clone()
    }

    /// Request a graceful stop.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Request a preemption checkpoint followed by a graceful stop.
    pub fn preempt(&self) {
        self.preempted.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Whether preemption was requested.
    pub fn is_preempted(&self) -> bool {
        self.preempted.load(Ordering::SeqCst)
    }

    /// Consume a pending preemption request.
    pub fn take_preempted(&self) -> bool {
        self.preempted.swap(false, Ordering::SeqCst)
    }

    /// Clear both flags before a new run.
    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
        self.preempted.store(false, Ordering::SeqCst);
    }
}

fn install_signal_handlers(handle: InterruptHandle) {
    let spawned = std::thread::Builder::new()
        .name("kiln-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("Failed to start signal runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(listen(handle));
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn signal thread: {}", e);
    }
}

#[cfg(unix)]
async fn listen(handle: InterruptHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to register SIGINT handler: {}", e);
            return;
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to register SIGUSR1 handler: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping after the current batch");
                handle.interrupt();
            }
            _ = sigint.recv() => {
                if handle.is_interrupted() {
                    warn!("Received second SIGINT, exiting");
                    std::process::exit(130);
                }
                info!("Received SIGINT, stopping after the current batch");
                handle.interrupt();
            }
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, saving a preemption checkpoint");
                handle.preempt();
            }
        }
    }
}

#[cfg(not(unix))]
async fn listen(handle: InterruptHandle) {
    loop {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                if handle.is_interrupted() {
                    warn!("Received second Ctrl+C, exiting");
                    std::process::exit(130);
                }
                info!("Received Ctrl+C, stopping after the current batch");
                handle.interrupt();
            }
            Err(e) => {
                warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
        }
    }
}

/// Ask SLURM to requeue `job_id`.
pub fn requeue_job(job_id: &str) -> Result<()> {
    info!(job_id, "requeueing job");
    let status = Command::new("scontrol")
        .args(["requeue", job_id])
        .status()
        .map_err(|e| KilnError::Runtime(format!("failed to run scontrol: {e}")))?;
    if status.success() {
        info!(job_id, "requeue succeeded");
        Ok(())
    } else {
        warn!(job_id, %status, "requeue failed");
        Err(KilnError::Runtime(format!(
            "scontrol requeue {job_id} exited with {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_shared_between_clones() {
        let handle = InterruptHandle::new();
        let other = handle.clone();
        assert!(!handle.is_interrupted());
        other.interrupt();
        assert!(handle.is_interrupted());

        other.preempt();
        assert!(handle.take_preempted());
        assert!(!handle.is_preempted());

        handle.reset();
        assert!(!other.is_interrupted());
    }
}
