//! Worker process spawning.
//!
//! Workers re-execute a program (by default the current binary with its
//! arguments) with rank-specific environment variables. The parent only
//! waits: a worker that exits abnormally fails the whole group and the
//! remaining workers are killed, since they would otherwise block forever
//! at the next rendezvous.

use crate::error::{DistributedError, DistributedResult};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;
use tracing::{error, info};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Builds and starts worker processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
}

impl ProcessSpawner {
    /// Spawner for an explicit program.
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// Spawner re-running the current binary with the same arguments.
    pub fn current_exe() -> DistributedResult<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, std::env::args_os().skip(1)))
    }

    /// Add an environment variable passed to every worker.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Command for one worker, with `extra` applied after the shared variables.
    pub fn command(&self, extra: &[(String, String)]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in self.env.iter().chain(extra) {
            cmd.env(k, v);
        }
        cmd
    }

    /// Start `nprocs` workers. `per_rank` supplies each local rank's variables.
    pub fn spawn<F>(&self, nprocs: usize, per_rank: F) -> DistributedResult<WorkerGroup>
    where
        F: Fn(usize) -> Vec<(String, String)>,
    {
        let mut group = WorkerGroup {
            children: Vec::with_capacity(nprocs),
        };
        for rank in 0..nprocs {
            match self.command(&per_rank(rank)).spawn() {
                Ok(child) => {
                    info!(rank, pid = child.id(), "spawned worker");
                    group.children.push((rank, child));
                }
                Err(e) => {
                    group.kill_all();
                    return Err(DistributedError::Spawn {
                        rank,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(group)
    }
}

/// Handle to running workers.
pub struct WorkerGroup {
    children: Vec<(usize, Child)>,
}

impl WorkerGroup {
    /// Number of workers.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Wait for every worker. The first abnormal exit kills the rest.
    pub fn join(mut self) -> DistributedResult<()> {
        let mut running: Vec<bool> = vec![true; self.children.len()];
        while running.iter().any(|r| *r) {
            let mut failure = None;
            for (idx, (rank, child)) in self.children.iter_mut().enumerate() {
                if !running[idx] {
                    continue;
                }
                if let Some(status) = child.try_wait()? {
                    running[idx] = false;
                    if !status.success() {
                        failure = Some((*rank, status.to_string()));
                        break;
                    }
                    info!(rank = *rank, "worker finished");
                }
            }
            if let Some((rank, status)) = failure {
                error!(rank, %status, "worker failed");
                self.kill_all();
                return Err(DistributedError::WorkerFailed { rank, status });
            }
            if running.iter().any(|r| *r) {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        Ok(())
    }

    fn kill_all(&mut self) {
        for (_, child) in &mut self.children {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_env_layering() {
        let spawner = ProcessSpawner::new("worker", ["--flag"]).env("A", "1");
        let cmd = spawner.command(&[("B".into(), "2".into())]);
        let envs: Vec<_> = cmd
            .get_envs()
            .map(|(k, v)| (k.to_owned(), v.map(|v| v.to_owned())))
            .collect();
        assert_eq!(envs.len(), 2);
        assert_eq!(cmd.get_args().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_join_success() {
        let spawner = ProcessSpawner::new("sh", ["-c", "exit 0"]);
        let group = spawner.spawn(3, |_| Vec::new()).unwrap();
        assert_eq!(group.len(), 3);
        group.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_join_reports_failed_rank() {
        let spawner = ProcessSpawner::new("sh", ["-c", "exit $KILN_LOCAL_RANK"]);
        let group = spawner
            .spawn(2, |rank| vec![("KILN_LOCAL_RANK".to_string(), rank.to_string())])
            .unwrap();
        match group.join() {
            Err(DistributedError::WorkerFailed { rank, .. }) => assert_eq!(rank, 1),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_spawn_missing_program() {
        let spawner = ProcessSpawner::new("/nonexistent/kiln-worker", Vec::<String>::new());
        let err = spawner.spawn(1, |_| Vec::new()).err().unwrap();
        assert!(matches!(err, DistributedError::Spawn { rank: 0, .. }));
    }
}
