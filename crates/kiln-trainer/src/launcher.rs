//! Launching a run onto its process topology.
//!
//! Every launcher ends in the same worker body ([`Trainer::run_worker`]);
//! they differ only in how the process group is formed:
//!
//! - single device, data parallel and one TPU core run in this process
//! - cluster-managed DDP and DDP2 join a TCP group formed by processes the
//!   cluster started
//! - spawned DDP and TPU re-execute the current binary once per device and
//!   wait for the workers
//!
//! Spawned workers re-run the user's program from the top. They build their
//! trainer from the configuration snapshot in the environment, skip every
//! launch before the one that spawned them and exit once it finishes. Rank
//! zero hands the trained weights back through a checkpoint file.

use crate::checkpoint::{Checkpoint, SPAWN_WEIGHTS_FILE};
use crate::data_loading::{DataLoaders, LoaderSet};
use crate::optimizers::{init_optimizers, OptimizerBundle};
use crate::strategy::LauncherKind;
use crate::trainer::Trainer;
use kiln_core::{DevicePlacement, KilnError, Metrics, Result, RunStatus, Stage, TrainModule};
use kiln_distributed::env::{
    random_port, ENV_LOCAL_RANK, ENV_MASTER_ADDR, ENV_MASTER_PORT, ENV_NODE_RANK, ENV_PROCS_PER_NODE,
    ENV_SPAWNED_WORKER, ENV_TPU_CORE, ENV_TRAINER_CONFIG,
};
use kiln_distributed::{DistributedConfig, ProcessGroup, ProcessSpawner};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Index of the launch a spawned worker belongs to.
pub const ENV_LAUNCH_INDEX: &str = "KILN_LAUNCH_INDEX";

/// Weights of the launching process, loaded by spawned workers.
pub const ENV_INITIAL_WEIGHTS: &str = "KILN_INITIAL_WEIGHTS";

const SPAWN_START_FILE: &str = "__temp_weight_ddp_start.ckpt";
const STATUS_KEY: &str = "kiln_run_status";
const METRICS_KEY: &str = "kiln_callback_metrics";

/// Variables that differ between the workers of one node.
pub fn worker_env(local_rank: usize, tpu: bool) -> Vec<(String, String)> {
    let mut vars = vec![(ENV_LOCAL_RANK.to_string(), local_rank.to_string())];
    if tpu {
        vars.push((ENV_TPU_CORE.to_string(), local_rank.to_string()));
    }
    vars
}

impl Trainer {
    /// Attach `model` and run it on the selected topology.
    pub(crate) fn launch<M>(&mut self, model: &mut M, loaders: DataLoaders<M::Batch>) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        let launch_index = self.launches;
        self.launches += 1;
        if self.strategy.spawns_workers() && self.env.is_spawned_worker() {
            let target = self
                .env
                .get(ENV_LAUNCH_INDEX)
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if launch_index != target {
                debug!(launch_index, target, "spawned worker skipping an earlier launch");
                return Ok(RunStatus::Success);
            }
        }
        let result = self.dispatch(model, loaders, launch_index);
        self.settle(result)
    }

    fn dispatch<M>(&mut self, model: &mut M, loaders: DataLoaders<M::Batch>, launch_index: usize) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        self.attach(model, &loaders)?;
        let spawned = self.env.is_spawned_worker();
        if !spawned {
            model.prepare_data()?;
        }

        match self.strategy.kind() {
            LauncherKind::SingleDevice | LauncherKind::DataParallel | LauncherKind::TpuInProcess => {
                let group = ProcessGroup::local()?;
                self.run_worker(model, loaders, group, 0)
            }
            LauncherKind::DdpCluster => {
                let local_rank = self.env.local_rank()?.ok_or_else(|| {
                    KilnError::misconfigured(
                        "distributed_backend",
                        "cluster-managed ddp needs SLURM_LOCALID or LOCAL_RANK in the environment",
                    )
                })?;
                let rank = self.env.node_rank()? * self.strategy.procs_per_node() + local_rank;
                let group = self.connect_group(rank, self.strategy.world_size())?;
                self.run_worker(model, loaders, group, local_rank)
            }
            LauncherKind::Ddp2 => {
                let rank = self.env.node_rank()?;
                let group = self.connect_group(rank, self.strategy.world_size())?;
                self.run_worker(model, loaders, group, 0)
            }
            LauncherKind::DdpSpawn | LauncherKind::TpuSpawn if spawned => self.run_spawned_worker(model, loaders),
            LauncherKind::DdpSpawn | LauncherKind::TpuSpawn => self.spawn_workers(model, launch_index),
        }
    }

    /// The body every process runs, whatever the topology.
    pub(crate) fn run_worker<M>(
        &mut self,
        model: &mut M,
        loaders: DataLoaders<M::Batch>,
        group: ProcessGroup,
        local_rank: usize,
    ) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        let rank = group.rank();
        let world_size = group.world_size();
        self.state.proc_rank = rank;
        self.state.world_size = world_size;
        self.local_rank = local_rank;
        self.logger.set_rank_zero(rank == 0);
        self.checkpoint_io.set_rank_zero(rank == 0);
        self.group = Some(group);

        let placement = self.strategy.placement(local_rank, rank, world_size);
        info!(rank, world_size, device = ?placement.device, "Worker starting");

        let mut loaders = LoaderSet::new(loaders);
        let outcome = self
            .setup_worker(model, &placement)
            .and_then(|()| self.run_pretrain_routine(model, &mut loaders));
        let status = self.teardown(model, outcome);
        self.group = None;
        status
    }

    fn setup_worker<M>(&mut self, model: &mut M, placement: &DevicePlacement) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        model.configure_device(placement)?;
        self.optimizers = if self.state.testing {
            OptimizerBundle::empty()
        } else {
            init_optimizers(model.configure_optimizers()?, &self.warnings)?
        };
        self.batch_loss_value = 0.0;
        Ok(())
    }

    /// Turn the outcome of a run into its status and close everything out.
    ///
    /// Interrupts end the run gracefully; any other error finalizes the
    /// logger as failed and propagates.
    fn teardown<M>(&mut self, model: &mut M, outcome: Result<()>) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        let outcome = match outcome {
            Err(e) if e.is_interrupt() => {
                self.state.interrupted = true;
                Ok(())
            }
            other => other,
        };
        if let Err(e) = outcome {
            error!(rank = self.state.proc_rank, "Run failed: {}", e);
            if let Err(finalize_err) = self.logger.finalize(RunStatus::Failed) {
                warn!("Failed to finalize the logger: {}", finalize_err);
            }
            self.state.stage = Stage::Finalized;
            return Err(e);
        }

        let hook = if self.state.testing {
            Ok(())
        } else {
            let hook = model.on_train_end();
            self.callbacks.on_train_end(&self.state);
            hook
        };
        let status = match (&hook, self.state.interrupted) {
            (Err(_), _) => RunStatus::Failed,
            (Ok(()), true) => RunStatus::Interrupted,
            (Ok(()), false) => RunStatus::Success,
        };
        let finalized = self.logger.finalize(status);
        self.state.transition(Stage::Finalized)?;
        hook?;
        finalized?;

        info!(
            status = status.as_str(),
            epoch = self.state.current_epoch,
            step = self.state.global_step,
            "Run finished"
        );
        Ok(status)
    }

    fn connect_group(&self, rank: usize, world_size: usize) -> Result<ProcessGroup> {
        let config = DistributedConfig::new(self.env.master_addr(), self.env.master_port()?, rank, world_size);
        info!(
            rank,
            world_size,
            addr = %config.master_addr,
            port = config.master_port,
            "Joining process group"
        );
        Ok(ProcessGroup::connect(config)?)
    }

    /// Parent side of a spawned launch.
    fn spawn_workers<M>(&mut self, model: &mut M, launch_index: usize) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        let nprocs = self.strategy.procs_per_node();
        let port = match self.env.explicit_master_port()? {
            Some(port) => port,
            None => random_port(),
        };

        let initial = self.config.save_root().join(SPAWN_START_FILE);
        Checkpoint::new(self.state.current_epoch, self.state.global_step, model.state_dict()?).write(&initial)?;

        let tpu = self.strategy.on_tpu();
        let spawner = ProcessSpawner::current_exe()?
            .env(ENV_SPAWNED_WORKER, "1")
            .env(ENV_NODE_RANK, self.env.node_rank()?.to_string())
            .env(ENV_PROCS_PER_NODE, nprocs.to_string())
            .env(ENV_MASTER_ADDR, self.env.master_addr())
            .env(ENV_MASTER_PORT, port.to_string())
            .env(ENV_TRAINER_CONFIG, serde_json::to_string(&self.config)?)
            .env(ENV_LAUNCH_INDEX, launch_index.to_string())
            .env(ENV_INITIAL_WEIGHTS, initial.to_string_lossy().to_string());

        info!(nprocs, port, kind = %self.strategy.kind(), "Spawning workers");
        let joined = spawner
            .spawn(nprocs, |local_rank| worker_env(local_rank, tpu))
            .and_then(|workers| workers.join());
        if let Err(e) = fs::remove_file(&initial) {
            debug!("Failed to remove {}: {}", initial.display(), e);
        }
        joined?;

        self.load_spawn_weights(model)
    }

    /// Load what rank zero left behind and report its status.
    fn load_spawn_weights<M>(&mut self, model: &mut M) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        let path = self.config.save_root().join(SPAWN_WEIGHTS_FILE);
        if !path.exists() {
            warn!("Workers left no weights behind, treating the run as interrupted");
            self.state.interrupted = true;
            self.state.transition(Stage::Finalized)?;
            return Ok(RunStatus::Interrupted);
        }

        let checkpoint = Checkpoint::read(&path)?;
        model.load_state_dict(&checkpoint.model_state)?;
        fs::remove_file(&path)?;

        self.state.current_epoch = checkpoint.epoch;
        self.state.global_step = checkpoint.global_step;
        if let Some(Value::Object(metrics)) = checkpoint.extra.get(METRICS_KEY) {
            self.state.callback_metrics = metrics
                .iter()
                .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
                .collect::<Metrics>();
        }
        let status = match checkpoint.extra.get(STATUS_KEY) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => RunStatus::Success,
        };
        self.state.interrupted = status == RunStatus::Interrupted;
        self.state.transition(Stage::Finalized)?;
        info!(status = status.as_str(), "Loaded weights from spawned workers");
        Ok(status)
    }

    /// Worker side of a spawned launch. Never returns.
    fn run_spawned_worker<M>(&mut self, model: &mut M, loaders: DataLoaders<M::Batch>) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        let result = self.spawned_worker_body(model, loaders);
        let code = match &result {
            Ok(status) if self.state.is_rank_zero() => match self.save_spawn_weights(&*model, *status) {
                Ok(()) => 0,
                Err(e) => {
                    error!("Failed to hand weights back to the launcher: {}", e);
                    1
                }
            },
            Ok(_) => 0,
            Err(e) => {
                error!(rank = self.state.proc_rank, "Worker failed: {}", e);
                1
            }
        };
        std::process::exit(code)
    }

    fn spawned_worker_body<M>(&mut self, model: &mut M, loaders: DataLoaders<M::Batch>) -> Result<RunStatus>
    where
        M: TrainModule + ?Sized,
    {
        let local_rank = match self.strategy.kind() {
            LauncherKind::TpuSpawn => self.env.tpu_core()?.or(self.env.local_rank()?),
            _ => self.env.local_rank()?,
        }
        .unwrap_or(0);
        let procs_per_node = self
            .env
            .procs_per_node()?
            .unwrap_or_else(|| self.strategy.procs_per_node());
        let rank = self.env.node_rank()? * procs_per_node + local_rank;

        if let Some(path) = self.env.get(ENV_INITIAL_WEIGHTS).map(PathBuf::from) {
            let initial = Checkpoint::read(&path)?;
            model.load_state_dict(&initial.model_state)?;
        }

        let group = self.connect_group(rank, self.strategy.world_size())?;
        self.run_worker(model, loaders, group, local_rank)
    }

    fn save_spawn_weights<M>(&self, model: &M, status: RunStatus) -> Result<()>
    where
        M: TrainModule + ?Sized,
    {
        let best = self.checkpoint_callback.as_ref().and_then(|c| c.best());
        let mut checkpoint = self.dump_checkpoint(model, self.state.current_epoch, best)?;
        checkpoint
            .extra
            .insert(STATUS_KEY.to_string(), serde_json::to_value(status)?);
        checkpoint.extra.insert(
            METRICS_KEY.to_string(),
            serde_json::to_value(&self.state.callback_metrics)?,
        );
        checkpoint.write(&self.config.save_root().join(SPAWN_WEIGHTS_FILE))
    }
}
