//! Execution strategy selection.
//!
//! [`ExecutionStrategy::resolve`] turns `distributed_backend`, `gpus`,
//! `num_nodes`, `num_tpu_cores` and `precision` into one launcher kind plus
//! the device layout each process places the module on.

use crate::precision::{ComputeTarget, PrecisionPolicy};
use kiln_core::{
    DeviceKind, DevicePlacement, DistributedMode, GpuSelection, KilnError, Result, TrainerBinding,
    TrainerConfig, WarningCache,
};
use kiln_distributed::ClusterEnvironment;
use std::fmt;

/// Variable advertising the TPU cores attached to this host.
pub const ENV_TPU_NUM_CORES: &str = "KILN_TPU_NUM_CORES";

/// Devices this host offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInventory {
    /// Visible GPUs.
    pub gpus: usize,
    /// Attached TPU cores.
    pub tpu_cores: usize,
}

impl DeviceInventory {
    /// Explicit inventory.
    pub fn new(gpus: usize, tpu_cores: usize) -> Self {
        Self { gpus, tpu_cores }
    }

    /// Host with neither GPUs nor TPUs.
    pub fn cpu_only() -> Self {
        Self::default()
    }

    /// Count devices advertised in the environment.
    pub fn detect(env: &ClusterEnvironment) -> Self {
        Self {
            gpus: env.visible_gpus(),
            tpu_cores: env
                .get(ENV_TPU_NUM_CORES)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
        }
    }
}

/// Resolve a GPU selection into device indices, checked against `inventory`.
pub fn parse_gpu_ids(selection: Option<&GpuSelection>, inventory: &DeviceInventory) -> Result<Vec<usize>> {
    let all = || (0..inventory.gpus).collect::<Vec<_>>();
    let ids = match selection {
        None => Vec::new(),
        Some(GpuSelection::Count(0)) => Vec::new(),
        Some(GpuSelection::Count(-1)) => {
            if inventory.gpus == 0 {
                return Err(KilnError::misconfigured(
                    "gpus",
                    "all GPUs were requested (-1) but none are available",
                ));
            }
            all()
        }
        Some(GpuSelection::Count(n)) if *n < 0 => {
            return Err(KilnError::misconfigured(
                "gpus",
                format!("must be -1, 0, a positive count or a list of ids, got {n}"),
            ));
        }
        Some(GpuSelection::Count(n)) => (0..*n as usize).collect(),
        Some(GpuSelection::Ids(ids)) => ids.clone(),
        Some(GpuSelection::Text(text)) => parse_gpu_text(text, inventory)?,
    };

    if let Some(missing) = ids.iter().find(|id| **id >= inventory.gpus) {
        return Err(KilnError::misconfigured(
            "gpus",
            format!(
                "GPU {missing} was requested but only {} GPUs are available",
                inventory.gpus
            ),
        ));
    }
    Ok(ids)
}

fn parse_gpu_text(text: &str, inventory: &DeviceInventory) -> Result<Vec<usize>> {
    let text = text.trim();
    if text == "-1" {
        return parse_gpu_ids(Some(&GpuSelection::Count(-1)), inventory);
    }
    let invalid = || {
        KilnError::misconfigured(
            "gpus",
            format!("expected a count or comma separated ids, got {text:?}"),
        )
    };
    if text.contains(',') {
        return text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<usize>().map_err(|_| invalid()))
            .collect();
    }
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let count = text.parse::<usize>().map_err(|_| invalid())?;
    Ok((0..count).collect())
}

/// How a run is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// Current process, one device (CPU or a single GPU).
    SingleDevice,
    /// Current process, module replicated over local GPUs.
    DataParallel,
    /// One spawned worker process per device.
    DdpSpawn,
    /// One process per device, started by the cluster manager.
    DdpCluster,
    /// One process per node, data-parallel inside the node.
    Ddp2,
    /// Current process, a single TPU core.
    TpuInProcess,
    /// One spawned worker process per TPU core.
    TpuSpawn,
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SingleDevice => "single_device",
            Self::DataParallel => "dp",
            Self::DdpSpawn => "ddp_spawn",
            Self::DdpCluster => "ddp_cluster",
            Self::Ddp2 => "ddp2",
            Self::TpuInProcess => "tpu",
            Self::TpuSpawn => "tpu_spawn",
        };
        f.write_str(name)
    }
}

/// The resolved launch plan of a trainer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStrategy {
    kind: LauncherKind,
    gpu_ids: Vec<usize>,
    num_nodes: usize,
    tpu_cores: Option<usize>,
    procs_per_node: usize,
    precision: PrecisionPolicy,
}

impl ExecutionStrategy {
    /// Pick the strategy for `config` on this host.
    pub fn resolve(
        config: &TrainerConfig,
        inventory: &DeviceInventory,
        env: &ClusterEnvironment,
        warnings: &WarningCache,
    ) -> Result<Self> {
        let precision = config.precision()?;

        if let Some(cores) = config.num_tpu_cores {
            let cores = cores as usize;
            if cores > inventory.tpu_cores {
                return Err(KilnError::misconfigured(
                    "num_tpu_cores",
                    format!(
                        "{cores} TPU cores were requested but {} are available",
                        inventory.tpu_cores
                    ),
                ));
            }
            if config.gpus.is_some() {
                warnings.warn("num_tpu_cores is set, ignoring the gpus option");
            }
            return Ok(Self {
                kind: if cores == 1 {
                    LauncherKind::TpuInProcess
                } else {
                    LauncherKind::TpuSpawn
                },
                gpu_ids: Vec::new(),
                num_nodes: 1,
                tpu_cores: Some(cores),
                procs_per_node: cores,
                precision: PrecisionPolicy::resolve(precision, ComputeTarget::Tpu)?,
            });
        }

        let gpu_ids = parse_gpu_ids(config.gpus.as_ref(), inventory)?;
        let num_gpus = gpu_ids.len();
        let mut backend = config.distributed_backend;

        if num_gpus > 1 && backend.is_none() {
            warnings.warn(
                "You requested multiple GPUs but did not specify a backend, e.g. \
                 distributed_backend=dp (or ddp, ddp2). Setting distributed_backend=dp for you.",
            );
            backend = Some(DistributedMode::Dp);
        }

        if config.num_nodes > 1 && !matches!(backend, Some(DistributedMode::Ddp | DistributedMode::Ddp2)) {
            return Err(KilnError::misconfigured(
                "distributed_backend",
                format!(
                    "num_nodes = {} needs distributed_backend ddp or ddp2, got {}",
                    config.num_nodes,
                    backend.map_or("none", |b| b.as_str())
                ),
            ));
        }

        let procs_per_node = num_gpus.max(1);
        let kind = match backend {
            None => LauncherKind::SingleDevice,
            Some(DistributedMode::Dp) if num_gpus == 0 => {
                warnings.warn("distributed_backend=dp requested without GPUs, training on a single CPU device");
                LauncherKind::SingleDevice
            }
            Some(DistributedMode::Dp) => LauncherKind::DataParallel,
            Some(DistributedMode::Ddp) if num_gpus == 0 && config.num_nodes == 1 => {
                warnings.warn("distributed_backend=ddp requested without GPUs, training on a single CPU device");
                LauncherKind::SingleDevice
            }
            Some(DistributedMode::Ddp) => {
                let num_requested = procs_per_node * config.num_nodes;
                if env.is_slurm_managing_tasks(num_requested) || env.get("LOCAL_RANK").is_some() {
                    LauncherKind::DdpCluster
                } else {
                    LauncherKind::DdpSpawn
                }
            }
            Some(DistributedMode::Ddp2) if num_gpus == 0 && config.num_nodes == 1 => {
                warnings.warn("distributed_backend=ddp2 requested without GPUs, training on a single CPU device");
                LauncherKind::SingleDevice
            }
            Some(DistributedMode::Ddp2) => LauncherKind::Ddp2,
        };

        let target = if num_gpus > 0 {
            ComputeTarget::Gpu
        } else {
            ComputeTarget::Cpu
        };
        Ok(Self {
            kind,
            gpu_ids,
            num_nodes: config.num_nodes,
            tpu_cores: None,
            procs_per_node,
            precision: PrecisionPolicy::resolve(precision, target)?,
        })
    }

    /// Launcher kind.
    pub fn kind(&self) -> LauncherKind {
        self.kind
    }

    /// GPU indices of this node.
    pub fn gpu_ids(&self) -> &[usize] {
        &self.gpu_ids
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// TPU cores, when training on TPUs.
    pub fn tpu_cores(&self) -> Option<usize> {
        self.tpu_cores
    }

    /// Processes per node under DDP and TPU spawning.
    pub fn procs_per_node(&self) -> usize {
        self.procs_per_node
    }

    /// Precision settings.
    pub fn precision(&self) -> PrecisionPolicy {
        self.precision
    }

    /// Total processes of the run.
    pub fn world_size(&self) -> usize {
        match self.kind {
            LauncherKind::DdpSpawn | LauncherKind::DdpCluster => self.num_nodes * self.procs_per_node,
            LauncherKind::Ddp2 => self.num_nodes,
            LauncherKind::TpuSpawn => self.procs_per_node,
            _ => 1,
        }
    }

    /// Whether the module runs on GPUs.
    pub fn on_gpu(&self) -> bool {
        !self.gpu_ids.is_empty()
    }

    /// Whether the module runs on TPU cores.
    pub fn on_tpu(&self) -> bool {
        self.tpu_cores.is_some()
    }

    /// Whether workers are separate processes started by kiln.
    pub fn spawns_workers(&self) -> bool {
        matches!(self.kind, LauncherKind::DdpSpawn | LauncherKind::TpuSpawn)
    }

    /// Whether ranks synchronize through a process group.
    pub fn is_distributed(&self) -> bool {
        matches!(
            self.kind,
            LauncherKind::DdpSpawn | LauncherKind::DdpCluster | LauncherKind::Ddp2 | LauncherKind::TpuSpawn
        )
    }

    /// Flags bound onto the module.
    pub fn binding(&self, rank: usize, world_size: usize, testing: bool) -> TrainerBinding {
        TrainerBinding {
            current_epoch: 0,
            global_step: 0,
            on_gpu: self.on_gpu(),
            on_tpu: self.on_tpu(),
            use_dp: self.kind == LauncherKind::DataParallel,
            use_ddp: matches!(self.kind, LauncherKind::DdpSpawn | LauncherKind::DdpCluster),
            use_ddp2: self.kind == LauncherKind::Ddp2,
            single_gpu: self.kind == LauncherKind::SingleDevice && self.on_gpu(),
            use_amp: self.precision.use_amp(),
            precision: self.precision.bits(),
            testing,
            proc_rank: rank,
            world_size,
        }
    }

    /// Devices the process with `local_rank` places the module on.
    pub fn placement(&self, local_rank: usize, rank: usize, world_size: usize) -> DevicePlacement {
        let (device, device_ids) = match self.kind {
            LauncherKind::TpuInProcess | LauncherKind::TpuSpawn => (DeviceKind::Tpu(local_rank), vec![local_rank]),
            _ if self.gpu_ids.is_empty() => (DeviceKind::Cpu, Vec::new()),
            LauncherKind::DdpSpawn | LauncherKind::DdpCluster => {
                let id = self.gpu_ids.get(local_rank).copied().unwrap_or(local_rank);
                (DeviceKind::Gpu(id), vec![id])
            }
            LauncherKind::DataParallel | LauncherKind::Ddp2 => {
                (DeviceKind::Gpu(self.gpu_ids[0]), self.gpu_ids.clone())
            }
            LauncherKind::SingleDevice => (DeviceKind::Gpu(self.gpu_ids[0]), vec![self.gpu_ids[0]]),
        };
        DevicePlacement {
            device,
            device_ids,
            precision: self.precision.precision(),
            use_amp: self.precision.use_amp(),
            rank,
            world_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(f: impl FnOnce(&mut TrainerConfig)) -> TrainerConfig {
        let mut config = TrainerConfig::default();
        f(&mut config);
        config
    }

    fn resolve(config: &TrainerConfig, inventory: DeviceInventory, env: &ClusterEnvironment) -> Result<ExecutionStrategy> {
        ExecutionStrategy::resolve(config, &inventory, env, &WarningCache::new())
    }

    #[test]
    fn test_parse_gpu_ids() {
        let inv = DeviceInventory::new(4, 0);
        let parse = |s: GpuSelection| parse_gpu_ids(Some(&s), &inv);
        assert_eq!(parse(GpuSelection::Count(0)).unwrap(), Vec::<usize>::new());
        assert_eq!(parse(GpuSelection::Count(-1)).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse(GpuSelection::Count(2)).unwrap(), vec![0, 1]);
        assert_eq!(parse(GpuSelection::Text("1,3".into())).unwrap(), vec![1, 3]);
        assert_eq!(parse(GpuSelection::Text("-1".into())).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse(GpuSelection::Text("3".into())).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse(GpuSelection::Ids(vec![2])).unwrap(), vec![2]);
        assert!(parse(GpuSelection::Count(5)).is_err());
        assert!(parse(GpuSelection::Text("a,b".into())).is_err());
        assert!(parse(GpuSelection::Count(-3)).is_err());
    }

    #[test]
    fn test_cpu_defaults_to_single_device() {
        let strategy = resolve(&TrainerConfig::default(), DeviceInventory::cpu_only(), &ClusterEnvironment::default()).unwrap();
        assert_eq!(strategy.kind(), LauncherKind::SingleDevice);
        assert_eq!(strategy.world_size(), 1);
        assert_eq!(strategy.placement(0, 0, 1).device, DeviceKind::Cpu);
    }

    #[test]
    fn test_amp_on_cpu_rejected() {
        let err = resolve(&config(|c| c.precision = 16), DeviceInventory::cpu_only(), &ClusterEnvironment::default())
            .unwrap_err();
        assert!(err.to_string().contains("amp + cpu"));
    }

    #[test]
    fn test_multiple_gpus_default_to_dp() {
        let warnings = WarningCache::new();
        let strategy = ExecutionStrategy::resolve(
            &config(|c| c.gpus = Some(GpuSelection::Count(2))),
            &DeviceInventory::new(2, 0),
            &ClusterEnvironment::default(),
            &warnings,
        )
        .unwrap();
        assert_eq!(strategy.kind(), LauncherKind::DataParallel);
        assert_eq!(warnings.len(), 1);
        let placement = strategy.placement(0, 0, 1);
        assert_eq!(placement.device_ids, vec![0, 1]);
    }

    #[test]
    fn test_ddp_spawn_vs_cluster() {
        let cfg = config(|c| {
            c.gpus = Some(GpuSelection::Count(2));
            c.distributed_backend = Some(DistributedMode::Ddp);
            c.num_nodes = 2;
        });
        let inv = DeviceInventory::new(2, 0);
        let spawn = resolve(&cfg, inv, &ClusterEnvironment::default()).unwrap();
        assert_eq!(spawn.kind(), LauncherKind::DdpSpawn);
        assert_eq!(spawn.world_size(), 4);

        let env = ClusterEnvironment::from_vars([("SLURM_NTASKS", "4"), ("SLURM_JOB_NAME", "train")]);
        let cluster = resolve(&cfg, inv, &env).unwrap();
        assert_eq!(cluster.kind(), LauncherKind::DdpCluster);
        assert_eq!(cluster.placement(1, 3, 4).device, DeviceKind::Gpu(1));
        assert!(cluster.binding(3, 4, false).use_ddp);
    }

    #[test]
    fn test_multi_node_requires_ddp() {
        let err = resolve(
            &config(|c| {
                c.gpus = Some(GpuSelection::Count(2));
                c.distributed_backend = Some(DistributedMode::Dp);
                c.num_nodes = 2;
            }),
            DeviceInventory::new(2, 0),
            &ClusterEnvironment::default(),
        )
        .unwrap_err();
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn test_ddp2_world_is_nodes() {
        let strategy = resolve(
            &config(|c| {
                c.gpus = Some(GpuSelection::Count(2));
                c.distributed_backend = Some(DistributedMode::Ddp2);
                c.num_nodes = 3;
            }),
            DeviceInventory::new(2, 0),
            &ClusterEnvironment::default(),
        )
        .unwrap();
        assert_eq!(strategy.kind(), LauncherKind::Ddp2);
        assert_eq!(strategy.world_size(), 3);
    }

    #[test]
    fn test_tpu_selection() {
        let cfg = config(|c| {
            c.num_tpu_cores = Some(8);
            c.precision = 16;
        });
        let strategy = resolve(&cfg, DeviceInventory::new(0, 8), &ClusterEnvironment::default()).unwrap();
        assert_eq!(strategy.kind(), LauncherKind::TpuSpawn);
        assert!(!strategy.precision().use_amp());
        assert_eq!(strategy.placement(5, 5, 8).device, DeviceKind::Tpu(5));

        let single = resolve(
            &config(|c| c.num_tpu_cores = Some(1)),
            DeviceInventory::new(0, 8),
            &ClusterEnvironment::default(),
        )
        .unwrap();
        assert_eq!(single.kind(), LauncherKind::TpuInProcess);

        assert!(resolve(&cfg, DeviceInventory::cpu_only(), &ClusterEnvironment::default()).is_err());
    }

    #[test]
    fn test_inventory_from_env() {
        let env = ClusterEnvironment::from_vars([("CUDA_VISIBLE_DEVICES", "0,1"), (ENV_TPU_NUM_CORES, "8")]);
        assert_eq!(DeviceInventory::detect(&env), DeviceInventory::new(2, 8));
    }
}
