//! Cluster environment detection.
//!
//! Ranks, node ids and the rendezvous endpoint come from environment
//! variables set either by kiln's own spawner or by an external cluster
//! manager (SLURM). Variables are captured once so tests can inject them.

use crate::error::{DistributedError, DistributedResult};
use rand::Rng;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Set to `1` in processes started by kiln's spawner.
pub const ENV_SPAWNED_WORKER: &str = "KILN_SPAWNED_WORKER";
/// Local rank assigned by kiln's spawner.
pub const ENV_LOCAL_RANK: &str = "KILN_LOCAL_RANK";
/// Node rank forwarded by kiln's spawner.
pub const ENV_NODE_RANK: &str = "KILN_NODE_RANK";
/// Processes per node forwarded by kiln's spawner.
pub const ENV_PROCS_PER_NODE: &str = "KILN_PROCS_PER_NODE";
/// JSON snapshot of the launching trainer's configuration.
pub const ENV_TRAINER_CONFIG: &str = "KILN_TRAINER_CONFIG";
/// TPU core assigned by the TPU spawner.
pub const ENV_TPU_CORE: &str = "KILN_TPU_CORE";
/// Rendezvous host.
pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
/// Rendezvous port.
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";

/// Port used when neither `MASTER_PORT` nor a SLURM job id is available.
pub const DEFAULT_MASTER_PORT: u16 = 12910;

const RELEVANT_PREFIXES: &[&str] = &["KILN_", "SLURM_", "MASTER_"];
const RELEVANT_KEYS: &[&str] = &[
    "NODE_RANK",
    "LOCAL_RANK",
    "CUDA_VISIBLE_DEVICES",
    "FAKE_SLURM_MANAGING_TASKS",
];

/// Snapshot of the environment variables kiln cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterEnvironment {
    vars: BTreeMap<String, String>,
}

impl ClusterEnvironment {
    /// Capture the current process environment.
    pub fn from_process_env() -> Self {
        Self::from_vars(std::env::vars().filter(|(k, _)| {
            RELEVANT_PREFIXES.iter().any(|p| k.starts_with(p)) || RELEVANT_KEYS.contains(&k.as_str())
        }))
    }

    /// Build from explicit variables.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Raw variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Set a variable on this snapshot.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    fn parse<T: FromStr>(&self, name: &str) -> DistributedResult<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| DistributedError::Environment {
                name: name.to_string(),
                value: raw.to_string(),
                reason: format!("expected {}", std::any::type_name::<T>()),
            }),
        }
    }

    /// Whether this process was started by kiln's spawner.
    pub fn is_spawned_worker(&self) -> bool {
        self.get(ENV_SPAWNED_WORKER) == Some("1")
    }

    /// Local rank: kiln's own variable, then SLURM, then `LOCAL_RANK`.
    pub fn local_rank(&self) -> DistributedResult<Option<usize>> {
        for name in [ENV_LOCAL_RANK, "SLURM_LOCALID", "LOCAL_RANK"] {
            if let Some(rank) = self.parse(name)? {
                return Ok(Some(rank));
            }
        }
        Ok(None)
    }

    /// Node rank, defaulting to 0.
    pub fn node_rank(&self) -> DistributedResult<usize> {
        for name in [ENV_NODE_RANK, "SLURM_NODEID", "NODE_RANK"] {
            if let Some(rank) = self.parse(name)? {
                return Ok(rank);
            }
        }
        Ok(0)
    }

    /// Processes per node forwarded by the spawner.
    pub fn procs_per_node(&self) -> DistributedResult<Option<usize>> {
        self.parse(ENV_PROCS_PER_NODE)
    }

    /// TPU core assigned by the TPU spawner.
    pub fn tpu_core(&self) -> DistributedResult<Option<usize>> {
        self.parse(ENV_TPU_CORE)
    }

    /// Configuration snapshot passed by the spawner.
    pub fn config_snapshot(&self) -> Option<&str> {
        self.get(ENV_TRAINER_CONFIG)
    }

    /// SLURM job id.
    pub fn slurm_job_id(&self) -> Option<&str> {
        self.get("SLURM_JOB_ID")
    }

    /// Whether SLURM already started one process per requested device.
    ///
    /// True when `SLURM_NTASKS` equals `num_requested` and the job is not an
    /// interactive `bash` session, or when `FAKE_SLURM_MANAGING_TASKS` is
    /// set to a non-zero value.
    pub fn is_slurm_managing_tasks(&self, num_requested: usize) -> bool {
        if self
            .parse::<i64>("FAKE_SLURM_MANAGING_TASKS")
            .ok()
            .flatten()
            .is_some_and(|v| v != 0)
        {
            return true;
        }
        let Ok(Some(ntasks)) = self.parse::<usize>("SLURM_NTASKS") else {
            return false;
        };
        ntasks == num_requested && self.get("SLURM_JOB_NAME") != Some("bash")
    }

    /// Rendezvous host.
    pub fn master_addr(&self) -> String {
        if let Some(addr) = self.get(ENV_MASTER_ADDR) {
            return addr.to_string();
        }
        if let Some(nodelist) = self.get("SLURM_NODELIST") {
            return resolve_root_node_address(nodelist);
        }
        "127.0.0.1".to_string()
    }

    /// Explicit `MASTER_PORT`.
    pub fn explicit_master_port(&self) -> DistributedResult<Option<u16>> {
        self.parse(ENV_MASTER_PORT)
    }

    /// Rendezvous port: `MASTER_PORT`, else derived from the SLURM job id,
    /// else [`DEFAULT_MASTER_PORT`].
    pub fn master_port(&self) -> DistributedResult<u16> {
        if let Some(port) = self.explicit_master_port()? {
            return Ok(port);
        }
        Ok(self
            .slurm_job_id()
            .and_then(port_from_job_id)
            .unwrap_or(DEFAULT_MASTER_PORT))
    }

    /// Number of devices listed in `CUDA_VISIBLE_DEVICES`.
    pub fn visible_gpus(&self) -> usize {
        match self.get("CUDA_VISIBLE_DEVICES") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty() && s.trim() != "-1")
                .count(),
            None => 0,
        }
    }
}

fn port_from_job_id(job_id: &str) -> Option<u16> {
    let digits: String = job_id.chars().filter(|c| c.is_ascii_digit()).collect();
    let tail = &digits[digits.len().saturating_sub(4)..];
    tail.parse::<u16>().ok().map(|n| n + 15000)
}

/// First host of a SLURM node list: `host[1-3,5]` becomes `host1`.
pub fn resolve_root_node_address(nodelist: &str) -> String {
    let first = nodelist.split(',').next().unwrap_or(nodelist).trim();
    match first.find('[') {
        Some(open) => {
            let name = &first[..open];
            let number = first[open + 1..]
                .split(|c| c == '-' || c == ',' || c == ']')
                .next()
                .unwrap_or("");
            format!("{name}{number}")
        }
        None => first.to_string(),
    }
}

/// Random rendezvous port in `[10000, 19000]`.
pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(10000..=19000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_root_node_address() {
        assert_eq!(resolve_root_node_address("host[1-3,5]"), "host1");
        assert_eq!(resolve_root_node_address("gpu07"), "gpu07");
        assert_eq!(resolve_root_node_address("a01,a02"), "a01");
    }

    #[test]
    fn test_master_port_resolution() {
        let env = ClusterEnvironment::from_vars([("MASTER_PORT", "23456")]);
        assert_eq!(env.master_port().unwrap(), 23456);

        let env = ClusterEnvironment::from_vars([("SLURM_JOB_ID", "981234")]);
        assert_eq!(env.master_port().unwrap(), 1234 + 15000);

        let env = ClusterEnvironment::default();
        assert_eq!(env.master_port().unwrap(), DEFAULT_MASTER_PORT);
    }

    #[test]
    fn test_master_addr_from_nodelist() {
        let env = ClusterEnvironment::from_vars([("SLURM_NODELIST", "node[4-7]")]);
        assert_eq!(env.master_addr(), "node4");
        assert_eq!(ClusterEnvironment::default().master_addr(), "127.0.0.1");
    }

    #[test]
    fn test_slurm_managing_tasks() {
        let env = ClusterEnvironment::from_vars([
            ("SLURM_NTASKS", "8"),
            ("SLURM_JOB_NAME", "train"),
        ]);
        assert!(env.is_slurm_managing_tasks(8));
        assert!(!env.is_slurm_managing_tasks(4));

        let interactive = ClusterEnvironment::from_vars([
            ("SLURM_NTASKS", "8"),
            ("SLURM_JOB_NAME", "bash"),
        ]);
        assert!(!interactive.is_slurm_managing_tasks(8));

        let fake = ClusterEnvironment::from_vars([("FAKE_SLURM_MANAGING_TASKS", "1")]);
        assert!(fake.is_slurm_managing_tasks(2));
    }

    #[test]
    fn test_rank_precedence() {
        let env = ClusterEnvironment::from_vars([
            ("KILN_LOCAL_RANK", "1"),
            ("SLURM_LOCALID", "3"),
            ("SLURM_NODEID", "2"),
        ]);
        assert_eq!(env.local_rank().unwrap(), Some(1));
        assert_eq!(env.node_rank().unwrap(), 2);
    }

    #[test]
    fn test_bad_integer_is_reported() {
        let env = ClusterEnvironment::from_vars([("SLURM_LOCALID", "zero")]);
        let err = env.local_rank().unwrap_err();
        assert!(err.to_string().contains("SLURM_LOCALID"));
    }

    #[test]
    fn test_random_port_range() {
        for _ in 0..100 {
            let port = random_port();
            assert!((10000..=19000).contains(&port));
        }
    }

    #[test]
    fn test_visible_gpus() {
        let env = ClusterEnvironment::from_vars([("CUDA_VISIBLE_DEVICES", "0,1,3")]);
        assert_eq!(env.visible_gpus(), 3);
        assert_eq!(ClusterEnvironment::default().visible_gpus(), 0);
    }
}
