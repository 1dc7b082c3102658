//! Checkpoint records and file I/O.
//!
//! A checkpoint is one JSON document holding model weights, optimizer and
//! scheduler states, progress counters and hyperparameters. Only rank zero
//! writes; every rank may read.
//!
//! Preemption checkpoints live next to regular ones as `hpc_ckpt_<n>.ckpt`
//! and take precedence over `resume_from_checkpoint` at restore time.

use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// File the rank-zero spawn worker leaves behind for the launching process.
pub const SPAWN_WEIGHTS_FILE: &str = "__temp_weight_ddp_end.ckpt";

const HPC_PREFIX: &str = "hpc_ckpt_";
const CKPT_EXTENSION: &str = "ckpt";

/// Early stopping counters carried across a resume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingState {
    /// Checks since the last improvement.
    pub wait: usize,
    /// Checks tolerated without improvement.
    pub patience: usize,
    /// Best value seen, if any check found the metric.
    pub best: Option<f64>,
}

/// Point-in-time training snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Epoch to resume at.
    pub epoch: usize,
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Module weights.
    pub model_state: Value,
    /// One entry per optimizer, in order.
    #[serde(default)]
    pub optimizer_states: Vec<Value>,
    /// One entry per scheduler, in order.
    #[serde(default)]
    pub lr_schedulers: Vec<Value>,
    /// Hyperparameters of the module.
    #[serde(default)]
    pub hparams: Option<Value>,
    /// Best monitored value of the checkpoint policy.
    #[serde(default)]
    pub checkpoint_callback_best: Option<f64>,
    /// Early stopping counters.
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingState>,
    /// Fields added by `on_save_checkpoint`.
    #[serde(default)]
    pub extra: Map<String, Value>,
    /// Version of kiln that wrote the checkpoint.
    pub kiln_version: String,
    /// Write time (RFC 3339).
    pub timestamp: String,
}

impl Checkpoint {
    /// Empty record at the given progress.
    pub fn new(epoch: usize, global_step: usize, model_state: Value) -> Self {
        Self {
            epoch,
            global_step,
            model_state,
            optimizer_states: Vec::new(),
            lr_schedulers: Vec::new(),
            hparams: None,
            checkpoint_callback_best: None,
            early_stopping: None,
            extra: Map::new(),
            kiln_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Write to `path`, creating parent directories.
    ///
    /// The record is written to a sibling temporary file first and renamed,
    /// so a crash never leaves a truncated checkpoint behind.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("ckpt.part");
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read from `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            KilnError::Checkpoint(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            KilnError::Checkpoint(format!("failed to parse {}: {}", path.display(), e))
        })
    }
}

/// Checkpoint persistence for one process.
#[derive(Debug, Clone)]
pub struct CheckpointIo {
    weights_dir: PathBuf,
    rank_zero: bool,
}

impl CheckpointIo {
    /// I/O rooted at `weights_dir`.
    pub fn new(weights_dir: impl Into<PathBuf>) -> Self {
        Self {
            weights_dir: weights_dir.into(),
            rank_zero: true,
        }
    }

    /// Set whether this process is rank zero.
    pub fn set_rank_zero(&mut self, rank_zero: bool) {
        self.rank_zero = rank_zero;
    }

    /// Whether this process writes.
    pub fn is_rank_zero(&self) -> bool {
        self.rank_zero
    }

    /// Root for preemption checkpoints.
    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    /// Write `checkpoint` to `path`. Returns `false` on other ranks, which
    /// skip the write entirely.
    pub fn save(&self, checkpoint: &Checkpoint, path: &Path) -> Result<bool> {
        if !self.rank_zero {
            return Ok(false);
        }
        checkpoint.write(path)?;
        tracing::info!(
            epoch = checkpoint.epoch,
            step = checkpoint.global_step,
            path = %path.display(),
            "Saved checkpoint"
        );
        Ok(true)
    }

    /// Read a checkpoint.
    pub fn load(&self, path: &Path) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::read(path)?;
        tracing::info!(
            epoch = checkpoint.epoch,
            step = checkpoint.global_step,
            path = %path.display(),
            "Loaded checkpoint"
        );
        Ok(checkpoint)
    }

    /// Preemption checkpoints in the weights folder, ordered by index.
    pub fn hpc_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.weights_dir.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<(usize, PathBuf)> = fs::read_dir(&self.weights_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let index = name
                    .strip_prefix(HPC_PREFIX)?
                    .strip_suffix(".ckpt")?
                    .parse::<usize>()
                    .ok()?;
                Some((index, entry.path()))
            })
            .collect();
        found.sort_by_key(|(index, _)| *index);
        Ok(found)
    }

    /// Most recent preemption checkpoint.
    pub fn latest_hpc(&self) -> Result<Option<PathBuf>> {
        Ok(self.hpc_checkpoints()?.pop().map(|(_, path)| path))
    }

    /// Path the next preemption checkpoint is written to.
    pub fn next_hpc_path(&self) -> Result<PathBuf> {
        let next = self
            .hpc_checkpoints()?
            .last()
            .map_or(1, |(index, _)| index + 1);
        Ok(self
            .weights_dir
            .join(format!("{HPC_PREFIX}{next}.{CKPT_EXTENSION}")))
    }

    /// Write a preemption checkpoint. Returns its path on rank zero.
    pub fn hpc_save(&self, checkpoint: &Checkpoint) -> Result<Option<PathBuf>> {
        if !self.rank_zero {
            return Ok(None);
        }
        let path = self.next_hpc_path()?;
        self.save(checkpoint, &path)?;
        Ok(Some(path))
    }

    /// Checkpoint to restore at the start of a run: the latest preemption
    /// checkpoint, else `resume_from`.
    pub fn restore_path(&self, resume_from: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(hpc) = self.latest_hpc()? {
            return Ok(Some(hpc));
        }
        match resume_from {
            Some(path) if path.exists() => Ok(Some(path.to_path_buf())),
            Some(path) => Err(KilnError::misconfigured(
                "resume_from_checkpoint",
                format!("checkpoint {} does not exist", path.display()),
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        let mut ckpt = Checkpoint::new(3, 120, json!({"w": [1.0, 2.0]}));
        ckpt.optimizer_states.push(json!({"lr": 0.1}));
        ckpt.checkpoint_callback_best = Some(0.25);
        ckpt
    }

    #[test]
    fn test_checkpoint_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("epoch=3.ckpt");
        sample().write(&path).unwrap();
        let loaded = Checkpoint::read(&path).unwrap();
        assert_eq!(loaded, sample_with_time(&loaded));
        assert!(!path.with_extension("ckpt.part").exists());
    }

    fn sample_with_time(other: &Checkpoint) -> Checkpoint {
        Checkpoint {
            timestamp: other.timestamp.clone(),
            ..sample()
        }
    }

    #[test]
    fn test_non_zero_rank_skips_write() {
        let dir = TempDir::new().unwrap();
        let mut io = CheckpointIo::new(dir.path());
        io.set_rank_zero(false);
        let path = dir.path().join("a.ckpt");
        assert!(!io.save(&sample(), &path).unwrap());
        assert!(!path.exists());
        assert!(io.hpc_save(&sample()).unwrap().is_none());
    }

    #[test]
    fn test_hpc_numbering_and_precedence() {
        let dir = TempDir::new().unwrap();
        let io = CheckpointIo::new(dir.path());
        assert_eq!(io.next_hpc_path().unwrap(), dir.path().join("hpc_ckpt_1.ckpt"));

        let first = io.hpc_save(&sample()).unwrap().unwrap();
        let second = io.hpc_save(&sample()).unwrap().unwrap();
        assert!(first.ends_with("hpc_ckpt_1.ckpt"));
        assert!(second.ends_with("hpc_ckpt_2.ckpt"));

        let resume = dir.path().join("resume.ckpt");
        sample().write(&resume).unwrap();
        assert_eq!(io.restore_path(Some(&resume)).unwrap(), Some(second));
    }

    #[test]
    fn test_restore_path_missing_resume() {
        let dir = TempDir::new().unwrap();
        let io = CheckpointIo::new(dir.path());
        assert_eq!(io.restore_path(None).unwrap(), None);
        let err = io
            .restore_path(Some(&dir.path().join("missing.ckpt")))
            .unwrap_err();
        assert!(err.is_misconfiguration());
    }
}
