//! Trainer configuration.

use crate::deprecated::{self, resolve_aliases};
use crate::error::{KilnError, Result};
use crate::types::Precision;
use crate::warnings::{CompatibilityWarning, WarningCache};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Gradient accumulation factor, fixed or scheduled by epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AccumulateGradBatches {
    /// Same factor for every epoch.
    Fixed(usize),
    /// Epoch (0-based) to factor. The largest key not above the current
    /// epoch applies; epochs before the first key use a factor of 1.
    Schedule(BTreeMap<usize, usize>),
}

impl Default for AccumulateGradBatches {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

// Epoch keys arrive as strings from JSON objects and as integers from YAML,
// which an untagged derive cannot reconcile.
impl<'de> Deserialize<'de> for AccumulateGradBatches {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FactorVisitor;

        impl<'de> Visitor<'de> for FactorVisitor {
            type Value = AccumulateGradBatches;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or a mapping of epoch to integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(AccumulateGradBatches::Fixed(v as usize))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                usize::try_from(v)
                    .map(AccumulateGradBatches::Fixed)
                    .map_err(|_| E::custom(format!("accumulation factor must be positive, got {v}")))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut schedule = BTreeMap::new();
                while let Some((key, factor)) = map.next_entry::<Value, usize>()? {
                    let epoch = match &key {
                        Value::Number(n) => n.as_u64().map(|n| n as usize),
                        Value::String(s) => s.trim().parse().ok(),
                        _ => None,
                    }
                    .ok_or_else(|| de::Error::custom(format!("invalid epoch key {key}")))?;
                    schedule.insert(epoch, factor);
                }
                Ok(AccumulateGradBatches::Schedule(schedule))
            }
        }

        deserializer.deserialize_any(FactorVisitor)
    }
}

/// How often validation runs inside a training epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValCheckInterval {
    /// Every N training batches.
    Batches(u64),
    /// Fraction of an epoch, in (0, 1].
    Fraction(f64),
}

impl Default for ValCheckInterval {
    fn default() -> Self {
        Self::Fraction(1.0)
    }
}

/// Multi-device training mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributedMode {
    /// Single process, model replicated over local devices.
    #[serde(rename = "dp")]
    Dp,
    /// One process per device.
    #[serde(rename = "ddp")]
    Ddp,
    /// One process per node, data-parallel inside the node.
    #[serde(rename = "ddp2")]
    Ddp2,
}

impl DistributedMode {
    /// Option value as written in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dp => "dp",
            Self::Ddp => "ddp",
            Self::Ddp2 => "ddp2",
        }
    }
}

/// Depth of the module summary logged when training starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightsSummary {
    /// Every layer or parameter group.
    Full,
    /// Top-level entries only.
    Top,
}

/// Requested GPUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GpuSelection {
    /// `0` for none, `-1` for all, `n` for the first n devices.
    Count(i64),
    /// Explicit device indices.
    Ids(Vec<usize>),
    /// Comma separated indices (`"0,2"`), `"-1"`, or a count (`"3"`).
    Text(String),
}

/// Every recognized trainer option.
///
/// Built once, validated, and not mutated afterwards except through the
/// deprecated alias table at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    /// Upper bound on epochs. `None` trains until `max_steps`.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: Option<usize>,

    /// Early stopping cannot end the run before this many epochs.
    #[serde(default = "default_min_epochs")]
    pub min_epochs: usize,

    /// Upper bound on optimizer steps.
    #[serde(default)]
    pub max_steps: Option<usize>,

    /// Early stopping cannot end the run before this many optimizer steps.
    #[serde(default)]
    pub min_steps: Option<usize>,

    /// Batches whose gradients are accumulated per optimizer step.
    #[serde(default)]
    pub accumulate_grad_batches: AccumulateGradBatches,

    /// Max gradient norm, 0 disables clipping.
    #[serde(default)]
    pub gradient_clip_val: f64,

    /// Fraction of training batches used per epoch.
    #[serde(default = "default_percent")]
    pub train_percent_check: f64,

    /// Fraction of validation batches used per validation pass.
    #[serde(default = "default_percent")]
    pub val_percent_check: f64,

    /// Fraction of test batches used.
    #[serde(default = "default_percent")]
    pub test_percent_check: f64,

    /// Overrides all three percent checks and disables shuffling when > 0.
    #[serde(default)]
    pub overfit_pct: f64,

    /// How often to validate within an epoch.
    #[serde(default)]
    pub val_check_interval: ValCheckInterval,

    /// Validate every N epochs.
    #[serde(default = "default_one")]
    pub check_val_every_n_epoch: usize,

    /// Validation batches run before training starts.
    #[serde(default = "default_num_sanity_val_steps")]
    pub num_sanity_val_steps: usize,

    /// Multi-device mode.
    #[serde(default)]
    pub distributed_backend: Option<DistributedMode>,

    /// GPUs to train on.
    #[serde(default)]
    pub gpus: Option<GpuSelection>,

    /// Number of nodes.
    #[serde(default = "default_one")]
    pub num_nodes: usize,

    /// TPU cores, 1 or 8.
    #[serde(default)]
    pub num_tpu_cores: Option<u32>,

    /// Floating point precision, 16 or 32.
    #[serde(default = "default_precision")]
    pub precision: u32,

    /// Run one batch of train, val and test as a self-check.
    #[serde(default)]
    pub fast_dev_run: bool,

    /// Rebuild dataloaders at the start of every epoch.
    #[serde(default)]
    pub reload_dataloaders_every_epoch: bool,

    /// Checkpoint to restore before training.
    #[serde(default)]
    pub resume_from_checkpoint: Option<PathBuf>,

    /// Compute and aggregate logged metrics every N batches.
    #[serde(default = "default_row_log_interval")]
    pub row_log_interval: usize,

    /// Flush buffered metrics to loggers every N batches.
    #[serde(default = "default_log_save_interval")]
    pub log_save_interval: usize,

    /// Progress reporting interval in batches, 0 disables.
    #[serde(default = "default_one")]
    pub progress_bar_refresh_rate: usize,

    /// `false` disables early stopping, `true` enables a strict default,
    /// `null` enables a lenient default.
    #[serde(default = "default_early_stop_callback")]
    pub early_stop_callback: Option<bool>,

    /// Enable the default top-k checkpoint policy.
    #[serde(default = "default_true")]
    pub checkpoint_callback: bool,

    /// Enable the default file logger.
    #[serde(default = "default_true")]
    pub logger: bool,

    /// Root for logs and checkpoints. Defaults to the working directory.
    #[serde(default)]
    pub default_save_path: Option<PathBuf>,

    /// Root for checkpoints only. Defaults to `default_save_path`.
    #[serde(default)]
    pub weights_save_path: Option<PathBuf>,

    /// Gradient norm order to log, -1 disables.
    #[serde(default = "default_track_grad_norm")]
    pub track_grad_norm: i32,

    /// Module summary logged by rank zero before training, `null` disables.
    #[serde(default = "default_weights_summary")]
    pub weights_summary: Option<WeightsSummary>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            min_epochs: default_min_epochs(),
            max_steps: None,
            min_steps: None,
            accumulate_grad_batches: AccumulateGradBatches::default(),
            gradient_clip_val: 0.0,
            train_percent_check: default_percent(),
            val_percent_check: default_percent(),
            test_percent_check: default_percent(),
            overfit_pct: 0.0,
            val_check_interval: ValCheckInterval::default(),
            check_val_every_n_epoch: default_one(),
            num_sanity_val_steps: default_num_sanity_val_steps(),
            distributed_backend: None,
            gpus: None,
            num_nodes: default_one(),
            num_tpu_cores: None,
            precision: default_precision(),
            fast_dev_run: false,
            reload_dataloaders_every_epoch: false,
            resume_from_checkpoint: None,
            row_log_interval: default_row_log_interval(),
            log_save_interval: default_log_save_interval(),
            progress_bar_refresh_rate: default_one(),
            early_stop_callback: default_early_stop_callback(),
            checkpoint_callback: true,
            logger: true,
            default_save_path: None,
            weights_save_path: None,
            track_grad_norm: default_track_grad_norm(),
            weights_summary: default_weights_summary(),
        }
    }
}

/// A validated configuration plus the compatibility warnings raised while
/// resolving deprecated aliases.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The configuration.
    pub config: TrainerConfig,
    /// One entry per deprecated alias used.
    pub warnings: Vec<CompatibilityWarning>,
}

impl TrainerConfig {
    /// Build a configuration from keyword-style options.
    ///
    /// Deprecated keys are rewritten through the alias table first, then
    /// the result is deserialized and validated.
    pub fn from_options(mut options: Map<String, Value>) -> Result<ResolvedConfig> {
        let warnings = resolve_aliases(&mut options)?;
        let config: TrainerConfig = serde_json::from_value(Value::Object(options))
            .map_err(|e| KilnError::misconfigured("trainer options", e.to_string()))?;
        config.validate()?;
        Ok(ResolvedConfig { config, warnings })
    }

    /// Parse a YAML document of options.
    pub fn from_yaml_str(yaml: &str) -> Result<ResolvedConfig> {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let options = match serde_json::to_value(doc)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(KilnError::misconfigured(
                    "trainer options",
                    format!("expected a mapping of options, got {other}"),
                ))
            }
        };
        Self::from_options(options)
    }

    /// Load options from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<ResolvedConfig> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Check every configuration invariant.
    pub fn validate(&self) -> Result<()> {
        Precision::try_from(self.precision)?;

        if let Some(cores) = self.num_tpu_cores {
            if cores != 1 && cores != 8 {
                return Err(KilnError::misconfigured(
                    "num_tpu_cores",
                    format!("can only be 1 or 8, got {cores}"),
                ));
            }
        }

        for (option, value) in [
            ("train_percent_check", self.train_percent_check),
            ("val_percent_check", self.val_percent_check),
            ("test_percent_check", self.test_percent_check),
            ("overfit_pct", self.overfit_pct),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(KilnError::misconfigured(
                    option,
                    format!("must be in [0.0, 1.0], got {value}"),
                ));
            }
        }

        match self.val_check_interval {
            ValCheckInterval::Fraction(f) if !(f > 0.0 && f <= 1.0) => {
                return Err(KilnError::misconfigured(
                    "val_check_interval",
                    format!("a fraction must be in (0.0, 1.0], got {f}"),
                ));
            }
            ValCheckInterval::Batches(0) => {
                return Err(KilnError::misconfigured(
                    "val_check_interval",
                    "an integer interval must be at least 1",
                ));
            }
            _ => {}
        }

        match &self.accumulate_grad_batches {
            AccumulateGradBatches::Fixed(0) => {
                return Err(KilnError::misconfigured(
                    "accumulate_grad_batches",
                    "must be at least 1",
                ));
            }
            AccumulateGradBatches::Schedule(schedule) => {
                if let Some((epoch, _)) = schedule.iter().find(|(_, factor)| **factor == 0) {
                    return Err(KilnError::misconfigured(
                        "accumulate_grad_batches",
                        format!("factor for epoch {epoch} must be at least 1"),
                    ));
                }
            }
            _ => {}
        }

        if self.gradient_clip_val < 0.0 {
            return Err(KilnError::misconfigured(
                "gradient_clip_val",
                format!("must be >= 0, got {}", self.gradient_clip_val),
            ));
        }

        for (option, value) in [
            ("row_log_interval", self.row_log_interval),
            ("log_save_interval", self.log_save_interval),
            ("check_val_every_n_epoch", self.check_val_every_n_epoch),
            ("num_nodes", self.num_nodes),
        ] {
            if value == 0 {
                return Err(KilnError::misconfigured(option, "must be at least 1"));
            }
        }

        if let Some(max_epochs) = self.max_epochs {
            if self.min_epochs > max_epochs {
                return Err(KilnError::misconfigured(
                    "min_epochs",
                    format!("must not exceed max_epochs ({max_epochs}), got {}", self.min_epochs),
                ));
            }
        }

        if let (Some(min), Some(max)) = (self.min_steps, self.max_steps) {
            if min > max {
                return Err(KilnError::misconfigured(
                    "min_steps",
                    format!("must not exceed max_steps ({max}), got {min}"),
                ));
            }
        }

        Ok(())
    }

    /// Rewrite the configuration for a single-batch self-check run.
    pub fn apply_fast_dev_run(&mut self) {
        if self.fast_dev_run {
            self.num_sanity_val_steps = 0;
            self.max_epochs = Some(1);
            self.min_epochs = self.min_epochs.min(1);
            self.max_steps = None;
            self.min_steps = None;
        }
    }

    /// Validated precision.
    pub fn precision(&self) -> Result<Precision> {
        Precision::try_from(self.precision)
    }

    /// Root directory for logs and checkpoints.
    pub fn save_root(&self) -> PathBuf {
        self.default_save_path
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Root directory for checkpoints.
    pub fn weights_root(&self) -> PathBuf {
        self.weights_save_path
            .clone()
            .unwrap_or_else(|| self.save_root())
    }

    /// Read an option by canonical or deprecated name.
    ///
    /// Deprecated names resolve through the alias table and warn once.
    pub fn option(&self, name: &str, warnings: &WarningCache) -> Option<Value> {
        if let Some(alias) = deprecated::lookup(name) {
            warnings.compat(&alias.warning());
        }
        let canonical = deprecated::canonical_name(name);
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get(canonical).cloned(),
            _ => None,
        }
    }
}

fn default_max_epochs() -> Option<usize> {
    Some(1000)
}

fn default_min_epochs() -> usize {
    1
}

fn default_percent() -> f64 {
    1.0
}

fn default_one() -> usize {
    1
}

fn default_num_sanity_val_steps() -> usize {
    5
}

fn default_precision() -> u32 {
    32
}

fn default_row_log_interval() -> usize {
    10
}

fn default_log_save_interval() -> usize {
    100
}

fn default_early_stop_callback() -> Option<bool> {
    Some(false)
}

fn default_true() -> bool {
    true
}

fn default_track_grad_norm() -> i32 {
    -1
}

fn default_weights_summary() -> Option<WeightsSummary> {
    Some(WeightsSummary::Full)
}
