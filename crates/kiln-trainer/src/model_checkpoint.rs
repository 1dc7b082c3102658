//! Top-k checkpoint policy.
//!
//! After each validation pass the monitored metric is compared against the
//! k best checkpoints kept so far. A better value is saved and the worst of
//! the kept files evicted once k files exist.

use kiln_core::{KilnError, Metrics, Result, WarningCache};
use std::fs;
use std::path::{Path, PathBuf};

/// Direction of improvement for a monitored metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorMode {
    /// Lower is better.
    Min,
    /// Higher is better.
    Max,
    /// `Max` for accuracy-like names, `Min` otherwise.
    #[default]
    Auto,
}

impl MonitorMode {
    /// Resolve `Auto` against a metric name.
    pub fn resolve(self, monitor: &str) -> MonitorMode {
        match self {
            Self::Auto if monitor.contains("acc") || monitor.starts_with("fmeasure") => Self::Max,
            Self::Auto => Self::Min,
            other => other,
        }
    }

    /// Whether `current` is strictly better than `reference`.
    pub fn improves(self, current: f64, reference: f64) -> bool {
        match self {
            Self::Max => current > reference,
            _ => current < reference,
        }
    }

    /// The worst possible value.
    pub fn worst(self) -> f64 {
        match self {
            Self::Max => f64::NEG_INFINITY,
            _ => f64::INFINITY,
        }
    }
}

impl std::str::FromStr for MonitorMode {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "auto" => Ok(Self::Auto),
            other => Err(KilnError::misconfigured(
                "mode",
                format!("must be one of min, max, auto; got {other}"),
            )),
        }
    }
}

/// Saves the best `save_top_k` checkpoints by a monitored metric.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    dirpath: Option<PathBuf>,
    monitor: String,
    save_top_k: i64,
    mode: MonitorMode,
    period: usize,
    prefix: String,
    filename: Option<String>,
    verbose: bool,
    best_k_models: Vec<(PathBuf, f64)>,
    kth_best_model: Option<PathBuf>,
    best: f64,
    epoch_last_check: Option<usize>,
}

impl Default for ModelCheckpoint {
    fn default() -> Self {
        Self::new("val_loss")
    }
}

impl ModelCheckpoint {
    /// Keep the single best checkpoint by `monitor`.
    pub fn new(monitor: impl Into<String>) -> Self {
        let monitor = monitor.into();
        let mode = MonitorMode::Auto.resolve(&monitor);
        Self {
            dirpath: None,
            monitor,
            save_top_k: 1,
            mode,
            period: 1,
            prefix: String::new(),
            filename: None,
            verbose: false,
            best_k_models: Vec::new(),
            kth_best_model: None,
            best: mode.worst(),
            epoch_last_check: None,
        }
    }

    /// Directory checkpoints are written to.
    pub fn dirpath(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dirpath = Some(dir.into());
        self
    }

    /// Number of checkpoints kept: 0 never saves, -1 saves every check.
    pub fn save_top_k(mut self, k: i64) -> Self {
        self.save_top_k = k;
        self
    }

    /// Comparison mode.
    pub fn mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode.resolve(&self.monitor);
        self.best = self.mode.worst();
        self
    }

    /// Minimum epochs between checks.
    pub fn period(mut self, period: usize) -> Self {
        self.period = period;
        self
    }

    /// Prefix for every file name.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// File name template, e.g. `"{epoch}-{val_loss:.2f}"`.
    pub fn filename(mut self, template: impl Into<String>) -> Self {
        self.filename = Some(template.into());
        self
    }

    /// Log every decision.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Configured directory.
    pub fn dir(&self) -> Option<&Path> {
        self.dirpath.as_deref()
    }

    /// Set the directory if none was configured.
    pub fn set_default_dir(&mut self, dir: PathBuf) {
        if self.dirpath.is_none() {
            self.dirpath = Some(dir);
        }
    }

    /// Monitored metric.
    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    /// Best monitored value so far.
    pub fn best(&self) -> Option<f64> {
        self.best.is_finite().then_some(self.best)
    }

    /// Restore the best value from a checkpoint.
    pub fn restore_best(&mut self, best: f64) {
        self.best = best;
    }

    /// Kept checkpoints and their scores.
    pub fn best_k_models(&self) -> &[(PathBuf, f64)] {
        &self.best_k_models
    }

    /// Worst of the kept checkpoints once `save_top_k` are kept.
    pub fn kth_best_model(&self) -> Option<&Path> {
        self.kth_best_model.as_deref()
    }

    /// File name for a check at `epoch`, with an optional collision suffix.
    pub fn format_checkpoint_name(&self, epoch: usize, metrics: &Metrics, version: Option<usize>) -> String {
        let template = self.filename.as_deref().unwrap_or("{epoch}");
        let mut name = String::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            name.push_str(&rest[..open]);
            let Some(close) = rest[open..].find('}') else {
                name.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let field = &rest[open + 1..open + close];
            let (key, spec) = match field.split_once(':') {
                Some((key, spec)) => (key, Some(spec)),
                None => (field, None),
            };
            let value = if key == "epoch" {
                Some(epoch as f64)
            } else {
                metrics.get(key).copied()
            };
            name.push_str(key);
            name.push('=');
            name.push_str(&render(value.unwrap_or(0.0), key == "epoch", spec));
            rest = &rest[open + close + 1..];
        }
        name.push_str(rest);
        let version = version.map(|v| format!("_v{v}")).unwrap_or_default();
        format!("{}{}{}.ckpt", self.prefix, name, version)
    }

    fn dir_or_cwd(&self) -> PathBuf {
        self.dirpath.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Checkpoint path for `epoch`, avoiding existing files.
    fn next_filepath(&self, epoch: usize, metrics: &Metrics) -> PathBuf {
        let dir = self.dir_or_cwd();
        let mut path = dir.join(self.format_checkpoint_name(epoch, metrics, None));
        let mut version = 0;
        while path.exists() {
            path = dir.join(self.format_checkpoint_name(epoch, metrics, Some(version)));
            version += 1;
        }
        path
    }

    fn check_monitor_top_k(&self, current: f64) -> bool {
        if (self.best_k_models.len() as i64) < self.save_top_k {
            return true;
        }
        let Some(kth) = &self.kth_best_model else {
            return true;
        };
        let kth_value = self
            .best_k_models
            .iter()
            .find(|(p, _)| p == kth)
            .map_or(self.mode.worst(), |(_, v)| *v);
        self.mode.improves(current, kth_value)
    }

    /// Run a check with the current metrics.
    ///
    /// `save` writes a checkpoint to the given path and receives the best
    /// value after this check. Returns the path written, if any.
    pub fn on_validation_end<F>(
        &mut self,
        epoch: usize,
        metrics: &Metrics,
        warnings: &WarningCache,
        mut save: F,
    ) -> Result<Option<PathBuf>>
    where
        F: FnMut(&Path, Option<f64>) -> Result<()>,
    {
        if self.save_top_k == 0 {
            return Ok(None);
        }
        if let Some(last) = self.epoch_last_check {
            if epoch.saturating_sub(last) < self.period {
                return Ok(None);
            }
        }
        self.epoch_last_check = Some(epoch);

        let filepath = self.next_filepath(epoch, metrics);

        if self.save_top_k == -1 {
            if let Some(current) = metrics.get(&self.monitor) {
                if self.mode.improves(*current, self.best) {
                    self.best = *current;
                }
            }
            save(&filepath, self.best())?;
            return Ok(Some(filepath));
        }

        let Some(current) = metrics.get(&self.monitor).copied() else {
            warnings.warn(format!(
                "Can save best model only with {} available, skipping.",
                self.monitor
            ));
            return Ok(None);
        };

        if !self.check_monitor_top_k(current) {
            if self.verbose {
                tracing::info!(
                    epoch,
                    monitor = %self.monitor,
                    k = self.save_top_k,
                    "Monitored metric was not in top k"
                );
            }
            return Ok(None);
        }

        self.do_check_save(&filepath, current, epoch, &mut save)?;
        Ok(Some(filepath))
    }

    fn do_check_save<F>(&mut self, filepath: &Path, current: f64, epoch: usize, save: &mut F) -> Result<()>
    where
        F: FnMut(&Path, Option<f64>) -> Result<()>,
    {
        let mut evicted = Vec::new();
        if self.best_k_models.len() as i64 == self.save_top_k {
            if let Some(kth) = self.kth_best_model.take() {
                self.best_k_models.retain(|(p, _)| *p != kth);
                evicted.push(kth);
            }
        }

        self.best_k_models.push((filepath.to_path_buf(), current));
        if self.best_k_models.len() as i64 == self.save_top_k {
            let worst = self.best_k_models.iter().fold(None, |acc: Option<&(PathBuf, f64)>, entry| {
                match acc {
                    Some(w) if !self.mode.improves(w.1, entry.1) => Some(w),
                    _ => Some(entry),
                }
            });
            self.kth_best_model = worst.map(|(p, _)| p.clone());
        }

        self.best = self
            .best_k_models
            .iter()
            .map(|(_, v)| *v)
            .fold(self.mode.worst(), |best, v| {
                if self.mode.improves(v, best) {
                    v
                } else {
                    best
                }
            });

        if self.verbose {
            tracing::info!(
                epoch,
                monitor = %self.monitor,
                value = current,
                path = %filepath.display(),
                "Monitored metric reached a top-k value, saving"
            );
        }
        let best = self.best();
        save(filepath, best)?;

        for path in evicted {
            if path != filepath {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("Failed to remove checkpoint {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }
}

fn render(value: f64, integer: bool, spec: Option<&str>) -> String {
    if let Some(precision) = spec
        .and_then(|s| s.strip_prefix('.'))
        .and_then(|s| s.trim_end_matches('f').parse::<usize>().ok())
    {
        return format!("{value:.precision$}");
    }
    if integer {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
