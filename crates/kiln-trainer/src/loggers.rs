//! Experiment loggers.
//!
//! - [`JsonlLogger`] - one JSON object per line, the default logger
//! - [`LoggerCollection`] - fan-out to several loggers
//!
//! The JSONL output can be imported into most tracking tools:
//!
//! ```json
//! {"step": 0, "epoch": 0, "loss": 2.5, "timestamp": "2024-12-31T12:00:00+00:00"}
//! {"step": 10, "epoch": 0, "loss": 2.3, "timestamp": "2024-12-31T12:00:01+00:00"}
//! ```

use kiln_core::{Logger, Metrics, Result, RunStatus};
use serde_json::{json, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Forwards every call to each member, in order.
pub struct LoggerCollection {
    loggers: Vec<Box<dyn Logger>>,
}

impl LoggerCollection {
    /// Wrap several loggers.
    pub fn new(loggers: Vec<Box<dyn Logger>>) -> Self {
        Self { loggers }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    /// Whether there are no members.
    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl Logger for LoggerCollection {
    fn log_hyperparams(&mut self, params: &Value) -> Result<()> {
        for logger in &mut self.loggers {
            logger.log_hyperparams(params)?;
        }
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &Metrics, step: usize) -> Result<()> {
        for logger in &mut self.loggers {
            logger.log_metrics(metrics, step)?;
        }
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        for logger in &mut self.loggers {
            logger.save()?;
        }
        Ok(())
    }

    fn finalize(&mut self, status: RunStatus) -> Result<()> {
        for logger in &mut self.loggers {
            logger.finalize(status)?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.loggers
            .iter()
            .map(|l| l.name())
            .collect::<Vec<_>>()
            .join("_")
    }

    fn version(&self) -> String {
        self.loggers
            .iter()
            .map(|l| l.version())
            .collect::<Vec<_>>()
            .join("_")
    }

    fn save_dir(&self) -> Option<PathBuf> {
        self.loggers.iter().find_map(|l| l.save_dir())
    }
}

/// JSONL metrics logger.
///
/// Writes `<save_dir>/<name>/version_<n>/metrics.jsonl` and, on save,
/// `hparams.json` next to it. Nothing touches the filesystem until the
/// first write, so constructing one on every rank is harmless.
pub struct JsonlLogger {
    save_dir: PathBuf,
    name: String,
    version: usize,
    writer: Option<BufWriter<File>>,
    hparams: Option<Value>,
}

/// Default experiment name.
pub const DEFAULT_EXPERIMENT_NAME: &str = "default";

impl JsonlLogger {
    /// Logger for the next free version of `name` under `save_dir`.
    pub fn new(save_dir: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let save_dir = save_dir.as_ref().to_path_buf();
        let name = name.into();
        let version = next_version(&save_dir.join(&name))?;
        Ok(Self {
            save_dir,
            name,
            version,
            writer: None,
            hparams: None,
        })
    }

    /// Pin an explicit version.
    pub fn with_version(mut self, version: usize) -> Self {
        self.version = version;
        self
    }

    /// Directory of this experiment version.
    pub fn log_dir(&self) -> PathBuf {
        self.save_dir
            .join(&self.name)
            .join(format!("version_{}", self.version))
    }

    /// Path of the metrics file.
    pub fn metrics_path(&self) -> PathBuf {
        self.log_dir().join("metrics.jsonl")
    }

    fn open(&self) -> Result<BufWriter<File>> {
        let dir = self.log_dir();
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        Ok(BufWriter::new(file))
    }

    fn write_entry(&mut self, entry: &Value) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        if self.writer.is_none() {
            self.writer = Some(self.open()?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", line)?;
        }
        Ok(())
    }
}

fn next_version(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let max = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_prefix("version_")?.parse::<usize>().ok()
        })
        .max();
    Ok(max.map_or(0, |v| v + 1))
}

impl Logger for JsonlLogger {
    fn log_hyperparams(&mut self, params: &Value) -> Result<()> {
        self.hparams = Some(params.clone());
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &Metrics, step: usize) -> Result<()> {
        let mut entry = json!({
            "step": step,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        for (key, value) in metrics {
            entry[key.as_str()] = json!(value);
        }
        self.write_entry(&entry)
    }

    fn save(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        if let Some(hparams) = &self.hparams {
            let dir = self.log_dir();
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("hparams.json"), serde_json::to_string_pretty(hparams)?)?;
        }
        Ok(())
    }

    fn finalize(&mut self, status: RunStatus) -> Result<()> {
        self.write_entry(&json!({
            "event": "finalize",
            "status": status.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))?;
        self.save()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> String {
        self.version.to_string()
    }

    fn save_dir(&self) -> Option<PathBuf> {
        Some(self.save_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_logger_writes_rows() {
        let dir = TempDir::new().unwrap();
        let mut logger = JsonlLogger::new(dir.path(), "exp").unwrap();
        assert_eq!(logger.version(), "0");
        assert!(!logger.log_dir().exists());

        logger
            .log_hyperparams(&json!({"lr": 0.01}))
            .unwrap();
        logger
            .log_metrics(&Metrics::from([("loss".to_string(), 0.5)]), 3)
            .unwrap();
        logger.finalize(RunStatus::Success).unwrap();

        let text = fs::read_to_string(logger.metrics_path()).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 3);
        assert_eq!(lines[0]["loss"], 0.5);
        assert_eq!(lines[1]["status"], "success");
        assert!(logger.log_dir().join("hparams.json").exists());
    }

    #[test]
    fn test_versions_increment() {
        let dir = TempDir::new().unwrap();
        let mut first = JsonlLogger::new(dir.path(), "exp").unwrap();
        first.log_metrics(&Metrics::new(), 0).unwrap();
        first.save().unwrap();
        let second = JsonlLogger::new(dir.path(), "exp").unwrap();
        assert_eq!(second.version(), "1");
    }

    #[test]
    fn test_collection_joins_names() {
        let dir = TempDir::new().unwrap();
        let a = JsonlLogger::new(dir.path(), "a").unwrap();
        let b = JsonlLogger::new(dir.path(), "b").unwrap().with_version(4);
        let collection = LoggerCollection::new(vec![Box::new(a), Box::new(b)]);
        assert_eq!(collection.name(), "a_b");
        assert_eq!(collection.version(), "0_4");
        assert_eq!(collection.len(), 2);
    }
}
