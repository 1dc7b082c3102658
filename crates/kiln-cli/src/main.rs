//! kiln CLI - inspect trainer configurations, clusters and checkpoints.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_core::{ResolvedConfig, TrainerConfig, WarningCache};
use kiln_distributed::ClusterEnvironment;
use kiln_trainer::{Checkpoint, DeviceInventory, ExecutionStrategy};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Training-loop orchestration tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate or print trainer configurations
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the detected cluster environment and devices
    Env {
        /// Also resolve the execution strategy for this configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Inspect checkpoint files
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Resolve and validate a YAML configuration
    Validate {
        /// Configuration file
        file: PathBuf,
    },
    /// Print the resolved configuration as YAML
    Show {
        /// Configuration file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print progress, hyperparameters and state sizes
    Inspect {
        /// Checkpoint file
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Validate { file } => validate_config(&file),
            ConfigAction::Show { file } => show_config(&file),
        },
        Commands::Env { config } => show_env(config.as_deref()),
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Inspect { file } => inspect_checkpoint(&file),
        },
    }
}

fn load_config(path: &Path) -> anyhow::Result<ResolvedConfig> {
    let mut resolved = TrainerConfig::from_yaml_file(path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))?;
    resolved.config.apply_fast_dev_run();
    Ok(resolved)
}

fn validate_config(path: &Path) -> anyhow::Result<()> {
    let resolved = load_config(path)?;
    for warning in &resolved.warnings {
        println!("warning: {}", warning.message);
    }
    println!(
        "{} is valid ({} compatibility warning{})",
        path.display(),
        resolved.warnings.len(),
        if resolved.warnings.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

fn show_config(path: &Path) -> anyhow::Result<()> {
    let resolved = load_config(path)?;
    print!("{}", serde_yaml::to_string(&resolved.config)?);
    Ok(())
}

fn show_env(config: Option<&Path>) -> anyhow::Result<()> {
    let env = ClusterEnvironment::from_process_env();
    let inventory = DeviceInventory::detect(&env);

    println!("Cluster environment");
    println!("  master address:   {}", env.master_addr());
    println!("  master port:      {}", env.master_port()?);
    println!("  node rank:        {}", env.node_rank()?);
    println!(
        "  local rank:       {}",
        env.local_rank()?.map_or_else(|| "-".to_string(), |r| r.to_string())
    );
    println!("  SLURM job:        {}", env.slurm_job_id().unwrap_or("-"));
    println!("  spawned worker:   {}", env.is_spawned_worker());
    println!("Devices");
    println!("  GPUs:             {}", inventory.gpus);
    println!("  TPU cores:        {}", inventory.tpu_cores);

    if let Some(path) = config {
        let resolved = load_config(path)?;
        let warnings = WarningCache::new();
        let strategy = ExecutionStrategy::resolve(&resolved.config, &inventory, &env, &warnings)?;
        println!("Strategy for {}", path.display());
        println!("  launcher:         {}", strategy.kind());
        println!("  world size:       {}", strategy.world_size());
        println!("  procs per node:   {}", strategy.procs_per_node());
        println!("  precision:        {}", strategy.precision().bits());
        for warning in warnings.emitted() {
            println!("  warning: {}", warning);
        }
    }
    Ok(())
}

fn inspect_checkpoint(path: &Path) -> anyhow::Result<()> {
    let checkpoint = Checkpoint::read(path)?;
    let model_bytes = serde_json::to_vec(&checkpoint.model_state)?.len();
    let optimizer_bytes: usize = checkpoint
        .optimizer_states
        .iter()
        .map(|s| serde_json::to_vec(s).map(|b| b.len()))
        .sum::<Result<usize, _>>()?;

    println!("Checkpoint {}", path.display());
    println!("  written by:       kiln {}", checkpoint.kiln_version);
    println!("  timestamp:        {}", checkpoint.timestamp);
    println!("  epoch:            {}", checkpoint.epoch);
    println!("  global step:      {}", checkpoint.global_step);
    println!("  model state:      {}", format_bytes(model_bytes));
    println!(
        "  optimizers:       {} ({})",
        checkpoint.optimizer_states.len(),
        format_bytes(optimizer_bytes)
    );
    println!("  lr schedulers:    {}", checkpoint.lr_schedulers.len());
    if let Some(best) = checkpoint.checkpoint_callback_best {
        println!("  best monitored:   {}", best);
    }
    if let Some(es) = &checkpoint.early_stopping {
        println!("  early stopping:   wait {}/{}", es.wait, es.patience);
    }
    if !checkpoint.extra.is_empty() {
        let keys: Vec<&str> = checkpoint.extra.keys().map(String::as_str).collect();
        println!("  extra keys:       {}", keys.join(", "));
    }
    if let Some(hparams) = &checkpoint.hparams {
        println!("Hyperparameters");
        println!("{}", serde_json::to_string_pretty(hparams)?);
    }
    Ok(())
}

fn format_bytes(bytes: usize) -> String {
    if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1e6)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1e3)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["kiln", "config", "validate", "run.yaml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Validate { .. }
            }
        ));

        let cli = Cli::try_parse_from(["kiln", "env", "--config", "run.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Env { config: Some(_) }));

        assert!(Cli::try_parse_from(["kiln", "checkpoint"]).is_err());
    }

    #[test]
    fn test_load_config_resolves_aliases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, "gradient_clip: 0.5\nmax_nb_epochs: 4\n").unwrap();

        let resolved = load_config(&path).unwrap();
        assert_eq!(resolved.config.gradient_clip_val, 0.5);
        assert_eq!(resolved.config.max_epochs, Some(4));
        assert_eq!(resolved.warnings.len(), 2);
        assert!(validate_config(&path).is_ok());
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "precision: 8\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("precision"));
    }

    #[test]
    fn test_inspect_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("epoch=2.ckpt");
        Checkpoint::new(3, 42, serde_json::json!({"w": [1.0, 2.0]}))
            .write(&path)
            .unwrap();

        assert!(inspect_checkpoint(&path).is_ok());
        assert!(inspect_checkpoint(&dir.path().join("missing.ckpt")).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(2_500), "2.5 KB");
        assert_eq!(format_bytes(3_200_000), "3.2 MB");
    }
}
