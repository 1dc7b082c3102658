//! Multi-rank runs over an in-process group.
//!
//! Each rank is a thread with its own trainer and module, joined through
//! [`InProcessGroup`] so collectives behave as they would across processes.

mod common;

use common::*;
use kiln_core::{RunStatus, TrainerConfig};
use kiln_distributed::{InProcessGroup, ProcessGroup};
use kiln_trainer::{DataLoaders, InterruptHandle, ModelCheckpoint};
use std::path::Path;
use std::thread;
use tempfile::TempDir;

struct RankReport {
    rank: usize,
    status: RunStatus,
    epoch: usize,
    step: usize,
    should_stop: bool,
    interrupted: bool,
}

fn run_ranks<F>(world_size: usize, config: TrainerConfig, dir: &Path, setup: F) -> Vec<RankReport>
where
    F: Fn(usize, &InterruptHandle) -> ToyModule + Send + Sync + Copy + 'static,
{
    let handles: Vec<_> = InProcessGroup::create(world_size)
        .into_iter()
        .enumerate()
        .map(|(rank, backend)| {
            let config = config.clone();
            let dir = dir.to_path_buf();
            thread::spawn(move || {
                let interrupt = InterruptHandle::new();
                let mut trainer = isolated()
                    .config(config)
                    .interrupt_handle(interrupt.clone())
                    .checkpoint_callback(ModelCheckpoint::new("loss").save_top_k(-1).dirpath(dir))
                    .build()
                    .unwrap();
                let mut model = setup(rank, &interrupt);
                let group = ProcessGroup::new(Box::new(backend)).unwrap();
                let status = trainer
                    .fit_with_group(&mut model, DataLoaders::none(), group)
                    .unwrap();
                RankReport {
                    rank,
                    status,
                    epoch: trainer.current_epoch(),
                    step: trainer.global_step(),
                    should_stop: trainer.state().should_stop,
                    interrupted: trainer.interrupted(),
                }
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn checkpoint_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "ckpt"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn test_only_rank_zero_writes_checkpoints() {
    let dir = TempDir::new().unwrap();
    let ckpt_dir = dir.path().join("ckpts");
    let mut config = quiet_config(dir.path());
    config.max_epochs = Some(2);

    let reports = run_ranks(2, config, &ckpt_dir, |_, _| ToyModule::new(3));

    for report in &reports {
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.step, 6);
    }
    // one checkpoint per epoch, all from rank zero
    assert_eq!(checkpoint_files(&ckpt_dir), 2);
}

#[test]
fn test_stop_on_one_rank_stops_all() {
    let dir = TempDir::new().unwrap();
    let ckpt_dir = dir.path().join("ckpts");
    let mut config = quiet_config(dir.path());
    config.max_epochs = Some(5);

    let reports = run_ranks(2, config, &ckpt_dir, |rank, interrupt| {
        let mut model = ToyModule::new(4);
        if rank == 1 {
            model.interrupt_at = Some((1, interrupt.clone()));
        }
        model
    });

    let rank0 = reports.iter().find(|r| r.rank == 0).unwrap();
    let rank1 = reports.iter().find(|r| r.rank == 1).unwrap();

    assert_eq!(rank1.status, RunStatus::Interrupted);
    assert!(rank1.interrupted);
    assert_eq!(rank1.step, 2);

    // rank zero finishes its epoch, then follows the stop decision
    assert_eq!(rank0.status, RunStatus::Success);
    assert!(rank0.should_stop);
    assert_eq!(rank0.epoch, 0);
    assert_eq!(rank0.step, 4);
}
