//! Process groups and worker launching for kiln.
//!
//! The trainer loop is synchronous; collectives here are async and bridged
//! through [`ProcessGroup`], which owns a small runtime per process.
//!
//! # Backends
//!
//! - [`LocalBackend`]: world of one, every collective is a no-op
//! - [`InProcessGroup`]: threads of one process acting as ranks
//! - [`StarBackend`]: TCP, every rank connected to rank zero
//!
//! # Example
//!
//! ```ignore
//! use kiln_distributed::{ClusterEnvironment, DistributedConfig, ProcessGroup};
//!
//! let env = ClusterEnvironment::from_process_env();
//! let config = DistributedConfig::new(env.master_addr(), env.master_port()?, rank, world_size);
//! let group = ProcessGroup::connect(config)?;
//! group.rendezvous("before-training")?;
//! ```

use async_trait::async_trait;

pub mod config;
pub mod env;
pub mod error;
pub mod local;
pub mod spawn;
pub mod star;
pub mod transport;

pub use config::DistributedConfig;
pub use env::ClusterEnvironment;
pub use error::{DistributedError, DistributedResult};
pub use local::{InProcessBackend, InProcessGroup, LocalBackend};
pub use spawn::{ProcessSpawner, WorkerGroup};
pub use star::StarBackend;

/// Interface for distributed operations.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Get the rank of this process (0 to world_size - 1).
    fn rank(&self) -> usize;

    /// Get the total number of processes.
    fn world_size(&self) -> usize;

    /// Perform an all-reduce operation on a buffer of little-endian `f32`s (sum).
    async fn all_reduce(&self, buffer: &mut [u8]) -> DistributedResult<()>;

    /// Barrier synchronization.
    async fn barrier(&self) -> DistributedResult<()>;

    /// Barrier that also checks every rank arrived at the same named point.
    async fn rendezvous(&self, _tag: &str) -> DistributedResult<()> {
        self.barrier().await
    }
}

/// A handle to the distributed runtime.
pub struct DistributedContext {
    backend: Box<dyn DistributedBackend>,
}

impl DistributedContext {
    /// Create a new distributed context with the given backend.
    pub fn new(backend: Box<dyn DistributedBackend>) -> Self {
        Self { backend }
    }

    /// Get the rank of this process.
    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    /// Get the total number of processes.
    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Perform an all-reduce operation (sum) on the buffer.
    pub async fn all_reduce(&self, buffer: &mut [u8]) -> DistributedResult<()> {
        self.backend.all_reduce(buffer).await
    }

    /// Synchronize all processes at a barrier.
    pub async fn barrier(&self) -> DistributedResult<()> {
        let start = std::time::Instant::now();
        let result = self.backend.barrier().await;
        tracing::trace!(
            rank = self.rank(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "barrier"
        );
        result
    }

    /// Named rendezvous.
    pub async fn rendezvous(&self, tag: &str) -> DistributedResult<()> {
        self.backend.rendezvous(tag).await
    }

    /// Check if this is the master process (rank 0).
    pub fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

/// Blocking facade over a [`DistributedContext`] for the synchronous
/// training loop.
pub struct ProcessGroup {
    ctx: DistributedContext,
    runtime: tokio::runtime::Runtime,
}

impl ProcessGroup {
    /// Wrap an existing backend.
    pub fn new(backend: Box<dyn DistributedBackend>) -> DistributedResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            ctx: DistributedContext::new(backend),
            runtime,
        })
    }

    /// World of one.
    pub fn local() -> DistributedResult<Self> {
        Self::new(Box::new(LocalBackend))
    }

    /// Join a TCP group. Blocks until every rank has connected.
    pub fn connect(config: DistributedConfig) -> DistributedResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let backend = runtime.block_on(StarBackend::connect(config))?;
        Ok(Self {
            ctx: DistributedContext::new(Box::new(backend)),
            runtime,
        })
    }

    /// Rank of this process.
    pub fn rank(&self) -> usize {
        self.ctx.rank()
    }

    /// Total processes.
    pub fn world_size(&self) -> usize {
        self.ctx.world_size()
    }

    /// Whether this is rank zero.
    pub fn is_rank_zero(&self) -> bool {
        self.ctx.is_master()
    }

    /// Block until every rank arrives.
    pub fn barrier(&self) -> DistributedResult<()> {
        self.runtime.block_on(self.ctx.barrier())
    }

    /// Block until every rank arrives at `tag`.
    pub fn rendezvous(&self, tag: &str) -> DistributedResult<()> {
        self.runtime.block_on(self.ctx.rendezvous(tag))
    }

    /// Element-wise sum across ranks.
    pub fn all_reduce_f32(&self, values: &mut [f32]) -> DistributedResult<()> {
        if cfg!(target_endian = "big") {
            for v in values.iter_mut() {
                *v = f32::from_bits(v.to_bits().to_le());
            }
        }
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(values);
        self.runtime.block_on(self.ctx.all_reduce(bytes))?;
        if cfg!(target_endian = "big") {
            for v in values.iter_mut() {
                *v = f32::from_bits(u32::from_le(v.to_bits()));
            }
        }
        Ok(())
    }

    /// Whether `flag` is set on any rank.
    pub fn any(&self, flag: bool) -> DistributedResult<bool> {
        if self.world_size() == 1 {
            return Ok(flag);
        }
        let mut value = [if flag { 1.0f32 } else { 0.0 }];
        self.all_reduce_f32(&mut value)?;
        Ok(value[0] > 0.0)
    }
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::DistributedConfig;
    pub use crate::env::ClusterEnvironment;
    pub use crate::error::{DistributedError, DistributedResult};
    pub use crate::local::{InProcessGroup, LocalBackend};
    pub use crate::spawn::{ProcessSpawner, WorkerGroup};
    pub use crate::star::StarBackend;
    pub use crate::{DistributedBackend, DistributedContext, ProcessGroup};
}
