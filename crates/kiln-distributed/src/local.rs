//! Backends that never leave the current process.

use crate::error::{DistributedError, DistributedResult};
use crate::DistributedBackend;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Barrier;

/// World of one. Every collective is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

#[async_trait]
impl DistributedBackend for LocalBackend {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn all_reduce(&self, _buffer: &mut [u8]) -> DistributedResult<()> {
        Ok(())
    }

    async fn barrier(&self) -> DistributedResult<()> {
        Ok(())
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
    tags: Mutex<Vec<String>>,
}

/// Threads of one process acting as ranks of a group.
///
/// Each operation writes the caller's contribution, waits for every rank,
/// reads, then waits again so no rank overwrites a slot another is still
/// reading.
pub struct InProcessGroup;

impl InProcessGroup {
    /// Create `world_size` connected backends, one per rank.
    pub fn create(world_size: usize) -> Vec<InProcessBackend> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
            tags: Mutex::new(vec![String::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| InProcessBackend {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank of an [`InProcessGroup`].
pub struct InProcessBackend {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

#[async_trait]
impl DistributedBackend for InProcessBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce(&self, buffer: &mut [u8]) -> DistributedResult<()> {
        if !buffer.len().is_multiple_of(4) {
            return Err(DistributedError::Protocol(format!(
                "Buffer length {} is not a multiple of 4 (f32 size)",
                buffer.len()
            )));
        }
        self.shared.slots.lock()[self.rank] = buffer.to_vec();
        self.shared.barrier.wait().await;

        let result = {
            let slots = self.shared.slots.lock();
            let mut sums = vec![0f32; buffer.len() / 4];
            let mut mismatch = None;
            for slot in slots.iter() {
                if slot.len() != buffer.len() {
                    mismatch = Some(slot.len());
                    continue;
                }
                for (sum, chunk) in sums.iter_mut().zip(slot.chunks_exact(4)) {
                    *sum += f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
            match mismatch {
                Some(actual) => Err(DistributedError::BufferSize {
                    expected: buffer.len(),
                    actual,
                }),
                None => Ok(sums),
            }
        };
        self.shared.barrier.wait().await;

        for (out, sum) in buffer.chunks_exact_mut(4).zip(result?) {
            out.copy_from_slice(&sum.to_le_bytes());
        }
        Ok(())
    }

    async fn barrier(&self) -> DistributedResult<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn rendezvous(&self, tag: &str) -> DistributedResult<()> {
        self.shared.tags.lock()[self.rank] = tag.to_string();
        self.shared.barrier.wait().await;
        let mismatch = {
            let tags = self.shared.tags.lock();
            tags.iter()
                .enumerate()
                .find(|(_, t)| t.as_str() != tag)
                .map(|(rank, t)| (rank, t.clone()))
        };
        self.shared.barrier.wait().await;
        match mismatch {
            Some((rank, actual)) => Err(DistributedError::RendezvousMismatch {
                rank,
                expected: tag.to_string(),
                actual,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_backend_is_world_of_one() {
        let backend = LocalBackend;
        let mut buf = 2.5f32.to_le_bytes();
        backend.all_reduce(&mut buf).await.unwrap();
        assert_eq!(f32::from_le_bytes(buf), 2.5);
        backend.rendezvous("anything").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_process_all_reduce() {
        let tasks: Vec<_> = InProcessGroup::create(4)
            .into_iter()
            .map(|backend| {
                tokio::spawn(async move {
                    let mut buf = (backend.rank() as f32 + 1.0).to_le_bytes();
                    backend.all_reduce(&mut buf).await.unwrap();
                    backend.rendezvous("ready").await.unwrap();
                    f32::from_le_bytes(buf)
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 10.0);
        }
    }
}
