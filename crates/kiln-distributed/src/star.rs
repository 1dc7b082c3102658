//! Rank-zero-centred process group over TCP.
//!
//! Every collective gathers at rank zero and is released by it. Collectives
//! must be issued in the same order on every rank; streams carry no
//! operation tags beyond what each collective sends.

use crate::config::DistributedConfig;
use crate::error::{DistributedError, DistributedResult};
use crate::transport::{FramedStream, TcpTransport};
use crate::DistributedBackend;
use async_trait::async_trait;
use tokio::sync::Mutex;

const RELEASE_OK: u8 = 1;
const RELEASE_MISMATCH: u8 = 0;

enum Role {
    Root { peers: Mutex<Vec<Option<FramedStream>>> },
    Leaf { root: Mutex<FramedStream> },
}

/// TCP star backend.
pub struct StarBackend {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl StarBackend {
    /// Form the group. Blocks until every rank has joined.
    pub async fn connect(config: DistributedConfig) -> DistributedResult<Self> {
        config.validate()?;
        let role = if config.rank == 0 {
            Role::Root {
                peers: Mutex::new(TcpTransport::accept_peers(&config).await?),
            }
        } else {
            Role::Leaf {
                root: Mutex::new(TcpTransport::connect_to_master(&config).await?),
            }
        };
        Ok(Self {
            rank: config.rank,
            world_size: config.world_size,
            role,
        })
    }
}

fn add_f32_le(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.chunks_exact_mut(4).zip(other.chunks_exact(4)) {
        let sum = f32::from_le_bytes([a[0], a[1], a[2], a[3]])
            + f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        a.copy_from_slice(&sum.to_le_bytes());
    }
}

#[async_trait]
impl DistributedBackend for StarBackend {
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

        match &self.role {
            Role::Root { peers } => {
                let mut peers = peers.lock().await;
                let mut incoming = vec![0u8; buffer.len()];
                for (rank, peer) in peers.iter_mut().enumerate() {
                    let Some(peer) = peer else { continue };
                    peer.recv_into(&mut incoming).await.map_err(|e| match e {
                        DistributedError::Io(_) => DistributedError::PeerLost(rank),
                        other => other,
                    })?;
                    add_f32_le(buffer, &incoming);
                }
                for peer in peers.iter_mut().flatten() {
                    peer.send(buffer).await?;
                }
            }
            Role::Leaf { root } => {
                let mut root = root.lock().await;
                root.send(buffer).await?;
                root.recv_into(buffer).await?;
            }
        }
        Ok(())
    }

    async fn barrier(&self) -> DistributedResult<()> {
        let mut token = [0u8; 4];
        self.all_reduce(&mut token).await
    }

    async fn rendezvous(&self, tag: &str) -> DistributedResult<()> {
        match &self.role {
            Role::Root { peers } => {
                let mut peers = peers.lock().await;
                let mut mismatch = None;
                for (rank, peer) in peers.iter_mut().enumerate() {
                    let Some(peer) = peer else { continue };
                    let arrived = String::from_utf8_lossy(&peer.recv().await?).into_owned();
                    if arrived != tag && mismatch.is_none() {
                        mismatch = Some(DistributedError::RendezvousMismatch {
                            rank,
                            expected: tag.to_string(),
                            actual: arrived,
                        });
                    }
                }
                let release = if mismatch.is_some() { RELEASE_MISMATCH } else { RELEASE_OK };
                for peer in peers.iter_mut().flatten() {
                    peer.send(&[release]).await?;
                }
                mismatch.map_or(Ok(()), Err)
            }
            Role::Leaf { root } => {
                let mut root = root.lock().await;
                root.send(tag.as_bytes()).await?;
                let mut release = [0u8; 1];
                root.recv_into(&mut release).await?;
                if release[0] == RELEASE_OK {
                    Ok(())
                } else {
                    Err(DistributedError::RendezvousMismatch {
                        rank: self.rank,
                        expected: "tag chosen by rank 0".to_string(),
                        actual: tag.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_add_f32_le() {
        let mut acc = floats(&[1.0, 2.0]);
        add_f32_le(&mut acc, &floats(&[0.5, -2.0]));
        assert_eq!(acc, floats(&[1.5, 0.0]));
    }

    async fn group(port: u16, world_size: usize) -> Vec<StarBackend> {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                tokio::spawn(StarBackend::connect(DistributedConfig::new(
                    "127.0.0.1",
                    port,
                    rank,
                    world_size,
                )))
            })
            .collect();
        let mut backends = Vec::new();
        for handle in handles {
            backends.push(handle.await.unwrap().unwrap());
        }
        backends
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_reduce_and_barrier() {
        let backends = group(29517, 3).await;
        let tasks: Vec<_> = backends
            .into_iter()
            .map(|backend| {
                tokio::spawn(async move {
                    let mut buf = floats(&[backend.rank() as f32, 1.0]);
                    backend.all_reduce(&mut buf).await.unwrap();
                    backend.barrier().await.unwrap();
                    buf
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), floats(&[3.0, 3.0]));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rendezvous_mismatch() {
        let backends = group(29518, 2).await;
        let tasks: Vec<_> = backends
            .into_iter()
            .map(|backend| {
                tokio::spawn(async move {
                    let tag = if backend.rank() == 0 { "a" } else { "b" };
                    backend.rendezvous(tag).await
                })
            })
            .collect();
        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(DistributedError::RendezvousMismatch { .. })
            ));
        }
    }
}
