//! TCP transport for process groups.
//!
//! Length-prefixed frames over TCP. Rank zero listens; every other rank
//! connects with exponential backoff and announces its rank.

use crate::config::DistributedConfig;
use crate::error::{DistributedError, DistributedResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Maximum backoff delay between connection retries.
const MAX_BACKOFF_MS: u64 = 5000;

/// Initial backoff delay between connection retries.
const INITIAL_BACKOFF_MS: u64 = 100;

/// Upper bound on a single frame.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// A framed, bidirectional connection to one peer.
pub struct FramedStream {
    stream: TcpStream,
}

impl FramedStream {
    fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Self { stream }
    }

    /// Send data with length prefix.
    pub async fn send(&mut self, data: &[u8]) -> DistributedResult<()> {
        let len = (data.len() as u32).to_le_bytes();
        self.stream.write_all(&len).await?;
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Receive one frame of any length.
    pub async fn recv(&mut self) -> DistributedResult<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(DistributedError::Protocol(format!(
                "frame of {len} bytes exceeds limit"
            )));
        }
        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Receive a frame into `buffer`, which must match its size.
    pub async fn recv_into(&mut self, buffer: &mut [u8]) -> DistributedResult<()> {
        let data = self.recv().await?;
        if data.len() != buffer.len() {
            return Err(DistributedError::BufferSize {
                expected: buffer.len(),
                actual: data.len(),
            });
        }
        buffer.copy_from_slice(&data);
        Ok(())
    }
}

/// Star topology transport: rank zero holds one stream per peer.
pub struct TcpTransport;

impl TcpTransport {
    /// Accept `world_size - 1` peers on rank zero.
    ///
    /// Returns streams indexed by rank; index 0 is always `None`.
    pub async fn accept_peers(config: &DistributedConfig) -> DistributedResult<Vec<Option<FramedStream>>> {
        let bind_addr = format!("0.0.0.0:{}", config.master_port);
        info!("Rank 0 listening on {}", bind_addr);
        let listener = TcpListener::bind(&bind_addr).await?;

        let mut peers: Vec<Option<FramedStream>> = (0..config.world_size).map(|_| None).collect();
        let connection_timeout = Duration::from_millis(config.connection_timeout_ms);

        for _ in 1..config.world_size {
            let (stream, addr) = match timeout(connection_timeout, listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => return Err(DistributedError::Io(e)),
                Err(_) => {
                    return Err(DistributedError::ConnectionTimeout(
                        bind_addr.clone(),
                        connection_timeout,
                    ))
                }
            };
            let mut framed = FramedStream::new(stream);
            let hello = framed.recv().await?;
            let rank = decode_rank(&hello)?;
            if rank == 0 || rank >= config.world_size {
                return Err(DistributedError::Protocol(format!(
                    "peer at {addr} announced invalid rank {rank}"
                )));
            }
            if peers[rank].is_some() {
                return Err(DistributedError::Protocol(format!(
                    "rank {rank} connected twice"
                )));
            }
            info!("Accepted rank {} from {}", rank, addr);
            peers[rank] = Some(framed);
        }

        Ok(peers)
    }

    /// Connect a non-zero rank to rank zero.
    pub async fn connect_to_master(config: &DistributedConfig) -> DistributedResult<FramedStream> {
        let endpoint = config.master_endpoint();
        let max_retries = config.max_retries;
        let mut retries = 0u32;

        let stream = loop {
            if retries >= max_retries {
                return Err(DistributedError::MaxRetriesExceeded {
                    addr: endpoint,
                    max_retries,
                });
            }

            match TcpStream::connect(&endpoint).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if retries == 0 {
                        debug!("Waiting for rank 0 at {} ({})", endpoint, e);
                    }
                    retries += 1;

                    // Exponential backoff
                    let backoff =
                        (INITIAL_BACKOFF_MS * 2u64.pow(retries.min(6))).min(MAX_BACKOFF_MS);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        };

        let mut framed = FramedStream::new(stream);
        framed.send(&(config.rank as u32).to_le_bytes()).await?;
        info!("Rank {} connected to rank 0 at {}", config.rank, endpoint);
        Ok(framed)
    }
}

fn decode_rank(bytes: &[u8]) -> DistributedResult<usize> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| DistributedError::BufferSize {
        expected: 4,
        actual: bytes.len(),
    })?;
    Ok(u32::from_le_bytes(raw) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rank() {
        assert_eq!(decode_rank(&3u32.to_le_bytes()).unwrap(), 3);
        assert!(decode_rank(&[1, 2]).is_err());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let mut config = DistributedConfig::new("127.0.0.1", 1, 1, 2);
        config.max_retries = 1;
        let err = TcpTransport::connect_to_master(&config).await.err().unwrap();
        assert!(matches!(err, DistributedError::MaxRetriesExceeded { .. }));
    }
}
