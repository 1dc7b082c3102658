use crate::error::{DistributedError, DistributedResult};
use serde::{Deserialize, Serialize};

/// Configuration for a TCP process group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Host of rank zero. Every rank connects here.
    pub master_addr: String,

    /// Port rank zero listens on.
    pub master_port: u16,

    /// Rank of this process.
    pub rank: usize,

    /// Total number of processes.
    pub world_size: usize,

    /// Connection timeout in milliseconds (default: 30000).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Maximum connection retry attempts (default: 50).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    50
}

impl DistributedConfig {
    /// Create a new configuration.
    pub fn new(master_addr: impl Into<String>, master_port: u16, rank: usize, world_size: usize) -> Self {
        Self {
            master_addr: master_addr.into(),
            master_port,
            rank,
            world_size,
            connection_timeout_ms: default_connection_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> DistributedResult<()> {
        if self.world_size == 0 {
            return Err(DistributedError::Config("world_size must be > 0".to_string()));
        }

        if self.rank >= self.world_size {
            return Err(DistributedError::Config(format!(
                "rank {} is out of bounds for world size {}",
                self.rank, self.world_size
            )));
        }

        if self.master_addr.trim().is_empty() {
            return Err(DistributedError::Config("master_addr cannot be empty".to_string()));
        }

        Ok(())
    }

    /// `host:port` of rank zero.
    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        DistributedConfig::new("127.0.0.1", 12910, 1, 2).validate().unwrap();
        assert!(DistributedConfig::new("127.0.0.1", 12910, 2, 2).validate().is_err());
        assert!(DistributedConfig::new("", 12910, 0, 1).validate().is_err());
        assert!(DistributedConfig::new("h", 1, 0, 0).validate().is_err());
    }

    #[test]
    fn test_endpoint() {
        let config = DistributedConfig::new("node1", 15001, 0, 4);
        assert_eq!(config.master_endpoint(), "node1:15001");
    }
}
