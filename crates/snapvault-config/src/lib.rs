//! Configuration management for snapvault
//!
//! Every node of a cluster reads one [`SnapvaultConfig`]. [`ConfigLoader`]
//! layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables (`SNAPVAULT_*` prefix)

use serde::{Deserialize, Serialize};
use std::time::Duration;

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::{ConfigLoader, ENV_PREFIX};

/// Main snapvault configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapvaultConfig {
    pub node: NodeConfig,
    pub repository: RepositoryConfig,
    pub waits: WaitConfig,
}

/// Per-node resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Threads in the node's snapshot worker pool.
    pub snapshot_pool_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            snapshot_pool_size: 2,
        }
    }
}

/// Defaults applied to every repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Attempts at committing a finalize or delete before giving up.
    pub max_finalize_retries: u32,
    /// Compress metadata blobs unless the repository overrides it.
    pub compress: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_finalize_retries: 10,
            compress: false,
        }
    }
}

/// Bounds for blocking waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Pool size of the large snapshot pool profile.
pub const LARGE_SNAPSHOT_POOL_SIZE: usize = 5;

impl SnapvaultConfig {
    /// Defaults overridden by `SNAPVAULT_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Threads per node for shard snapshots, e.g. [`LARGE_SNAPSHOT_POOL_SIZE`].
    pub fn with_snapshot_pool_size(mut self, size: usize) -> Self {
        self.node.snapshot_pool_size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.waits.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.snapshot_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "node.snapshot_pool_size must be at least 1".to_string(),
            ));
        }
        if self.repository.max_finalize_retries == 0 {
            return Err(ConfigError::ValidationError(
                "repository.max_finalize_retries must be at least 1".to_string(),
            ));
        }
        if self.waits.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "waits.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SnapvaultConfig::default();
        assert_eq!(config.node.snapshot_pool_size, 2);
        assert_eq!(config.repository.max_finalize_retries, 10);
        assert!(!config.repository.compress);
        assert_eq!(config.waits.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_snapshot_pool_size_keeps_other_sections() {
        let config = SnapvaultConfig::default()
            .with_timeout(Duration::from_secs(7))
            .with_snapshot_pool_size(LARGE_SNAPSHOT_POOL_SIZE);
        assert_eq!(config.node.snapshot_pool_size, LARGE_SNAPSHOT_POOL_SIZE);
        assert_eq!(config.waits.timeout_secs, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let config = SnapvaultConfig::default().with_snapshot_pool_size(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
