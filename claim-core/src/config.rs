//! Configuration for the claim engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Factory configuration
    pub factory: FactoryConfig,

    /// Actor configuration
    pub actor: ActorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/claims"),
            service_name: "claim-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            factory: FactoryConfig::default(),
            actor: ActorConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            target_file_size_mb: 64,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Deterministic factory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Chain context mixed into every identity seed
    pub chain_context: u64,

    /// Label the factory identity is derived from
    pub label: String,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            chain_context: 1,
            label: "ClaimFactory".to_string(),
        }
    }
}

/// Single-writer actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Bounded mailbox capacity (backpressure)
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("CLAIMS_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(chain) = std::env::var("CLAIMS_CHAIN_CONTEXT") {
            config.factory.chain_context = chain
                .parse()
                .map_err(|e| crate::Error::Config(format!("CLAIMS_CHAIN_CONTEXT: {}", e)))?;
        }

        if let Ok(label) = std::env::var("CLAIMS_FACTORY_LABEL") {
            config.factory.label = label;
        }

        if let Ok(capacity) = std::env::var("CLAIMS_MAILBOX_CAPACITY") {
            config.actor.mailbox_capacity = capacity
                .parse()
                .map_err(|e| crate::Error::Config(format!("CLAIMS_MAILBOX_CAPACITY: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.factory.label.trim().is_empty() {
            return Err(crate::Error::Config("factory.label must not be empty".to_string()));
        }
        if self.actor.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "actor.mailbox_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
