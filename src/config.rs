//! Node configuration
//!
//! Loaded from a YAML file; every field has a default carrying the
//! protocol constants, so a missing file or a partial file both work.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for ledger, blobs, and network state
    pub data_dir: PathBuf,
    /// Identity file location (under data_dir if relative)
    pub identity_file: PathBuf,

    /// Gossip fanout for event broadcast
    pub gossip_fanout: usize,
    /// Seconds between sync scheduler ticks
    pub sync_tick_seconds: u64,
    /// Seconds between decay checks (one epoch)
    pub decay_period_seconds: u64,

    /// PoW difficulty in trailing zero bits
    pub pow_difficulty: u32,
    /// Argon2 memory cost in KiB
    pub pow_memory_cost: u32,

    /// Renderer cache limit in bytes
    pub cache_max_bytes: usize,
    /// Renderer cache limit in items
    pub cache_max_items: usize,

    /// Requests per minute per peer
    pub rate_limit_per_minute: u32,
    /// Requests per hour per peer
    pub rate_limit_per_hour: u32,
    /// Burst bucket size
    pub rate_limit_burst: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            identity_file: PathBuf::from("./data/identity.json"),
            gossip_fanout: 3,
            sync_tick_seconds: 1,
            decay_period_seconds: 600,
            pow_difficulty: 20,
            pow_memory_cost: 4096,
            cache_max_bytes: 100 * 1024 * 1024,
            cache_max_items: 1000,
            rate_limit_per_minute: 60,
            rate_limit_per_hour: 1000,
            rate_limit_burst: 10,
        }
    }
}

impl NodeConfig {
    /// Load from a YAML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::InvalidFormat(format!("config {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| Error::SerializationFailed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.bin")
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("storage")
    }

    pub fn networks_path(&self) -> PathBuf {
        self.data_dir.join("networks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.gossip_fanout, 3);
        assert_eq!(config.decay_period_seconds, 600);
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.ledger_path(), PathBuf::from("./data/ledger.bin"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = NodeConfig::load(Path::new("/nonexistent/cashew.yaml")).unwrap();
        assert_eq!(config.cache_max_items, 1000);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = NodeConfig::default();
        config.pow_difficulty = 4;
        config.rate_limit_burst = 20;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.pow_difficulty, 4);
        assert_eq!(loaded.rate_limit_burst, 20);
        assert_eq!(loaded.gossip_fanout, 3);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.yaml");
        std::fs::write(&path, "pow_difficulty: 8\n").unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.pow_difficulty, 8);
        assert_eq!(loaded.cache_max_items, 1000);
    }
}
