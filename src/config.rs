//! WolfCache Configuration
//!
//! This module provides configuration structures for a WolfCache node
//! and the per-instance options derived from them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfCache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfCacheConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Storage instance defaults
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, used as the origin prefix of broadcasts
    pub id: String,

    /// Directory holding persisted snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Storage instance defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// GC sweep interval in milliseconds
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// How long `sync()` waits for a manager response, in milliseconds
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Capacity of the outbound broadcast queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Request the manager's snapshot when a non-manager instance connects
    #[serde(default = "default_true")]
    pub warm_sync: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_gc_interval_ms() -> u64 {
    300_000
}

fn default_sync_timeout_ms() -> u64 {
    5_000
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfcache")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: default_gc_interval_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            outbound_queue: default_outbound_queue(),
            warm_sync: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfCacheConfig {
    /// Build a configuration with defaults for the given node
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.into(),
                data_dir: data_dir.into(),
            },
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfCacheConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration back to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.storage.gc_interval_ms == 0 {
            return Err(crate::Error::Config("storage.gc_interval_ms must be positive".into()));
        }

        if self.storage.sync_timeout_ms == 0 {
            return Err(crate::Error::Config("storage.sync_timeout_ms must be positive".into()));
        }

        if self.storage.outbound_queue == 0 {
            return Err(crate::Error::Config("storage.outbound_queue must be positive".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the snapshot path for a named store
    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.node.data_dir.join(format!("{}.json", name))
    }

    /// Get GC interval as Duration
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.storage.gc_interval_ms)
    }

    /// Get sync timeout as Duration
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.sync_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "worker-1"
data_dir = "/tmp/wolfcache"

[storage]
gc_interval_ms = 60000
sync_timeout_ms = 2000
"#;

        let config = WolfCacheConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "worker-1");
        assert_eq!(config.gc_interval(), Duration::from_secs(60));
        assert_eq!(config.sync_timeout(), Duration::from_secs(2));
        assert_eq!(config.storage.outbound_queue, 1024);
        assert!(config.storage.warm_sync);
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.snapshot_path("sessions"),
            PathBuf::from("/tmp/wolfcache/sessions.json")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty_id = r#"
[node]
id = ""
"#;
        assert!(WolfCacheConfig::from_str(empty_id).is_err());

        let zero_gc = r#"
[node]
id = "worker-1"

[storage]
gc_interval_ms = 0
"#;
        assert!(WolfCacheConfig::from_str(zero_gc).is_err());
    }

    #[test]
    fn test_toml_roundtrip_of_defaults() {
        let config = WolfCacheConfig::new("worker-2", "/tmp/wc");
        let text = config.to_toml().unwrap();
        let parsed = WolfCacheConfig::from_str(&text).unwrap();
        assert_eq!(parsed.node.id, "worker-2");
        assert_eq!(parsed.storage.gc_interval_ms, 300_000);
    }
}
