//! Per-instance options

use std::path::PathBuf;
use std::time::Duration;

use crate::config::WolfCacheConfig;
use crate::error::{Error, Result};

/// Options for one storage instance
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Directory holding the snapshot file
    pub path: PathBuf,
    /// Node identifier used in broadcast origins
    pub node_id: String,
    /// GC sweep interval
    pub gc_interval: Duration,
    /// Bound on waiting for a sync response
    pub sync_timeout: Duration,
    /// Outbound broadcast queue capacity
    pub outbound_queue: usize,
    /// Request the manager's snapshot on connect
    pub warm_sync: bool,
}

impl StorageOptions {
    /// Defaults for snapshots kept under `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = WolfCacheConfig::new(default_node_id(), path.into());
        Self::from_config(&defaults)
    }

    /// Options derived from a node configuration
    pub fn from_config(config: &WolfCacheConfig) -> Self {
        Self {
            path: config.data_dir().clone(),
            node_id: config.node.id.clone(),
            gc_interval: config.gc_interval(),
            sync_timeout: config.sync_timeout(),
            outbound_queue: config.storage.outbound_queue,
            warm_sync: config.storage.warm_sync,
        }
    }

    /// Set the node identifier
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the GC interval
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the sync timeout
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Enable or disable the sync request on connect
    pub fn warm_sync(mut self, enabled: bool) -> Self {
        self.warm_sync = enabled;
        self
    }

    /// Snapshot file of the store called `name`
    pub fn filename(&self, name: &str) -> PathBuf {
        self.path.join(format!("{}.json", name))
    }

    /// Check the options for a store called `name`
    pub fn validate(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config("store name cannot be empty".into()));
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::Config(format!("store name '{}' is not a plain file name", name)));
        }
        if self.gc_interval.is_zero() {
            return Err(Error::Config("gc interval must be positive".into()));
        }
        if self.sync_timeout.is_zero() {
            return Err(Error::Config("sync timeout must be positive".into()));
        }
        Ok(())
    }
}

fn default_node_id() -> String {
    format!("pid-{}", std::process::id())
}
