//! Snapshot Persistence
//!
//! Whole-file JSON snapshots of a named store. Only the current manager
//! writes or deletes the file; the role is re-checked right before every
//! write and the operation is skipped, not failed, when the role is gone.
//! Writes go to a temporary file that is renamed over the target, so
//! concurrent readers never observe a partially written snapshot.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use crate::error::{Error, Result};
use crate::role::ManagerRole;
use crate::store::{Snapshot, Timestamp};

/// Flushes and loads the snapshot file of one named store
#[derive(Clone)]
pub struct PersistenceManager {
    path: PathBuf,
    role: Arc<dyn ManagerRole>,
}

impl PersistenceManager {
    /// Create a manager for the file at `path`
    pub fn new(path: PathBuf, role: Arc<dyn ManagerRole>) -> Self {
        Self { path, role }
    }

    /// Snapshot file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot` over the file. Returns `false` when skipped because
    /// this process is not the manager.
    pub async fn flush(&self, snapshot: &Snapshot) -> Result<bool> {
        if !self.role.is_manager() {
            tracing::debug!("Not manager, skipping flush of {}", self.path.display());
            return Ok(false);
        }

        let bytes = serde_json::to_vec(snapshot).map_err(|e| Error::persistence(&self.path, e))?;
        atomic_write(&self.path, &bytes).await?;

        tracing::debug!(
            "Flushed {} entries to {}",
            snapshot.len(),
            self.path.display()
        );
        Ok(true)
    }

    /// Read the file. A missing file is an empty snapshot.
    pub async fn load(&self) -> Result<Snapshot> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No snapshot at {}, starting empty", self.path.display());
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(Error::persistence(&self.path, e)),
        };

        serde_json::from_slice(&bytes).map_err(|e| Error::persistence(&self.path, format!("corrupt snapshot: {}", e)))
    }

    /// Write `snapshot` with expired entries and fields removed. Returns
    /// `false` when skipped because this process is not the manager.
    pub async fn purge_expired(&self, mut snapshot: Snapshot, now: Timestamp) -> Result<bool> {
        let purged = snapshot.purge_expired(now);
        if purged > 0 {
            tracing::debug!("Purging {} expired items from {}", purged, self.path.display());
        }
        self.flush(&snapshot).await
    }

    /// Delete the file. Returns `false` when skipped because this process
    /// is not the manager. A missing file counts as deleted.
    pub async fn destroy_file(&self) -> Result<bool> {
        if !self.role.is_manager() {
            tracing::debug!("Not manager, leaving {} in place", self.path.display());
            return Ok(false);
        }

        match fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::info!("Removed snapshot {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(Error::persistence(&self.path, e)),
        }
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::persistence(parent, format!("failed to create directory: {}", e)))?;
    }

    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| Error::persistence(&tmp, format!("failed to write temp file: {}", e)))?;

    if let Err(e) = fs::rename(&tmp, path).await {
        if let Err(cleanup) = fs::remove_file(&tmp).await {
            tracing::debug!("Could not remove {}: {}", tmp.display(), cleanup);
        }
        return Err(Error::persistence(
            path,
            format!("failed to replace from {}: {}", tmp.display(), e),
        ));
    }
    Ok(())
}
