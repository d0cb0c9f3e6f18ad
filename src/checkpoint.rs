//! Resumable upload checkpoints
//!
//! One record per repository root, written right after a successful
//! handshake and removed after finalize. A record is only trusted when its
//! manifest hash equals the freshly built manifest's hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::checksum::sha256_hex;
use crate::error::{Result, SyncError};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default = "default_version")]
    pub version: u32,
    pub repo_root: PathBuf,
    pub snapshot_id: String,
    pub manifest_hash: String,
    #[serde(default)]
    pub missing_blobs: Vec<String>,
    #[serde(rename = "uploadURL", default)]
    pub upload_url: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl Checkpoint {
    pub fn new(
        repo_root: &Path,
        snapshot_id: impl Into<String>,
        manifest_hash: impl Into<String>,
        missing_blobs: Vec<String>,
        upload_url: impl Into<String>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            repo_root: repo_root.to_path_buf(),
            snapshot_id: snapshot_id.into(),
            manifest_hash: manifest_hash.into(),
            missing_blobs,
            upload_url: upload_url.into(),
            updated_at: Some(Utc::now()),
        }
    }

    /// The only resume rule: same manifest hash
    pub fn matches(&self, manifest_hash: &str) -> bool {
        !self.manifest_hash.is_empty() && self.manifest_hash == manifest_hash
    }
}

/// Checkpoint files under `<state_dir>/checkpoints/`
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("checkpoints"),
        }
    }

    pub fn path_for(&self, repo_root: &Path) -> PathBuf {
        let key = sha256_hex(repo_root.to_string_lossy().as_bytes());
        self.dir.join(format!("{key}.json"))
    }

    /// Stored checkpoint for this root; unusable records read as `None`
    pub fn load(&self, repo_root: &Path) -> Result<Option<Checkpoint>> {
        let path = self.path_for(repo_root);
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(&path, e)),
        };
        let checkpoint: Checkpoint = match serde_json::from_slice(&data) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("ignoring unreadable checkpoint {}: {}", path.display(), e);
                return Ok(None);
            }
        };
        if checkpoint.version != CHECKPOINT_VERSION || checkpoint.repo_root != repo_root {
            tracing::warn!("ignoring checkpoint {} for another repository or version", path.display());
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    /// Atomic replace via a temp file in the same directory
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SyncError::io(&self.dir, e))?;
        let path = self.path_for(&checkpoint.repo_root);
        let mut record = checkpoint.clone();
        record.updated_at = Some(Utc::now());
        let data = serde_json::to_vec_pretty(&record)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| SyncError::io(&self.dir, e))?;
        tmp.write_all(&data).map_err(|e| SyncError::io(tmp.path(), e))?;
        tmp.flush().map_err(|e| SyncError::io(tmp.path(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
        }
        tmp.persist(&path).map_err(|e| SyncError::io(&path, e.error))?;
        Ok(())
    }

    pub fn clear(&self, repo_root: &Path) -> Result<()> {
        let path = self.path_for(repo_root);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(&path, e)),
        }
    }
}
