use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{Result, SyncError};
// Repository enumeration for snapshot manifests

/// VCS metadata directory; never walked and never patched
pub const VCS_DIR: &str = ".git";

/// A regular file found under the repository root
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Repo-relative, always '/'-separated
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub mode: u32,
    /// Milliseconds since the unix epoch
    pub mtime_ms: i64,
}

/// Resolve the repository root, following a symlink at the root only
pub fn canonical_root(root: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(root).map_err(|e| SyncError::io(root, e))
}

/// Enumerate every regular file under `root` (expected canonical).
///
/// Symlinks are not followed, `.git` entries are pruned at any depth, and
/// anything that does not resolve to a clean relative path is dropped.
pub fn enumerate_repo(root: &Path) -> Result<Vec<FileRecord>> {
    use walkdir::WalkDir;

    let mut records = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != VCS_DIR)
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(rel_path) = relative_slash_path(root, entry.path()) else {
            tracing::warn!("skipping {}: not a UTF-8 path under the root", entry.path().display());
            continue;
        };
        let metadata = entry.metadata()?;
        records.push(FileRecord {
            rel_path,
            abs_path: entry.path().to_path_buf(),
            size: metadata.len(),
            mode: permission_bits(&metadata),
            mtime_ms: mtime_millis(&metadata),
        });
    }

    Ok(records)
}

/// Repo-relative slash path, or None if `path` escapes `root`
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => parts.push(s.to_str()?.to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(unix)]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

pub fn mtime_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
