//! Deterministic snapshot manifests
//!
//! A manifest lists every snapshotted file with its content hash. Entries are
//! sorted by path before the aggregate hash is computed, so the hash depends
//! only on the file set and contents, never on traversal order.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::checksum::{sha256_file, sha256_hex};
use crate::error::{Result, SyncError};
use crate::fs_enum::{canonical_root, enumerate_repo, FileRecord};
use crate::git::GitOps;
use crate::preflight::{self, PreflightLimits, PreflightResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub blob_hash: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub hash: String,
}

impl Manifest {
    /// Sort entries and compute the aggregate hash
    pub fn from_entries(mut entries: Vec<ManifestEntry>) -> Result<Self> {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let canonical = serde_json::to_vec(&entries)?;
        Ok(Self {
            hash: sha256_hex(&canonical),
            entries,
        })
    }

    /// One entry per distinct blob; the first path (in sorted order) wins
    pub fn entries_by_blob(&self) -> HashMap<String, ManifestEntry> {
        let mut map = HashMap::with_capacity(self.entries.len());
        for entry in self.entries.iter().filter(|e| !e.is_deleted) {
            map.entry(entry.blob_hash.clone())
                .or_insert_with(|| entry.clone());
        }
        map
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestOptions {
    /// Snapshot files that git ignores too
    pub include_ignored: bool,
    pub limits: PreflightLimits,
}

/// A manifest together with the canonical root it was built from
#[derive(Debug, Clone)]
pub struct BuiltManifest {
    pub root: PathBuf,
    pub manifest: Manifest,
    pub preflight: PreflightResult,
}

/// Canonical root plus the files that belong in the snapshot
pub fn collect_files(
    root: &Path,
    include_ignored: bool,
    git: &dyn GitOps,
) -> Result<(PathBuf, Vec<FileRecord>)> {
    let root = canonical_root(root)?;
    let mut records = enumerate_repo(&root)?;

    if !include_ignored && !records.is_empty() {
        let paths: Vec<String> = records.iter().map(|r| r.rel_path.clone()).collect();
        match git.ignored_paths(&root, &paths) {
            Ok(ignored) => {
                if !ignored.is_empty() {
                    tracing::debug!(count = ignored.len(), "excluding git-ignored files");
                    records.retain(|r| !ignored.contains(&r.rel_path));
                }
            }
            Err(e) if e.is_missing_vcs() => {
                tracing::debug!("no git repository at {}: including all files", root.display());
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok((root, records))
}

/// Standalone dry preflight over the same file set a manifest would use
pub fn preflight_repo(
    root: &Path,
    options: &ManifestOptions,
    git: &dyn GitOps,
) -> Result<(PreflightResult, Option<preflight::PreflightError>)> {
    let (_, records) = collect_files(root, options.include_ignored, git)?;
    Ok(preflight::preflight_records(&records, &options.limits))
}

pub fn build_manifest(root: &Path, options: &ManifestOptions, git: &dyn GitOps) -> Result<BuiltManifest> {
    let (root, records) = collect_files(root, options.include_ignored, git)?;

    let summary = preflight::compute(&records);
    preflight::check(&summary, &options.limits)?;

    let entries = records
        .par_iter()
        .map(hash_record)
        .collect::<Result<Vec<_>>>()?;
    let manifest = Manifest::from_entries(entries)?;

    Ok(BuiltManifest {
        root,
        manifest,
        preflight: summary,
    })
}

fn hash_record(record: &FileRecord) -> Result<ManifestEntry> {
    let (blob_hash, read) = sha256_file(&record.abs_path)?;
    if read != record.size {
        return Err(SyncError::SizeMismatch {
            path: record.rel_path.clone(),
            expected: record.size,
            actual: read,
        });
    }
    Ok(ManifestEntry {
        path: record.rel_path.clone(),
        blob_hash,
        size: record.size,
        mode: record.mode,
        mtime: record.mtime_ms,
        is_deleted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitError;
    use crate::preflight::PreflightKind;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    /// Git stand-in with a fixed ignore list
    struct StaticIgnore(Option<Vec<&'static str>>);

    impl GitOps for StaticIgnore {
        fn is_clean(&self, _: &Path) -> std::result::Result<bool, GitError> {
            Ok(true)
        }
        fn apply_patch(&self, _: &Path, _: &[u8], _: bool) -> std::result::Result<(), GitError> {
            Ok(())
        }
        fn ignored_paths(
            &self,
            root: &Path,
            paths: &[String],
        ) -> std::result::Result<HashSet<String>, GitError> {
            match &self.0 {
                None => Err(GitError::NotARepository(root.to_path_buf())),
                Some(ignored) => Ok(paths
                    .iter()
                    .filter(|p| ignored.iter().any(|i| *i == p.as_str()))
                    .cloned()
                    .collect()),
            }
        }
    }

    fn repo(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (path, body) in files {
            let p = tmp.path().join(path);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, body).unwrap();
        }
        tmp
    }

    #[test]
    fn test_manifest_is_sorted_and_stable() {
        let tmp = repo(&[("z.md", "zz"), ("a/b.md", "bb"), ("AGENTS.md", "agents")]);
        let git = StaticIgnore(None);
        let first = build_manifest(tmp.path(), &ManifestOptions::default(), &git).unwrap();
        let second = build_manifest(tmp.path(), &ManifestOptions::default(), &git).unwrap();

        let paths: Vec<&str> = first.manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["AGENTS.md", "a/b.md", "z.md"]);
        assert_eq!(first.manifest.hash, second.manifest.hash);
        assert_eq!(first.preflight.file_count, 3);
    }

    #[test]
    fn test_hash_independent_of_input_order() {
        let entry = |p: &str| ManifestEntry {
            path: p.to_string(),
            blob_hash: sha256_hex(p.as_bytes()),
            size: 1,
            mode: 0o644,
            mtime: 42,
            is_deleted: false,
        };
        let a = Manifest::from_entries(vec![entry("b"), entry("a"), entry("c")]).unwrap();
        let b = Manifest::from_entries(vec![entry("c"), entry("b"), entry("a")]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identical_content_shares_blob() {
        let tmp = repo(&[("one.md", "same"), ("two.md", "same"), ("three.md", "other")]);
        let built = build_manifest(tmp.path(), &ManifestOptions::default(), &StaticIgnore(None)).unwrap();
        assert_eq!(built.manifest.entries.len(), 3);
        let by_blob = built.manifest.entries_by_blob();
        assert_eq!(by_blob.len(), 2);
        assert_eq!(by_blob[&sha256_hex(b"same")].path, "one.md");
    }

    #[test]
    fn test_ignored_files_excluded_unless_requested() {
        let tmp = repo(&[("keep.md", "k"), ("build/out.txt", "o")]);
        let git = StaticIgnore(Some(vec!["build/out.txt"]));

        let built = build_manifest(tmp.path(), &ManifestOptions::default(), &git).unwrap();
        assert_eq!(built.manifest.entries.len(), 1);

        let all = ManifestOptions {
            include_ignored: true,
            ..Default::default()
        };
        let built = build_manifest(tmp.path(), &all, &git).unwrap();
        assert_eq!(built.manifest.entries.len(), 2);
    }

    #[test]
    fn test_max_files_violation_returns_no_manifest() {
        let tmp = repo(&[("a.md", "a"), ("b.md", "b")]);
        let options = ManifestOptions {
            include_ignored: false,
            limits: PreflightLimits {
                max_files: Some(1),
                ..Default::default()
            },
        };
        match build_manifest(tmp.path(), &options, &StaticIgnore(None)) {
            Err(SyncError::Preflight(e)) => assert_eq!(e.kind, PreflightKind::MaxFiles),
            other => panic!("expected preflight error, got {other:?}"),
        }
    }

    #[test]
    fn test_max_file_bytes_violation() {
        let tmp = repo(&[("small.md", "a"), ("big.md", "0123456789")]);
        let options = ManifestOptions {
            include_ignored: false,
            limits: PreflightLimits {
                max_file_bytes: Some(5),
                max_files: Some(1),
                ..Default::default()
            },
        };
        match build_manifest(tmp.path(), &options, &StaticIgnore(None)) {
            Err(SyncError::Preflight(e)) => {
                assert_eq!(e.kind, PreflightKind::MaxFileBytes);
                assert_eq!(e.actual, 10);
            }
            other => panic!("expected preflight error, got {other:?}"),
        }
    }

    #[test]
    fn test_preflight_repo_reports_without_failing() {
        let tmp = repo(&[("a.md", "aaaa"), ("b.md", "bb")]);
        let options = ManifestOptions {
            include_ignored: false,
            limits: PreflightLimits {
                max_total_bytes: Some(3),
                ..Default::default()
            },
        };
        let (result, violation) = preflight_repo(tmp.path(), &options, &StaticIgnore(None)).unwrap();
        assert_eq!(result.total_bytes, 6);
        assert_eq!(violation.unwrap().kind, PreflightKind::MaxTotalBytes);
    }
}
