//! Fetching server-proposed patches and applying them to the working tree
//!
//! Every path a patch mentions is validated before anything is applied: one
//! unsafe path rejects the whole batch. Patches are applied in the order
//! given, one at a time, and each success is recorded immediately in
//! `<git-dir>/agentsync/applied-patches.json` so it is never applied twice.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::client::SyncClient;
use crate::error::{Result, SyncError};
use crate::git::{git_dir, GitError, GitOps};
use crate::logger::Logger;
use crate::protocol::{endpoints, Patch, PatchListResponse, PatchResponse, TOOL_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchApplyStatus {
    Applied,
    DryRun,
    Skipped,
    Conflict,
    Failed,
}

impl fmt::Display for PatchApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            PatchApplyStatus::Applied => "applied",
            PatchApplyStatus::DryRun => "dry-run",
            PatchApplyStatus::Skipped => "skipped",
            PatchApplyStatus::Conflict => "conflict",
            PatchApplyStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    pub patch_id: String,
    pub path: String,
    pub status: PatchApplyStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// One entry per attempted patch, in input order; stops at a halt
    pub results: Vec<PatchResult>,
}

impl ApplyReport {
    pub fn count(&self, status: PatchApplyStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Whether a conflict or failure stopped the batch
    pub fn halted(&self) -> bool {
        self.results.last().is_some_and(|r| {
            matches!(r.status, PatchApplyStatus::Conflict | PatchApplyStatus::Failed)
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub dry_run: bool,
    /// Skip the clean-working-tree check
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPatch {
    pub patch_id: String,
    pub snapshot_id: String,
    pub path: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    #[serde(default)]
    pub applied: Vec<AppliedPatch>,
}

impl AppliedState {
    pub fn path(repo_root: &Path) -> PathBuf {
        git_dir(repo_root)
            .join(TOOL_NAME)
            .join("applied-patches.json")
    }

    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = Self::path(repo_root);
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(SyncError::io(&path, e)),
        }
    }

    pub fn save(&self, repo_root: &Path) -> Result<()> {
        let path = Self::path(repo_root);
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        std::fs::create_dir_all(&dir).map_err(|e| SyncError::io(&dir, e))?;
        let data = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| SyncError::io(&dir, e))?;
        tmp.write_all(&data).map_err(|e| SyncError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| SyncError::io(&path, e.error))?;
        Ok(())
    }

    pub fn contains(&self, patch_id: &str) -> bool {
        self.applied.iter().any(|a| a.patch_id == patch_id)
    }

    pub fn record(&mut self, patch: &Patch) {
        self.applied.push(AppliedPatch {
            patch_id: patch.id.clone(),
            snapshot_id: patch.snapshot_id.clone(),
            path: patch.path.clone(),
            applied_at: Utc::now().to_rfc3339(),
        });
    }
}

pub async fn fetch_patches(client: &SyncClient, snapshot_id: &str) -> Result<Vec<Patch>> {
    let resp: Option<PatchListResponse> = client
        .get_json(
            endpoints::PATCHES,
            &[("snapshotId", snapshot_id), ("includeBody", "1")],
        )
        .await?;
    Ok(resp.map(|r| r.patches).unwrap_or_default())
}

pub async fn fetch_patch(client: &SyncClient, patch_id: &str) -> Result<Patch> {
    let resp: Option<PatchResponse> = client
        .get_json(endpoints::PATCHES, &[("patchId", patch_id)])
        .await?;
    resp.and_then(|r| r.patch)
        .ok_or_else(|| SyncError::Protocol(format!("server returned no patch for id {patch_id}")))
}

/// Apply patches in order; see the module docs for the safety rules
pub fn apply_patches(
    repo_root: &Path,
    patches: &[Patch],
    options: ApplyOptions,
    git: &dyn GitOps,
    logger: &dyn Logger,
) -> Result<ApplyReport> {
    let mut state = AppliedState::load(repo_root)?;

    // Validate everything up front so a bad patch leaves no partial state
    for patch in patches.iter().filter(|p| p.is_proposed() && !state.contains(&p.id)) {
        let body = patch.patch_body.as_deref().unwrap_or("");
        if body.trim().is_empty() {
            return Err(SyncError::EmptyPatch {
                patch_id: patch.id.clone(),
            });
        }
        validate_patch_paths(&patch.id, body)?;
    }

    let mut report = ApplyReport::default();
    let mut tree_checked = options.dry_run || options.force;

    for patch in patches {
        let skip_reason = if !patch.is_proposed() {
            Some(format!("server status {}", patch.status))
        } else if state.contains(&patch.id) {
            Some("already applied".to_string())
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            tracing::debug!(patch = %patch.id, "skipping: {reason}");
            push_result(&mut report, logger, patch, PatchApplyStatus::Skipped, Some(reason));
            continue;
        }

        if !tree_checked {
            if !git.is_clean(repo_root)? {
                return Err(SyncError::DirtyWorkingTree);
            }
            tree_checked = true;
        }

        let mut body = patch.patch_body.clone().unwrap_or_default();
        if !body.ends_with('\n') {
            body.push('\n');
        }

        match git.apply_patch(repo_root, body.as_bytes(), options.dry_run) {
            Ok(()) if options.dry_run => {
                push_result(&mut report, logger, patch, PatchApplyStatus::DryRun, None);
            }
            Ok(()) => {
                state.record(patch);
                state.save(repo_root)?;
                push_result(&mut report, logger, patch, PatchApplyStatus::Applied, None);
            }
            Err(GitError::Conflict(msg)) => {
                push_result(&mut report, logger, patch, PatchApplyStatus::Conflict, Some(msg));
                if !options.dry_run {
                    break;
                }
            }
            Err(e) => {
                push_result(&mut report, logger, patch, PatchApplyStatus::Failed, Some(e.to_string()));
                break;
            }
        }
    }

    Ok(report)
}

fn push_result(
    report: &mut ApplyReport,
    logger: &dyn Logger,
    patch: &Patch,
    status: PatchApplyStatus,
    message: Option<String>,
) {
    logger.patch(&patch.id, &patch.path, status);
    report.results.push(PatchResult {
        patch_id: patch.id.clone(),
        path: patch.path.clone(),
        status,
        message,
    });
}

/// Reject any header path that is absolute, escapes the repo, uses
/// backslashes, or points into `.git`
pub fn validate_patch_paths(patch_id: &str, body: &str) -> Result<()> {
    for path in header_paths(body) {
        if let Err(reason) = check_path(&path) {
            return Err(SyncError::PatchValidation {
                patch_id: patch_id.to_string(),
                path,
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}

/// Decoded paths from file headers, skipping hunk bodies
fn header_paths(body: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut old_left = 0u64;
    let mut new_left = 0u64;

    for line in body.lines() {
        if old_left > 0 || new_left > 0 {
            match line.as_bytes().first() {
                Some(b' ') | None => {
                    old_left = old_left.saturating_sub(1);
                    new_left = new_left.saturating_sub(1);
                    continue;
                }
                Some(b'-') if old_left > 0 => {
                    old_left -= 1;
                    continue;
                }
                Some(b'+') if new_left > 0 => {
                    new_left -= 1;
                    continue;
                }
                Some(b'\\') => continue,
                // Hunk ended early; treat the line as a header
                _ => {
                    old_left = 0;
                    new_left = 0;
                }
            }
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            let mut rest = rest;
            while let Some((token, tail)) = next_token(rest) {
                push_prefixed(&mut paths, token);
                rest = tail;
            }
        } else if let Some(rest) = line.strip_prefix("--- ").or_else(|| line.strip_prefix("+++ ")) {
            let token = header_token(rest);
            if token != "/dev/null" {
                push_prefixed(&mut paths, token);
            }
        } else if let Some(rest) = ["rename from ", "rename to ", "copy from ", "copy to "]
            .iter()
            .find_map(|p| line.strip_prefix(p))
        {
            paths.push(header_token(rest));
        } else if line.starts_with("@@ ") {
            if let Some((old, new)) = hunk_counts(line) {
                old_left = old;
                new_left = new;
            }
        }
    }
    paths
}

/// `---`/`+++`/rename operands: quoted, or everything up to a tab
fn header_token(rest: &str) -> String {
    if rest.starts_with('"') {
        if let Some((token, _)) = next_token(rest) {
            return token;
        }
    }
    rest.split('\t').next().unwrap_or("").trim_end().to_string()
}

/// `git apply` drops the first component of prefixed paths whatever it is,
/// so both the written form and the stripped form must be safe
fn push_prefixed(paths: &mut Vec<String>, token: String) {
    if let Some((_, rest)) = token.split_once('/') {
        paths.push(rest.to_string());
    }
    paths.push(token);
}

/// Next whitespace-separated or C-quoted token and the remaining input
fn next_token(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    if let Some(quoted) = s.strip_prefix('"') {
        let mut out = Vec::new();
        let bytes = quoted.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'"' => {
                    return Some((String::from_utf8_lossy(&out).into_owned(), &quoted[i + 1..]));
                }
                b'\\' if i + 1 < bytes.len() => {
                    i += 1;
                    let c = bytes[i];
                    match c {
                        b'0'..=b'7' => {
                            let mut val = 0u32;
                            let mut n = 0;
                            while n < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                                val = val * 8 + (bytes[i] - b'0') as u32;
                                i += 1;
                                n += 1;
                            }
                            out.push(val as u8);
                            continue;
                        }
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'v' => out.push(0x0b),
                        other => out.push(other),
                    }
                }
                b => out.push(b),
            }
            i += 1;
        }
        // Unterminated quote: keep what we have so it is still validated
        return Some((String::from_utf8_lossy(&out).into_owned(), ""));
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((s[..end].to_string(), &s[end..]))
}

fn hunk_counts(line: &str) -> Option<(u64, u64)> {
    let mut parts = line.split_whitespace().skip(1);
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    let count = |range: &str| -> Option<u64> {
        match range.split_once(',') {
            Some((_, n)) => n.parse().ok(),
            None => range.parse::<u64>().ok().map(|_| 1),
        }
    };
    Some((count(old)?, count(new)?))
}

fn check_path(path: &str) -> std::result::Result<(), &'static str> {
    if path.is_empty() {
        return Err("empty path");
    }
    if path.contains('\0') {
        return Err("NUL byte in path");
    }
    if path.contains('\\') {
        return Err("backslash in path");
    }
    let bytes = path.as_bytes();
    if path.starts_with('/') || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':') {
        return Err("absolute path");
    }

    let mut depth = 0i64;
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return Err("path escapes the repository");
                }
            }
            c if c.eq_ignore_ascii_case(".git") => return Err("path targets .git"),
            _ => depth += 1,
        }
    }
    Ok(())
}
