//! Snapshot size limits, checked before anything is sent to the server

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::fs_enum::FileRecord;

/// Upper bounds for a snapshot; `None` or zero means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightLimits {
    pub max_files: Option<u64>,
    pub max_total_bytes: Option<u64>,
    pub max_file_bytes: Option<u64>,
}

/// Aggregates over the file set that would be snapshotted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResult {
    pub file_count: u64,
    pub total_bytes: u64,
    /// Size of the largest single file
    pub max_file_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightKind {
    MaxFiles,
    MaxTotalBytes,
    MaxFileBytes,
}

impl fmt::Display for PreflightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PreflightKind::MaxFiles => "max_files",
            PreflightKind::MaxTotalBytes => "max_total_bytes",
            PreflightKind::MaxFileBytes => "max_file_bytes",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("preflight limit {kind} exceeded: {actual} > {limit}")]
pub struct PreflightError {
    pub kind: PreflightKind,
    pub limit: u64,
    pub actual: u64,
}

pub fn compute(records: &[FileRecord]) -> PreflightResult {
    records.iter().fold(PreflightResult::default(), |mut acc, r| {
        acc.file_count += 1;
        acc.total_bytes += r.size;
        acc.max_file_bytes = acc.max_file_bytes.max(r.size);
        acc
    })
}

/// Enforce limits: per-file size, then count, then total bytes
pub fn check(result: &PreflightResult, limits: &PreflightLimits) -> Result<(), PreflightError> {
    let checks = [
        (PreflightKind::MaxFileBytes, limits.max_file_bytes, result.max_file_bytes),
        (PreflightKind::MaxFiles, limits.max_files, result.file_count),
        (PreflightKind::MaxTotalBytes, limits.max_total_bytes, result.total_bytes),
    ];
    for (kind, limit, actual) in checks {
        match limit {
            Some(limit) if limit > 0 && actual > limit => {
                return Err(PreflightError { kind, limit, actual });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Dry preflight: aggregates plus the first violated limit, if any
pub fn preflight_records(
    records: &[FileRecord],
    limits: &PreflightLimits,
) -> (PreflightResult, Option<PreflightError>) {
    let result = compute(records);
    let violation = check(&result, limits).err();
    (result, violation)
}
