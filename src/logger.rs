use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{Result, SyncError};
use crate::patch::PatchApplyStatus;

/// Audit trail of sync events (`--log-file`)
pub trait Logger: Send + Sync {
    fn start(&self, _op: &str, _repo: &Path) {}
    fn handshake(&self, _snapshot_id: &str, _missing: usize, _resumed: bool) {}
    fn blob_done(&self, _hash: &str, _bytes: u64) {}
    fn finalized(&self, _snapshot_id: &str) {}
    fn patch(&self, _patch_id: &str, _path: &str, _status: PatchApplyStatus) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _blobs: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SyncError::io(path, e))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, op: &str, repo: &Path) {
        self.line(&format!("START op={} repo={}", op, repo.display()));
    }
    fn handshake(&self, snapshot_id: &str, missing: usize, resumed: bool) {
        self.line(&format!(
            "HANDSHAKE snapshot={snapshot_id} missing={missing} resumed={resumed}"
        ));
    }
    fn blob_done(&self, hash: &str, bytes: u64) {
        self.line(&format!("BLOB sha256={hash} bytes={bytes}"));
    }
    fn finalized(&self, snapshot_id: &str) {
        self.line(&format!("FINALIZE snapshot={snapshot_id}"));
    }
    fn patch(&self, patch_id: &str, path: &str, status: PatchApplyStatus) {
        self.line(&format!("PATCH id={patch_id} path={path} status={status}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn done(&self, blobs: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE blobs={blobs} bytes={bytes} seconds={seconds:.3}"));
    }
}
