//! Error taxonomy for snapshot upload and patch application

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::git::GitError;
use crate::preflight::PreflightError;

/// Non-success response from the sync server
#[derive(Debug, Clone, Error)]
#[error("{}", self.render())]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    /// Parsed `Retry-After` header, if the server sent one
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// 401/403: the token is expired or lacks access
    pub fn is_auth(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn is_transient(&self) -> bool {
        self.status == 429 || (500..600).contains(&self.status)
    }

    fn render(&self) -> String {
        if self.is_auth() {
            format!(
                "server rejected credentials (HTTP {}): {}; run `agentsync login` again",
                self.status, self.message
            )
        } else {
            format!("server error (HTTP {}): {}", self.status, self.message)
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// Finalize found blobs the server still lacks
    #[error("snapshot {snapshot_id} is incomplete: server is missing {} blob(s)", missing.len())]
    MissingBlobs {
        snapshot_id: String,
        missing: Vec<String>,
    },

    #[error("patch {patch_id} rejected: unsafe path {path:?} ({reason})")]
    PatchValidation {
        patch_id: String,
        path: String,
        reason: String,
    },

    #[error("patch {patch_id} has an empty body")]
    EmptyPatch { patch_id: String },

    #[error("working tree has uncommitted changes; commit or stash them, or pass --force")]
    DirtyWorkingTree,

    #[error("{path} changed during upload: expected sha256 {expected}, found {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("{path} changed during upload: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("{path} is {size} bytes, over the {limit} byte blob limit")]
    BlobTooLarge { path: String, size: u64, limit: u64 },

    #[error("upload mode {0:?} is not supported by this client")]
    UnsupportedUploadMode(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not authenticated: {0}; run `agentsync login` again")]
    Auth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("upload worker crashed: {0}")]
    WorkerFault(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk repository: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same request could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Api(e) => e.is_transient(),
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Server-provided delay before the next attempt; only a 429 sets one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Api(e) if e.status == 429 => e.retry_after,
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Api(e) => e.is_auth(),
            SyncError::Auth(_) => true,
            _ => false,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Preflight(_) => 3,
            _ if self.is_auth() => 4,
            SyncError::MissingBlobs { .. } => 5,
            SyncError::PatchValidation { .. } | SyncError::EmptyPatch { .. } => 6,
            SyncError::DirtyWorkingTree => 7,
            SyncError::Cancelled => 130,
            SyncError::Api(_) | SyncError::Http(_) | SyncError::Protocol(_) => 8,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_carry_login_guidance() {
        let err = SyncError::Api(ApiError::new(401, "token expired"));
        assert!(err.is_auth());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("login"));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn transient_classification() {
        assert!(SyncError::Api(ApiError::new(503, "busy")).is_transient());
        assert!(SyncError::Api(ApiError::new(429, "slow down")).is_transient());
        assert!(!SyncError::Api(ApiError::new(400, "bad")).is_transient());
        let mismatch = SyncError::HashMismatch {
            path: "a.md".into(),
            expected: "x".into(),
            actual: "y".into(),
        };
        assert!(!mismatch.is_transient());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let mut busy = ApiError::new(503, "busy");
        busy.retry_after = Some(Duration::from_secs(3));
        assert_eq!(SyncError::Api(busy).retry_after(), None);

        let mut slow = ApiError::new(429, "slow down");
        slow.retry_after = Some(Duration::from_secs(3));
        assert_eq!(SyncError::Api(slow).retry_after(), Some(Duration::from_secs(3)));
    }
}
