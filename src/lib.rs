//! agentsync library
//!
//! Snapshot upload and patch application for repositories of AI-assistant
//! configuration files, talking to the CLI sync API.

pub mod blob_pool;
pub mod checkpoint;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fs_enum;
pub mod git;
pub mod logger;
pub mod manifest;
pub mod patch;
pub mod preflight;
pub mod progress;
pub mod protocol;
pub mod upload;

pub use blob_pool::{BlobSink, CancelToken};
pub use client::{ClientConfig, RetryPolicy, SyncClient};
pub use error::{ApiError, Result, SyncError};
pub use git::{GitCli, GitOps};
pub use manifest::{build_manifest, Manifest, ManifestEntry, ManifestOptions};
pub use patch::{apply_patches, fetch_patch, fetch_patches, ApplyOptions, PatchApplyStatus};
pub use preflight::{PreflightError, PreflightLimits, PreflightResult};
pub use upload::{upload_snapshot, UploadContext, UploadOutcome, UploadRequest};
