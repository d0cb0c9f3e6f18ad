//! Snapshot upload: manifest, handshake, blob transfer, finalize
//!
//! The checkpoint written after the handshake is what makes a failed run
//! resumable. It is only removed once finalize succeeds.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::blob_pool::{upload_blobs, BlobJobs, CancelToken, PoolOptions};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::client::SyncClient;
use crate::error::{Result, SyncError};
use crate::git::GitOps;
use crate::logger::{Logger, NoopLogger};
use crate::manifest::{build_manifest, ManifestOptions};
use crate::preflight::PreflightResult;
use crate::progress::{ProgressEvent, ProgressSink, Stage};
use crate::protocol::{HandshakeRequest, ProjectIdentity, UploadMode};

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub project: ProjectIdentity,
    pub repo_root: PathBuf,
    pub manifest: ManifestOptions,
    /// Explicit key; otherwise the checkpoint's or the manifest hash
    pub idempotency_key: Option<String>,
    /// Explicit delta base; otherwise the checkpoint's snapshot on resume
    pub base_snapshot_id: Option<String>,
    /// Worker count; 0 means the default
    pub concurrency: usize,
    pub max_blob_bytes: Option<u64>,
}

pub struct UploadContext {
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub logger: Arc<dyn Logger>,
    pub cancel: CancelToken,
}

impl Default for UploadContext {
    fn default() -> Self {
        Self {
            progress: None,
            logger: Arc::new(NoopLogger),
            cancel: CancelToken::new(),
        }
    }
}

impl UploadContext {
    fn stage(&self, stage: Stage) {
        if let Some(p) = &self.progress {
            p.report(ProgressEvent::stage(stage));
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub snapshot_id: String,
    pub manifest_hash: String,
    pub uploaded_blobs: u64,
    pub uploaded_bytes: u64,
    pub preflight: PreflightResult,
    /// A matching checkpoint from an earlier run was reused
    pub resumed: bool,
}

pub async fn upload_snapshot(
    client: &Arc<SyncClient>,
    git: &dyn GitOps,
    store: &CheckpointStore,
    request: UploadRequest,
    ctx: &UploadContext,
) -> Result<UploadOutcome> {
    let started = Instant::now();
    if request.project.is_empty() {
        return Err(SyncError::Config(
            "a project id, slug, or name is required".into(),
        ));
    }

    ctx.stage(Stage::Manifest);
    let built = build_manifest(&request.repo_root, &request.manifest, git)?;
    let root = built.root.clone();
    let manifest = &built.manifest;
    ctx.logger.start("upload", &root);
    tracing::debug!(
        files = manifest.entries.len(),
        hash = %manifest.hash,
        "manifest built"
    );

    let resume = store.load(&root)?.filter(|cp| cp.matches(&manifest.hash));
    let resumed = resume.is_some();
    if resumed {
        tracing::info!("resuming upload from checkpoint for {}", root.display());
    }
    let base_snapshot_id = request
        .base_snapshot_id
        .clone()
        .or_else(|| resume.as_ref().map(|cp| cp.snapshot_id.clone()));
    let idempotency_key = request
        .idempotency_key
        .clone()
        .or_else(|| resume.as_ref().map(|cp| cp.manifest_hash.clone()))
        .unwrap_or_else(|| manifest.hash.clone());

    ctx.check_cancelled()?;
    ctx.stage(Stage::Handshake);
    let project = &request.project;
    let handshake = client
        .handshake(&HandshakeRequest {
            project_id: project.id.as_deref(),
            project_slug: project.slug.as_deref(),
            project_name: project.name.as_deref(),
            base_snapshot_id: base_snapshot_id.as_deref(),
            idempotency_key: Some(&idempotency_key),
            manifest: manifest.into(),
        })
        .await?;
    ctx.logger
        .handshake(&handshake.snapshot_id, handshake.missing_blobs.len(), resumed);

    let mut checkpoint = Checkpoint::new(
        &root,
        handshake.snapshot_id.clone(),
        manifest.hash.clone(),
        handshake.missing_blobs.clone(),
        handshake.upload.url.clone(),
    );
    store.save(&checkpoint)?;

    let mut uploaded_blobs = 0;
    let mut uploaded_bytes = 0;
    if !handshake.missing_blobs.is_empty() {
        if handshake.upload.mode != UploadMode::Direct {
            return Err(SyncError::UnsupportedUploadMode(
                handshake.upload.mode.as_str().to_string(),
            ));
        }
        if handshake.upload.url.is_empty() {
            return Err(SyncError::Protocol("handshake upload plan has no url".into()));
        }

        ctx.check_cancelled()?;
        ctx.stage(Stage::Upload);
        let entries = manifest.entries_by_blob();
        let jobs = BlobJobs {
            root: root.clone(),
            snapshot_id: handshake.snapshot_id.clone(),
            upload_url: handshake.upload.url.clone(),
            entries,
        };
        let options = PoolOptions {
            concurrency: request.concurrency,
            max_blob_bytes: request.max_blob_bytes,
            cancel: ctx.cancel.clone(),
            progress: ctx.progress.clone(),
        };
        let sink: Arc<SyncClient> = Arc::clone(client);

        match upload_blobs(sink, jobs, &handshake.missing_blobs, options).await {
            Ok(stats) => {
                for hash in &stats.completed {
                    let size = manifest
                        .entries
                        .iter()
                        .find(|e| &e.blob_hash == hash)
                        .map_or(0, |e| e.size);
                    ctx.logger.blob_done(hash, size);
                }
                uploaded_blobs = stats.uploaded_blobs;
                uploaded_bytes = stats.uploaded_bytes;
            }
            Err(failure) => {
                let done: HashSet<&String> = failure.stats.completed.iter().collect();
                checkpoint.missing_blobs.retain(|h| !done.contains(h));
                store.save(&checkpoint)?;
                ctx.logger.error("upload", &failure.error.to_string());
                return Err(failure.error);
            }
        }
    }

    ctx.check_cancelled()?;
    ctx.stage(Stage::Finalize);
    match client.complete(&handshake.snapshot_id).await {
        Ok(_) => {}
        Err(SyncError::MissingBlobs {
            snapshot_id,
            missing,
        }) => {
            checkpoint.missing_blobs = missing.clone();
            store.save(&checkpoint)?;
            ctx.logger.error(
                "finalize",
                &format!("server still missing {} blob(s)", missing.len()),
            );
            return Err(SyncError::MissingBlobs {
                snapshot_id,
                missing,
            });
        }
        Err(e) => {
            ctx.logger.error("finalize", &e.to_string());
            return Err(e);
        }
    }

    store.clear(&root)?;
    ctx.logger.finalized(&handshake.snapshot_id);
    ctx.logger
        .done(uploaded_blobs, uploaded_bytes, started.elapsed().as_secs_f64());

    Ok(UploadOutcome {
        snapshot_id: handshake.snapshot_id,
        manifest_hash: manifest.hash.clone(),
        uploaded_blobs,
        uploaded_bytes,
        preflight: built.preflight,
        resumed,
    })
}
