//! Bounded worker pool that uploads missing blobs
//!
//! Workers drain a shared queue of blob hashes. The first failure from any
//! worker (error or panic) cancels the pool: remaining workers stop pulling
//! jobs, in-flight sends are abandoned, and exactly that one error is
//! returned. Upload order carries no meaning since blobs are content-addressed.

use async_trait::async_trait;
use base64::Engine as _;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::checksum::sha256_hex;
use crate::error::{Result, SyncError};
use crate::manifest::ManifestEntry;
use crate::progress::{ProgressEvent, ProgressSink, Stage};
use crate::protocol::{self, BlobUploadRequest};

/// Destination for blob uploads (the sync client in production)
#[async_trait]
pub trait BlobSink: Send + Sync {
    async fn put_blob(&self, url: &str, request: BlobUploadRequest) -> Result<()>;
}

/// Cloneable cancellation flag shared by the pool and its caller
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives in self, so wait_for only fails if it is dropped
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Token cancelled by this one, but not the other way round
    pub fn child(&self) -> (CancelToken, tokio::task::JoinHandle<()>) {
        let child = CancelToken::new();
        let parent = self.clone();
        let forward = child.clone();
        let handle = tokio::spawn(async move {
            parent.cancelled().await;
            forward.cancel();
        });
        (child, handle)
    }
}

#[derive(Clone)]
pub struct PoolOptions {
    /// Worker count; 0 means the default
    pub concurrency: usize,
    /// Largest blob that may be sent inline as base64
    pub max_blob_bytes: Option<u64>,
    pub cancel: CancelToken,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency: protocol::DEFAULT_CONCURRENCY,
            max_blob_bytes: None,
            cancel: CancelToken::new(),
            progress: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub uploaded_blobs: u64,
    pub uploaded_bytes: u64,
    /// Hashes accepted by the server, in completion order
    pub completed: Vec<String>,
}

/// Pool error plus what finished before it
#[derive(Debug)]
pub struct PoolFailure {
    pub error: SyncError,
    pub stats: PoolStats,
}

/// Everything a worker needs to turn a blob hash into a request
pub struct BlobJobs {
    pub root: PathBuf,
    pub snapshot_id: String,
    pub upload_url: String,
    /// Manifest entries keyed by blob hash
    pub entries: HashMap<String, ManifestEntry>,
}

struct Shared {
    jobs: BlobJobs,
    queue: Mutex<VecDeque<String>>,
    total: u64,
    uploaded_blobs: AtomicU64,
    uploaded_bytes: AtomicU64,
    completed: Mutex<Vec<String>>,
    // Serializes progress callbacks so counts are reported in order
    progress_lock: Mutex<()>,
    progress: Option<Arc<dyn ProgressSink>>,
    max_blob_bytes: Option<u64>,
    cancel: CancelToken,
}

impl Shared {
    fn stats(&self) -> PoolStats {
        PoolStats {
            uploaded_blobs: self.uploaded_blobs.load(Ordering::SeqCst),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::SeqCst),
            completed: self.completed.lock().clone(),
        }
    }

    fn record(&self, hash: &str, size: u64) {
        let _guard = self.progress_lock.lock();
        let done = self.uploaded_blobs.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = self.uploaded_bytes.fetch_add(size, Ordering::SeqCst) + size;
        self.completed.lock().push(hash.to_string());
        if let Some(sink) = &self.progress {
            sink.report(ProgressEvent {
                stage: Stage::Upload,
                completed: done,
                total: self.total,
                bytes,
            });
        }
    }
}

/// Upload every hash in `missing` exactly once
pub async fn upload_blobs(
    sink: Arc<dyn BlobSink>,
    jobs: BlobJobs,
    missing: &[String],
    options: PoolOptions,
) -> std::result::Result<PoolStats, PoolFailure> {
    // Duplicate hashes in the server list still map to one upload
    let mut seen = std::collections::HashSet::new();
    let queue: VecDeque<String> = missing
        .iter()
        .filter(|h| seen.insert(h.as_str()))
        .cloned()
        .collect();
    if queue.is_empty() {
        return Ok(PoolStats::default());
    }
    if options.cancel.is_cancelled() {
        return Err(PoolFailure {
            error: SyncError::Cancelled,
            stats: PoolStats::default(),
        });
    }

    let concurrency = match options.concurrency {
        0 => protocol::DEFAULT_CONCURRENCY,
        n => n,
    }
    .min(queue.len());
    let (cancel, forwarder) = options.cancel.child();

    let shared = Arc::new(Shared {
        jobs,
        total: queue.len() as u64,
        queue: Mutex::new(queue),
        uploaded_blobs: AtomicU64::new(0),
        uploaded_bytes: AtomicU64::new(0),
        completed: Mutex::new(Vec::new()),
        progress_lock: Mutex::new(()),
        progress: options.progress,
        max_blob_bytes: options.max_blob_bytes,
        cancel: cancel.clone(),
    });

    // Capacity 1: the first error is kept, later ones are dropped
    let (err_tx, mut err_rx) = mpsc::channel::<SyncError>(1);
    let mut handles = Vec::with_capacity(concurrency);

    for worker_id in 0..concurrency {
        let shared = Arc::clone(&shared);
        let sink = Arc::clone(&sink);
        let err_tx = err_tx.clone();

        handles.push(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(worker_loop(&shared, sink.as_ref()))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(panic) => SyncError::WorkerFault(format!(
                    "worker {worker_id}: {}",
                    panic_message(panic.as_ref())
                )),
            };
            shared.cancel.cancel();
            let _ = err_tx.try_send(error);
        }));
    }
    drop(err_tx);

    let mut join_fault = None;
    for handle in handles {
        if let Err(join_err) = handle.await {
            cancel.cancel();
            join_fault.get_or_insert(SyncError::WorkerFault(join_err.to_string()));
        }
    }
    forwarder.abort();

    let stats = shared.stats();
    if let Some(error) = err_rx.try_recv().ok().or(join_fault) {
        return Err(PoolFailure { error, stats });
    }
    if options.cancel.is_cancelled() {
        return Err(PoolFailure {
            error: SyncError::Cancelled,
            stats,
        });
    }
    if stats.uploaded_blobs != shared.total {
        return Err(PoolFailure {
            error: SyncError::WorkerFault("worker exited before the queue drained".into()),
            stats,
        });
    }
    Ok(stats)
}

async fn worker_loop(shared: &Shared, sink: &dyn BlobSink) -> Result<()> {
    loop {
        if shared.cancel.is_cancelled() {
            return Ok(());
        }
        let Some(hash) = shared.queue.lock().pop_front() else {
            return Ok(());
        };

        let entry = shared.jobs.entries.get(&hash).ok_or_else(|| {
            SyncError::Protocol(format!("server requested blob {hash} which is not in the manifest"))
        })?;
        let request = prepare_blob(&shared.jobs.root, &shared.jobs.snapshot_id, entry, shared.max_blob_bytes).await?;

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(()),
            sent = sink.put_blob(&shared.jobs.upload_url, request) => sent?,
        }
        shared.record(&hash, entry.size);
    }
}

/// Re-read and re-verify a file against its manifest entry
pub async fn prepare_blob(
    root: &Path,
    snapshot_id: &str,
    entry: &ManifestEntry,
    max_blob_bytes: Option<u64>,
) -> Result<BlobUploadRequest> {
    if let Some(limit) = max_blob_bytes.filter(|l| *l > 0) {
        if entry.size > limit {
            return Err(SyncError::BlobTooLarge {
                path: entry.path.clone(),
                size: entry.size,
                limit,
            });
        }
    }

    let abs = root.join(&entry.path);
    let data = tokio::fs::read(&abs).await.map_err(|e| SyncError::io(&abs, e))?;
    if data.len() as u64 != entry.size {
        return Err(SyncError::SizeMismatch {
            path: entry.path.clone(),
            expected: entry.size,
            actual: data.len() as u64,
        });
    }
    let actual = sha256_hex(&data);
    if actual != entry.blob_hash {
        return Err(SyncError::HashMismatch {
            path: entry.path.clone(),
            expected: entry.blob_hash.clone(),
            actual,
        });
    }

    Ok(BlobUploadRequest {
        snapshot_id: snapshot_id.to_string(),
        sha256: actual,
        size_bytes: entry.size,
        content_base64: base64::engine::general_purpose::STANDARD.encode(&data),
        content_type: protocol::content_type_for(&entry.path).map(str::to_string),
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<BlobUploadRequest>>,
        fail_on: Option<String>,
        panic_on: Option<String>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlobSink for RecordingSink {
        async fn put_blob(&self, _url: &str, request: BlobUploadRequest) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.panic_on.as_deref() == Some(request.sha256.as_str()) {
                panic!("sink exploded");
            }
            if self.fail_on.as_deref() == Some(request.sha256.as_str()) {
                return Err(crate::error::ApiError::new(400, "rejected").into());
            }
            self.sent.lock().push(request);
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        jobs: BlobJobs,
        hashes: Vec<String>,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut entries = HashMap::new();
        let mut hashes = Vec::new();
        for (path, body) in files {
            std::fs::write(tmp.path().join(path), body).unwrap();
            let hash = sha256_hex(body.as_bytes());
            hashes.push(hash.clone());
            entries.insert(
                hash.clone(),
                ManifestEntry {
                    path: path.to_string(),
                    blob_hash: hash,
                    size: body.len() as u64,
                    mode: 0o644,
                    mtime: 0,
                    is_deleted: false,
                },
            );
        }
        Fixture {
            jobs: BlobJobs {
                root: tmp.path().to_path_buf(),
                snapshot_id: "snap".into(),
                upload_url: "/blob".into(),
                entries,
            },
            _tmp: tmp,
            hashes,
        }
    }

    struct CountingProgress(Mutex<Vec<u64>>);

    impl ProgressSink for CountingProgress {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().push(event.completed);
        }
    }

    #[tokio::test]
    async fn test_uploads_each_blob_once_with_ordered_progress() {
        let fx = fixture(&[("a.md", "alpha"), ("b.md", "beta"), ("c.md", "gamma")]);
        let sink = Arc::new(RecordingSink::default());
        let progress = Arc::new(CountingProgress(Mutex::new(Vec::new())));
        let mut missing = fx.hashes.clone();
        missing.push(fx.hashes[0].clone());

        let options = PoolOptions {
            concurrency: 8,
            progress: Some(progress.clone()),
            ..Default::default()
        };
        let stats = upload_blobs(sink.clone(), fx.jobs, &missing, options).await.unwrap();

        assert_eq!(stats.uploaded_blobs, 3);
        assert_eq!(stats.uploaded_bytes, 5 + 4 + 5);
        assert_eq!(sink.sent.lock().len(), 3);
        assert_eq!(*progress.0.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_first_error_cancels_pool() {
        let files: Vec<(String, String)> = (0..20).map(|i| (format!("f{i}.md"), format!("body {i}"))).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let fx = fixture(&refs);
        let sink = Arc::new(RecordingSink {
            fail_on: Some(fx.hashes[0].clone()),
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });

        let options = PoolOptions {
            concurrency: 2,
            ..Default::default()
        };
        let failure = upload_blobs(sink.clone(), fx.jobs, &fx.hashes, options).await.unwrap_err();
        assert!(matches!(failure.error, SyncError::Api(_)), "{:?}", failure.error);
        assert!(sink.calls.load(Ordering::SeqCst) < 20);
        assert_eq!(failure.stats.uploaded_blobs as usize, failure.stats.completed.len());
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_fault() {
        let fx = fixture(&[("a.md", "alpha"), ("b.md", "beta")]);
        let sink = Arc::new(RecordingSink {
            panic_on: Some(fx.hashes[1].clone()),
            ..Default::default()
        });
        let failure = upload_blobs(sink, fx.jobs, &fx.hashes, PoolOptions::default())
            .await
            .unwrap_err();
        match failure.error {
            SyncError::WorkerFault(msg) => assert!(msg.contains("sink exploded"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_modified_file_is_integrity_error() {
        let fx = fixture(&[("a.md", "alpha")]);
        std::fs::write(fx.jobs.root.join("a.md"), "ALPHA").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let failure = upload_blobs(sink.clone(), fx.jobs, &fx.hashes, PoolOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, SyncError::HashMismatch { .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_blob_rejected_before_read() {
        let fx = fixture(&[("a.md", "0123456789")]);
        let sink = Arc::new(RecordingSink::default());
        let options = PoolOptions {
            max_blob_bytes: Some(4),
            ..Default::default()
        };
        let failure = upload_blobs(sink, fx.jobs, &fx.hashes, options).await.unwrap_err();
        assert!(matches!(failure.error, SyncError::BlobTooLarge { size: 10, limit: 4, .. }));
    }

    #[tokio::test]
    async fn test_unknown_hash_is_protocol_error() {
        let fx = fixture(&[("a.md", "alpha")]);
        let sink = Arc::new(RecordingSink::default());
        let failure = upload_blobs(sink, fx.jobs, &["feed".to_string()], PoolOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let fx = fixture(&[("a.md", "alpha")]);
        let sink = Arc::new(RecordingSink::default());
        let options = PoolOptions::default();
        options.cancel.cancel();
        let failure = upload_blobs(sink, fx.jobs, &fx.hashes, options).await.unwrap_err();
        assert!(matches!(failure.error, SyncError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let fx = fixture(&[]);
        let sink = Arc::new(RecordingSink::default());
        let stats = upload_blobs(sink, fx.jobs, &[], PoolOptions::default()).await.unwrap();
        assert_eq!(stats, PoolStats::default());
    }
}
