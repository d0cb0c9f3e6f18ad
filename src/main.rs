//! agentsync - snapshot upload and patch sync for AI-assistant config files

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use agentsync::blob_pool::CancelToken;
use agentsync::checkpoint::CheckpointStore;
use agentsync::cli::{Cli, Command, ProjectArgs, ScanArgs};
use agentsync::config::Settings;
use agentsync::git::GitCli;
use agentsync::logger::{Logger, NoopLogger, TextLogger};
use agentsync::manifest::{preflight_repo, ManifestOptions};
use agentsync::patch::{apply_patches, fetch_patch, fetch_patches, ApplyOptions, PatchApplyStatus};
use agentsync::progress::{CargoProgress, ProgressSink};
use agentsync::upload::{upload_snapshot, UploadContext, UploadRequest};
use agentsync::{SyncClient, SyncError};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => {}
        Err(err) => {
            let code = err
                .downcast_ref::<SyncError>()
                .map_or(1, SyncError::exit_code);
            eprintln!("Error: {err:#}");
            std::process::exit(code);
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "agentsync=warn",
        1 => "agentsync=debug",
        _ => "agentsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load()?;

    // Choose logger once; NoopLogger keeps the hot paths free
    let logger: Arc<dyn Logger> = match &cli.log_file {
        Some(p) => Arc::new(TextLogger::new(p).with_context(|| format!("opening {}", p.display()))?),
        None => Arc::new(NoopLogger),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Command::Preflight { repo, scan } => preflight(&settings, &repo, &scan),
        Command::Upload {
            repo,
            project,
            scan,
            base_snapshot,
            idempotency_key,
            concurrency,
        } => rt.block_on(upload(
            &settings,
            logger,
            cli.quiet,
            &repo,
            project,
            &scan,
            base_snapshot,
            idempotency_key,
            concurrency,
        )),
        Command::Pull {
            repo,
            snapshot,
            patch,
            dry_run,
            force,
        } => rt.block_on(pull(
            &settings,
            logger.as_ref(),
            &repo,
            snapshot,
            patch,
            ApplyOptions { dry_run, force },
        )),
    }
}

fn preflight(settings: &Settings, repo: &Path, scan: &ScanArgs) -> Result<()> {
    let options = ManifestOptions {
        include_ignored: scan.include_ignored,
        limits: scan.limits(settings.config.limits),
    };
    let (summary, violation) = preflight_repo(repo, &options, &GitCli::default())?;
    println!("Files:       {}", summary.file_count);
    println!("Total bytes: {}", summary.total_bytes);
    println!("Largest:     {} bytes", summary.max_file_bytes);
    match violation {
        Some(e) => Err(SyncError::from(e).into()),
        None => {
            println!("Preflight OK");
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload(
    settings: &Settings,
    logger: Arc<dyn Logger>,
    quiet: bool,
    repo: &Path,
    project: ProjectArgs,
    scan: &ScanArgs,
    base_snapshot: Option<String>,
    idempotency_key: Option<String>,
    concurrency: usize,
) -> Result<()> {
    let client = Arc::new(SyncClient::new(settings.client_config()?)?);
    let store = CheckpointStore::new(settings.state_dir());

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted; stopping uploads (progress is checkpointed)...");
        on_interrupt.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    let spinner = (!quiet).then(|| Arc::new(CargoProgress::new()));
    let ctx = UploadContext {
        progress: spinner.clone().map(|s| s as Arc<dyn ProgressSink>),
        logger,
        cancel,
    };
    let request = UploadRequest {
        project: project.into(),
        repo_root: repo.to_path_buf(),
        manifest: ManifestOptions {
            include_ignored: scan.include_ignored,
            limits: scan.limits(settings.config.limits),
        },
        idempotency_key,
        base_snapshot_id: base_snapshot,
        concurrency: if concurrency == 0 {
            settings.config.concurrency
        } else {
            concurrency
        },
        max_blob_bytes: Some(settings.config.max_blob_bytes).filter(|b| *b > 0),
    };

    match upload_snapshot(&client, &GitCli::default(), &store, request, &ctx).await {
        Ok(outcome) => {
            let summary = format!(
                "snapshot {} ({} files, {} blobs / {} bytes uploaded{})",
                outcome.snapshot_id,
                outcome.preflight.file_count,
                outcome.uploaded_blobs,
                outcome.uploaded_bytes,
                if outcome.resumed { ", resumed" } else { "" }
            );
            match &spinner {
                Some(s) => s.finish_success(&summary),
                None => println!("{summary}"),
            }
            Ok(())
        }
        Err(e) => {
            if let Some(s) = &spinner {
                s.finish_error(&e.to_string());
            }
            Err(e.into())
        }
    }
}

async fn pull(
    settings: &Settings,
    logger: &dyn Logger,
    repo: &Path,
    snapshot: Option<String>,
    patch: Option<String>,
    options: ApplyOptions,
) -> Result<()> {
    let client = SyncClient::new(settings.client_config()?)?;
    let patches = match (&snapshot, &patch) {
        (_, Some(id)) => vec![fetch_patch(&client, id).await?],
        (Some(id), None) => fetch_patches(&client, id).await?,
        (None, None) => anyhow::bail!("either --snapshot or --patch is required"),
    };
    if patches.is_empty() {
        println!("No patches to apply");
        return Ok(());
    }

    let root = std::fs::canonicalize(repo)
        .with_context(|| format!("Failed to canonicalize {}", repo.display()))?;
    logger.start("pull", &root);
    let report = apply_patches(&root, &patches, options, &GitCli::default(), logger)?;

    for r in &report.results {
        match &r.message {
            Some(msg) => println!("{:>9}  {}  {}  ({})", r.status, r.patch_id, r.path, msg),
            None => println!("{:>9}  {}  {}", r.status, r.patch_id, r.path),
        }
    }
    if report.halted() {
        anyhow::bail!(
            "stopped after a patch did not apply; {} applied before it",
            report.count(PatchApplyStatus::Applied)
        );
    }
    Ok(())
}
