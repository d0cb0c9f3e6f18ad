//! Command-line definitions and small reusable Clap fragments

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::preflight::PreflightLimits;
use crate::protocol::ProjectIdentity;

#[derive(Debug, Parser)]
#[command(
    name = "agentsync",
    author,
    version,
    about = "Upload AI-assistant config snapshots and apply server-proposed patches"
)]
pub struct Cli {
    /// More diagnostics (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Append sync events to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Hide the progress spinner
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Count what would be uploaded and check it against the limits
    Preflight {
        #[arg(default_value = ".")]
        repo: PathBuf,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Upload a snapshot of the repository
    Upload {
        #[arg(default_value = ".")]
        repo: PathBuf,

        #[command(flatten)]
        project: ProjectArgs,

        #[command(flatten)]
        scan: ScanArgs,

        /// Snapshot to diff against on the server
        #[arg(long = "base-snapshot")]
        base_snapshot: Option<String>,

        /// Key that makes a repeated handshake return the same snapshot
        #[arg(long = "idempotency-key")]
        idempotency_key: Option<String>,

        /// Parallel blob uploads (0 = configured default)
        #[arg(short = 'j', long, default_value_t = 0)]
        concurrency: usize,
    },

    /// Fetch patches and apply them to the working tree
    Pull {
        #[arg(default_value = ".")]
        repo: PathBuf,

        /// Every proposed patch for this snapshot
        #[arg(long, conflicts_with = "patch", required_unless_present = "patch")]
        snapshot: Option<String>,

        /// A single patch by id
        #[arg(long)]
        patch: Option<String>,

        /// Check that patches apply without touching any file
        #[arg(long)]
        dry_run: bool,

        /// Apply even when the working tree has uncommitted changes
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct ProjectArgs {
    #[arg(long = "project-id")]
    pub project_id: Option<String>,

    #[arg(long = "project-slug")]
    pub project_slug: Option<String>,

    #[arg(long = "project-name")]
    pub project_name: Option<String>,
}

impl From<ProjectArgs> for ProjectIdentity {
    fn from(a: ProjectArgs) -> Self {
        ProjectIdentity {
            id: a.project_id,
            slug: a.project_slug,
            name: a.project_name,
        }
    }
}

/// File-set selection and limit overrides shared by `preflight` and `upload`
#[derive(Debug, Clone, Default, Args)]
pub struct ScanArgs {
    /// Include files git ignores
    #[arg(long)]
    pub include_ignored: bool,

    /// Maximum number of files (0 = unlimited)
    #[arg(long)]
    pub max_files: Option<u64>,

    /// Maximum total bytes (0 = unlimited)
    #[arg(long)]
    pub max_total_bytes: Option<u64>,

    /// Maximum size of any single file (0 = unlimited)
    #[arg(long)]
    pub max_file_bytes: Option<u64>,
}

impl ScanArgs {
    /// Flags override the configured limits field by field
    pub fn limits(&self, configured: PreflightLimits) -> PreflightLimits {
        PreflightLimits {
            max_files: self.max_files.or(configured.max_files),
            max_total_bytes: self.max_total_bytes.or(configured.max_total_bytes),
            max_file_bytes: self.max_file_bytes.or(configured.max_file_bytes),
        }
    }
}
