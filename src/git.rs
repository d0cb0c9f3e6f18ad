//! Git capabilities consumed by the sync engine
//!
//! The engine only needs three things from git: whether the working tree is
//! clean, applying a unified diff, and bulk ignore checks. `GitCli` shells
//! out to the `git` binary; tests substitute their own `GitOps`.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("{0} is not a git repository")]
    NotARepository(PathBuf),

    #[error("git is not available: {0}")]
    Unavailable(String),

    /// Patch does not apply cleanly against the current files
    #[error("patch does not apply: {0}")]
    Conflict(String),

    #[error("git {command} failed: {stderr}")]
    Failed { command: String, stderr: String },

    #[error("git I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// No usable VCS at this root; callers treat it as "nothing ignored"
    pub fn is_missing_vcs(&self) -> bool {
        matches!(self, GitError::NotARepository(_) | GitError::Unavailable(_))
    }
}

pub trait GitOps: Send + Sync {
    /// True when there are no uncommitted or untracked changes
    fn is_clean(&self, repo_root: &Path) -> Result<bool, GitError>;

    /// Apply (or with `dry_run`, only check) a unified diff
    fn apply_patch(&self, repo_root: &Path, patch: &[u8], dry_run: bool) -> Result<(), GitError>;

    /// Subset of `paths` (repo-relative, '/'-separated) that git ignores
    fn ignored_paths(&self, repo_root: &Path, paths: &[String]) -> Result<HashSet<String>, GitError>;
}

/// `GitOps` backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Untranslated messages: conflict detection matches git's stderr text
    fn command(&self, repo_root: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("LC_ALL", "C")
            .env("LANGUAGE", "C")
            .arg("-C")
            .arg(repo_root)
            .args(args);
        cmd
    }

    fn run(&self, repo_root: &Path, args: &[&str], stdin: Option<Vec<u8>>) -> Result<Output, GitError> {
        let mut cmd = self.command(repo_root, args);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GitError::Unavailable(e.to_string()),
            _ => GitError::Io(e),
        })?;

        // Feed stdin from a separate thread so large outputs cannot deadlock
        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => Some(std::thread::spawn(move || {
                let _ = pipe.write_all(&data);
            })),
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            let _ = handle.join();
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && stderr.contains("not a git repository") {
            return Err(GitError::NotARepository(repo_root.to_path_buf()));
        }
        Ok(output)
    }
}

fn failed(command: &str, output: &Output) -> GitError {
    GitError::Failed {
        command: command.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Messages `git apply` prints when the diff does not match the files
const CONFLICT_MARKERS: &[&str] = &[
    "patch does not apply",
    "does not exist in index",
    "already exists in working directory",
    "No such file or directory",
    "does not match index",
];

impl GitOps for GitCli {
    fn is_clean(&self, repo_root: &Path) -> Result<bool, GitError> {
        let output = self.run(repo_root, &["status", "--porcelain"], None)?;
        if !output.status.success() {
            return Err(failed("status", &output));
        }
        Ok(output.stdout.iter().all(|b| b.is_ascii_whitespace()))
    }

    fn apply_patch(&self, repo_root: &Path, patch: &[u8], dry_run: bool) -> Result<(), GitError> {
        let mut args = vec!["apply", "--whitespace=nowarn"];
        if dry_run {
            args.push("--check");
        }
        args.push("-");
        let output = self.run(repo_root, &args, Some(patch.to_vec()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if CONFLICT_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(GitError::Conflict(stderr));
        }
        Err(GitError::Failed {
            command: "apply".to_string(),
            stderr,
        })
    }

    fn ignored_paths(&self, repo_root: &Path, paths: &[String]) -> Result<HashSet<String>, GitError> {
        if paths.is_empty() {
            return Ok(HashSet::new());
        }
        let mut input = Vec::new();
        for p in paths {
            input.extend_from_slice(p.as_bytes());
            input.push(0);
        }
        let output = self.run(repo_root, &["check-ignore", "--stdin", "-z"], Some(input))?;
        // Exit 1 means nothing matched
        match output.status.code() {
            Some(0) | Some(1) => {}
            _ => return Err(failed("check-ignore", &output)),
        }
        Ok(output
            .stdout
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }
}

/// Locate the git metadata directory, following `gitdir:` files (worktrees)
pub fn git_dir(repo_root: &Path) -> PathBuf {
    let dot_git = repo_root.join(".git");
    if dot_git.is_file() {
        if let Ok(contents) = std::fs::read_to_string(&dot_git) {
            if let Some(target) = contents.trim().strip_prefix("gitdir:") {
                let target = Path::new(target.trim());
                return if target.is_absolute() {
                    target.to_path_buf()
                } else {
                    repo_root.join(target)
                };
            }
        }
    }
    dot_git
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_git_dir_plain_and_worktree() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(git_dir(tmp.path()), tmp.path().join(".git"));

        std::fs::write(tmp.path().join(".git"), "gitdir: ../main/.git/worktrees/wt\n").unwrap();
        assert_eq!(
            git_dir(tmp.path()),
            tmp.path().join("../main/.git/worktrees/wt")
        );
    }

    #[test]
    fn test_commands_run_in_c_locale() {
        let cmd = GitCli::default().command(Path::new("/repo"), &["apply", "-"]);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs.contains(&(std::ffi::OsStr::new("LC_ALL"), Some(std::ffi::OsStr::new("C")))));
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["-C", "/repo", "apply", "-"]);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let git = GitCli::new("/nonexistent/definitely-not-git");
        let err = git.is_clean(tmp.path()).unwrap_err();
        assert!(err.is_missing_vcs(), "{err}");
    }
}
