//! Upload progress reporting
//!
//! The orchestrator emits `ProgressEvent`s through a `ProgressSink`. The CLI
//! renders them cargo-style: a spinner line for the current stage, with a
//! blob counter during the upload stage.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Manifest,
    Handshake,
    Upload,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Manifest => "manifest",
            Stage::Handshake => "handshake",
            Stage::Upload => "upload",
            Stage::Finalize => "finalize",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// Units finished in this stage (blobs for `Upload`)
    pub completed: u64,
    pub total: u64,
    pub bytes: u64,
}

impl ProgressEvent {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage,
            completed: 0,
            total: 0,
            bytes: 0,
        }
    }
}

/// Receives progress events; calls are never concurrent
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Spinner-based progress display for interactive runs
pub struct CargoProgress {
    spinner: ProgressBar,
    start_time: Instant,
}

impl Default for CargoProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl CargoProgress {
    pub fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        Self {
            spinner,
            start_time: Instant::now(),
        }
    }

    pub fn finish_success(&self, summary: &str) {
        self.spinner.finish_with_message(format!(
            "{} {} in {:.1}s",
            "Completed".with(Color::Green).bold(),
            summary,
            self.start_time.elapsed().as_secs_f64()
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.spinner
            .finish_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}

impl ProgressSink for CargoProgress {
    fn report(&self, event: ProgressEvent) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let label = format!("{:>9}", event.stage.to_string());
        let msg = if event.total > 0 {
            format!(
                "{} ({}/{}, {:.1} MB) in {:.1}s",
                label.with(Color::Green).bold(),
                event.completed,
                event.total,
                event.bytes as f64 / 1_048_576.0,
                elapsed
            )
        } else {
            format!("{} in {:.1}s", label.with(Color::Green).bold(), elapsed)
        };
        self.spinner.set_message(msg);
    }
}
