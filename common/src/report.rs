//! Per-submission diagnostics and the end-of-batch report.

use crate::execution::ExecutionSummary;
use crate::{Machine, RUNNER_VERSION};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";
pub const DIAGNOSTICS_FILE: &str = "diagnostics.txt";
pub const BATCH_REPORT_FILE: &str = "batch_report.json";

/// Something worth telling a human about a submission. None of these stop the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    MissingFrameRate { default_fps: u32 },
    InvalidFrameRate { content: String, default_fps: u32 },
    ExecutionFailed { reason: String },
    SnapshotFailed { machine: Machine, reason: String },
    HarvestFailed { machine: Machine, file: String, reason: String },
    StaleFrame { machine: Machine, file: String },
    DeckCopyFailed { file: String, reason: String },
    NormalizeFailed { reason: String },
    NoImages,
    MixedExtensions {
        extensions: Vec<String>,
        encoded: usize,
        total: usize,
    },
    EncodingFailed { reason: String },
    CleanupFailed { reason: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Diagnostic::MissingFrameRate { default_fps } => {
                write!(f, "Warning: fps.txt not found, using default {default_fps} fps")
            }
            Diagnostic::InvalidFrameRate {
                content,
                default_fps,
            } => write!(
                f,
                "Warning: fps.txt contains {content:?}, using default {default_fps} fps"
            ),
            Diagnostic::ExecutionFailed { reason } => write!(f, "Execution failed: {reason}"),
            Diagnostic::SnapshotFailed { machine, reason } => {
                write!(f, "Could not list the {machine} working directory: {reason}")
            }
            Diagnostic::HarvestFailed {
                machine,
                file,
                reason,
            } => write!(f, "Could not harvest {machine} file {file}: {reason}"),
            Diagnostic::StaleFrame { machine, file } => write!(
                f,
                "Discarded {machine} frame {file}: modified outside the execution window"
            ),
            Diagnostic::DeckCopyFailed { file, reason } => {
                write!(f, "Could not copy slide deck {file}: {reason}")
            }
            Diagnostic::NormalizeFailed { reason } => {
                write!(f, "Could not renumber frames: {reason}")
            }
            Diagnostic::NoImages => write!(f, "No images"),
            Diagnostic::MixedExtensions {
                extensions,
                encoded,
                total,
            } => write!(
                f,
                "Frames use mixed extensions ({}): the video stops at the first frame \
                 whose extension differs from the first one, {encoded} of {total} frame(s) encoded",
                extensions.join(", ")
            ),
            Diagnostic::EncodingFailed { reason } => write!(f, "Encoding failed: {reason}"),
            Diagnostic::CleanupFailed { reason } => write!(f, "Cleanup failed: {reason}"),
        }
    }
}

/// Everything recorded while processing one submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReport {
    /// Archive stem, also the name of the result directory.
    pub name: String,
    /// Top-level directory inside the archive.
    pub root_dir: String,
    pub execution: ExecutionSummary,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Number of frames that made it into the normalized sequence.
    pub frames: usize,
    pub fps: Option<u32>,
    pub video: Option<PathBuf>,
    /// Files copied into the result directory (decks and other outputs).
    pub artifacts: Vec<PathBuf>,
}

impl SubmissionReport {
    #[must_use]
    pub fn new(name: &str, root_dir: &str) -> Self {
        SubmissionReport {
            name: name.to_string(),
            root_dir: root_dir.to_string(),
            execution: ExecutionSummary::NotRun,
            stdout: String::new(),
            stderr: String::new(),
            diagnostics: Vec::new(),
            frames: 0,
            fps: None,
            video: None,
            artifacts: Vec::new(),
        }
    }

    /// Record a diagnostic and log it.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        warn!("[{}] {diagnostic}", self.name);
        self.diagnostics.push(diagnostic);
    }

    /// The diagnostics file body: one diagnostic per line, empty when clean.
    #[must_use]
    pub fn diagnostics_text(&self) -> String {
        self.diagnostics
            .iter()
            .map(|d| format!("{d}\n"))
            .collect()
    }

    /// Write the captured logs and the diagnostics file into `result_dir`.
    pub fn write_files(&self, result_dir: &Path) -> Result<()> {
        fs::create_dir_all(result_dir)
            .with_context(|| format!("Failed to create {}", result_dir.display()))?;
        for (file, content) in [
            (STDOUT_LOG, &self.stdout),
            (STDERR_LOG, &self.stderr),
            (DIAGNOSTICS_FILE, &self.diagnostics_text()),
        ] {
            let path = result_dir.join(file);
            fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

/// What happened to one archive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Processed { report: Box<SubmissionReport> },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub archive: PathBuf,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

/// The only state carried from one submission to the next.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub runner_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<SubmissionOutcome>,
}

impl Default for BatchReport {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchReport {
    #[must_use]
    pub fn new() -> Self {
        BatchReport {
            runner_version: RUNNER_VERSION.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
        }
    }

    pub fn record_processed(&mut self, archive: &Path, report: SubmissionReport) {
        self.outcomes.push(SubmissionOutcome {
            archive: archive.to_path_buf(),
            status: OutcomeStatus::Processed {
                report: Box::new(report),
            },
        });
    }

    pub fn record_skipped(&mut self, archive: &Path, reason: String) {
        warn!("Skipped {}: {reason}", archive.display());
        self.outcomes.push(SubmissionOutcome {
            archive: archive.to_path_buf(),
            status: OutcomeStatus::Skipped { reason },
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Reports of the submissions that got past staging, in batch order.
    pub fn processed(&self) -> impl Iterator<Item = &SubmissionReport> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            OutcomeStatus::Processed { report } => Some(report.as_ref()),
            OutcomeStatus::Skipped { .. } => None,
        })
    }

    /// Archives that were skipped, with the reason.
    pub fn skipped(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            OutcomeStatus::Skipped { reason } => Some((o.archive.as_path(), reason.as_str())),
            OutcomeStatus::Processed { .. } => None,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize batch report")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn log_summary(&self) {
        let processed: Vec<&SubmissionReport> = self.processed().collect();
        let videos = processed.iter().filter(|r| r.video.is_some()).count();
        info!(
            "Batch finished: {} processed ({} with video), {} skipped.",
            processed.len(),
            videos,
            self.skipped().count()
        );
        for report in &processed {
            if !report.diagnostics.is_empty() {
                info!(
                    "  {}: {} diagnostic(s), {} frame(s)",
                    report.name,
                    report.diagnostics.len(),
                    report.frames
                );
            }
        }
        for (archive, reason) in self.skipped() {
            info!("  {} skipped: {reason}", archive.display());
        }
    }
}
