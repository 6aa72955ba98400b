//! A library with common utilities for evaluating two-machine render submissions.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod cleanup;
pub mod execution;
pub mod harvest;
pub mod normalize;
pub mod pipeline;
pub mod remote;
pub mod report;
pub mod staging;
pub mod video;

use serde::{Deserialize, Serialize};
use std::path::{self, PathBuf};
use std::{fmt, io};
use std::time::Duration;

pub const RUNNER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard wall-clock bound on a render, also the width of the harvest window.
pub const DEFAULT_TIMEOUT_SECS: u64 = 310;

/// Frame rate used when a submission does not declare one.
pub const DEFAULT_FPS: u32 = 60;

/// File inside a submission that declares its frame rate.
pub const FPS_FILE_NAME: &str = "fps.txt";

/// Extensions of slide decks copied into the results.
pub const DECK_EXTENSIONS: [&str; 2] = ["pdf", "pptx"];

/// Directory under the remote home where archives are uploaded.
pub const REMOTE_ARCHIVE_DIR: &str = "submissions";

/// The two machines taking part in a render.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Machine {
    Local,
    Remote,
}

impl Machine {
    /// Name of the directory that keeps this machine's non-frame outputs.
    #[must_use]
    pub fn other_outputs_dir(self) -> &'static str {
        match self {
            Machine::Local => "other_local_outputs",
            Machine::Remote => "other_remote_outputs",
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Machine::Local => write!(f, "local"),
            Machine::Remote => write!(f, "remote"),
        }
    }
}

/// Everything the batch needs to know, already resolved from the CLI.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Directory holding one archive per submission.
    pub source_dir: PathBuf,
    /// Directory receiving one result directory per submission.
    pub result_dir: PathBuf,
    /// Directory submissions are extracted into on this machine.
    pub local_root: PathBuf,
    /// Address of this machine, passed to the render entry point.
    pub primary_address: String,
    /// Address of the remote machine, passed to the render entry point.
    pub secondary_address: String,
    /// Program and leading arguments of the render entry point.
    pub render_command: Vec<String>,
    pub timeout: Duration,
    pub default_fps: u32,
    /// Encoder program invoked by the video assembler.
    pub encoder: PathBuf,
    /// Upload every archive to the remote once before the batch starts.
    pub precopy: bool,
    /// Keep the renumbered frames after the video has been assembled.
    pub keep_frames: bool,
}

impl BatchConfig {
    /// Full argument list of the render command, with both machine addresses appended.
    #[must_use]
    pub fn render_args(&self) -> Vec<String> {
        let mut args = self.render_command.clone();
        args.push(self.primary_address.clone());
        args.push(self.secondary_address.clone());
        args
    }

    /// The same config with the source, result and local directories made
    /// absolute against the current directory.
    pub fn with_absolute_paths(&self) -> io::Result<BatchConfig> {
        Ok(BatchConfig {
            source_dir: path::absolute(&self.source_dir)?,
            result_dir: path::absolute(&self.result_dir)?,
            local_root: path::absolute(&self.local_root)?,
            ..self.clone()
        })
    }
}

/// Join a path onto a remote directory. Remote paths are always POSIX.
#[must_use]
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
