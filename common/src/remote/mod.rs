//! The remote machine as seen by the pipeline.
//!
//! `RemoteSession` is the seam every stage talks to. The provided methods
//! build POSIX shell commands on top of `execute`, so an implementation only
//! needs a way to run a command and to move files; `SshSession` does that with
//! the system `ssh`/`scp` binaries.

#[cfg(test)]
pub mod loopback;
pub mod ssh;

pub use ssh::{SshSession, SshTarget};

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

/// Output of a command run on the remote machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the command was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Errors raised while talking to the remote machine.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("could not open a connection to {host} (ssh exited with {status:?})")]
    Connect { host: String, status: Option<i32> },
    #[error("remote command `{command}` failed with status {status:?}: {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("transfer of {path} failed: {stderr}")]
    Transfer { path: String, stderr: String },
    #[error("unexpected remote output {0:?}")]
    Parse(String),
    #[error("local io error on {0}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

/// A connection to the remote machine, held for one submission.
///
/// Implementations release the underlying connection when dropped.
pub trait RemoteSession {
    /// Home directory on the remote machine; submissions are extracted under it.
    fn home(&self) -> &str;

    /// Run a shell command on the remote machine.
    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Download `remote_path` to `local_path`. Timestamps are not preserved.
    fn get(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError>;

    /// Upload `local_path` to `remote_path`.
    fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError>;

    /// Run a command and return its stdout, failing on a non-zero status.
    fn execute_checked(&self, command: &str) -> Result<String, RemoteError> {
        let output = self.execute(command)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(RemoteError::Command {
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Names of the regular files directly inside `dir`.
    fn list_files(&self, dir: &str) -> Result<BTreeSet<String>, RemoteError> {
        let stdout = self.execute_checked(&format!(
            "find {} -mindepth 1 -maxdepth 1 -type f -printf '%f\\n'",
            shell_quote(dir)
        ))?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Modification time of a remote file.
    fn modified(&self, path: &str) -> Result<DateTime<Utc>, RemoteError> {
        let stdout = self.execute_checked(&format!("date -r {} +%s.%N", shell_quote(path)))?;
        parse_epoch(&stdout)
    }

    /// Current time according to the remote machine's own clock.
    fn now(&self) -> Result<DateTime<Utc>, RemoteError> {
        let stdout = self.execute_checked("date +%s.%N")?;
        parse_epoch(&stdout)
    }

    /// Create a directory and its parents.
    fn ensure_dir(&self, dir: &str) -> Result<(), RemoteError> {
        self.execute_checked(&format!("mkdir -p -- {}", shell_quote(dir)))
            .map(|_| ())
    }

    /// Extract a zip archive that already sits on the remote machine.
    fn extract(&self, archive: &str, dest_dir: &str) -> Result<(), RemoteError> {
        self.execute_checked(&format!(
            "mkdir -p -- {dest} && unzip -oq {archive} -d {dest}",
            dest = shell_quote(dest_dir),
            archive = shell_quote(archive)
        ))
        .map(|_| ())
    }

    /// Recursively delete a directory. Missing directories are not an error.
    fn remove_dir(&self, dir: &str) -> Result<(), RemoteError> {
        self.execute_checked(&format!("rm -rf -- {}", shell_quote(dir)))
            .map(|_| ())
    }
}

/// Quote a string for a POSIX shell.
#[must_use]
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Parse `date +%s.%N` style output (seconds, optional fraction) into a timestamp.
pub fn parse_epoch(text: &str) -> Result<DateTime<Utc>, RemoteError> {
    let trimmed = text.trim();
    let parse_error = || RemoteError::Parse(trimmed.to_string());

    let (secs, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    let secs: i64 = secs.parse().map_err(|_| parse_error())?;
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(parse_error());
    }
    let nanos: u32 = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<9}").parse().map_err(|_| parse_error())?
    };

    DateTime::from_timestamp(secs, nanos).ok_or_else(parse_error)
}
