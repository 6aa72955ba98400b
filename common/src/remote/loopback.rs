//! `RemoteSession`s whose "remote machine" is a local directory.
//!
//! Used by the tests so the whole pipeline can run without an SSH server.
//! `LoopbackSession` answers listings, timestamps and extraction from `std::fs`
//! and can inject transfer failures. `ShellSession` implements only the
//! required methods, so every provided command runs through a local `sh`.

use super::{CommandOutput, RemoteError, RemoteSession};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct LoopbackSession {
    home: String,
    failing_gets: BTreeSet<String>,
    closed: Arc<AtomicUsize>,
}

impl LoopbackSession {
    pub fn new(home: &Path) -> Self {
        LoopbackSession {
            home: home.display().to_string(),
            failing_gets: BTreeSet::new(),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every download of a file with this name fail.
    pub fn with_failing_get(mut self, file_name: &str) -> Self {
        self.failing_gets.insert(file_name.to_string());
        self
    }

    /// Share a counter incremented each time a session is dropped.
    pub fn with_close_counter(mut self, closed: Arc<AtomicUsize>) -> Self {
        self.closed = closed;
        self
    }
}

fn io_error(path: &str) -> impl FnOnce(std::io::Error) -> RemoteError + '_ {
    move |e| RemoteError::Io(PathBuf::from(path), e)
}

fn run_sh(home: &str, command: &str) -> Result<CommandOutput, RemoteError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(home)
        .output()
        .map_err(|source| RemoteError::Spawn {
            program: "sh",
            source,
        })?;
    Ok(CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

impl RemoteSession for LoopbackSession {
    fn home(&self) -> &str {
        &self.home
    }

    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        run_sh(&self.home, command)
    }

    fn get(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        let name = Path::new(remote_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing_gets.contains(&name) {
            return Err(RemoteError::Transfer {
                path: remote_path.to_string(),
                stderr: "connection reset".to_string(),
            });
        }
        fs::copy(remote_path, local_path).map_err(io_error(remote_path))?;
        Ok(())
    }

    fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        fs::copy(local_path, remote_path).map_err(io_error(remote_path))?;
        Ok(())
    }

    fn list_files(&self, dir: &str) -> Result<BTreeSet<String>, RemoteError> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            if entry.file_type().map_err(io_error(dir))?.is_file() {
                names.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn modified(&self, path: &str) -> Result<DateTime<Utc>, RemoteError> {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(io_error(path))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn now(&self) -> Result<DateTime<Utc>, RemoteError> {
        Ok(Utc::now())
    }

    fn ensure_dir(&self, dir: &str) -> Result<(), RemoteError> {
        fs::create_dir_all(dir).map_err(io_error(dir))
    }

    fn extract(&self, archive: &str, dest_dir: &str) -> Result<(), RemoteError> {
        let file = fs::File::open(archive).map_err(io_error(archive))?;
        let mut zip =
            zip::ZipArchive::new(file).map_err(|e| RemoteError::Parse(e.to_string()))?;
        zip.extract(dest_dir)
            .map_err(|e| RemoteError::Parse(e.to_string()))
    }

    fn remove_dir(&self, dir: &str) -> Result<(), RemoteError> {
        match fs::remove_dir_all(dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(RemoteError::Io(PathBuf::from(dir), e))
            }
            _ => Ok(()),
        }
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs every command through `sh` in `home`, like a real remote login shell.
pub struct ShellSession {
    home: String,
}

impl ShellSession {
    pub fn new(home: &Path) -> Self {
        ShellSession {
            home: home.display().to_string(),
        }
    }
}

impl RemoteSession for ShellSession {
    fn home(&self) -> &str {
        &self.home
    }

    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        run_sh(&self.home, command)
    }

    fn get(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        fs::copy(remote_path, local_path).map_err(io_error(remote_path))?;
        Ok(())
    }

    fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        fs::copy(local_path, remote_path).map_err(io_error(remote_path))?;
        Ok(())
    }
}
