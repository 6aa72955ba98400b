//! Remove a submission's working directories from both machines.

use crate::remote::RemoteSession;
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Owns the extracted working directories of one submission.
///
/// Created before extraction starts. `cleanup` removes both directories and
/// reports failures; if it is never called, dropping the guard makes the same
/// attempt and only logs.
pub struct StagedWorkspace<'a, S: RemoteSession> {
    session: &'a S,
    local_dir: PathBuf,
    remote_dir: String,
    done: bool,
}

impl<'a, S: RemoteSession> StagedWorkspace<'a, S> {
    pub fn new(session: &'a S, local_dir: PathBuf, remote_dir: String) -> Self {
        StagedWorkspace {
            session,
            local_dir,
            remote_dir,
            done: false,
        }
    }

    #[must_use]
    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    #[must_use]
    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    /// Remove both directories. Both removals are attempted even if one fails.
    pub fn cleanup(mut self) -> Result<(), Vec<String>> {
        self.done = true;
        self.remove_both()
    }

    fn remove_both(&self) -> Result<(), Vec<String>> {
        let mut failures = Vec::new();
        match remove_local(&self.local_dir) {
            Ok(()) => debug!("Removed {}", self.local_dir.display()),
            Err(e) => failures.push(format!("{}: {e}", self.local_dir.display())),
        }
        match self.session.remove_dir(&self.remote_dir) {
            Ok(()) => debug!("Removed remote {}", self.remote_dir),
            Err(e) => failures.push(format!("remote {}: {e}", self.remote_dir)),
        }
        if failures.is_empty() {
            info!(
                "Cleaned up {} and remote {}",
                self.local_dir.display(),
                self.remote_dir
            );
            Ok(())
        } else {
            Err(failures)
        }
    }
}

impl<S: RemoteSession> Drop for StagedWorkspace<'_, S> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(failures) = self.remove_both() {
            for failure in failures {
                warn!("Cleanup failed for {failure}");
            }
        }
    }
}

/// `remove_dir_all` that treats a missing directory as already removed.
pub fn remove_local(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::loopback::LoopbackSession;
    use tempfile::tempdir;

    fn populate(root: &Path) -> PathBuf {
        let dir = root.join("alpha");
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/main.cpp"), "int main() {}").unwrap();
        dir
    }

    #[test_log::test]
    fn test_cleanup_removes_both() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        let session = LoopbackSession::new(remote.path());
        let local_dir = populate(local.path());
        let remote_dir = populate(remote.path());

        let workspace =
            StagedWorkspace::new(&session, local_dir.clone(), remote_dir.display().to_string());
        workspace.cleanup().unwrap();

        assert!(!local_dir.exists());
        assert!(!remote_dir.exists());
    }

    #[test_log::test]
    fn test_drop_cleans_up() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        let session = LoopbackSession::new(remote.path());
        let local_dir = populate(local.path());
        let remote_dir = populate(remote.path());

        {
            let _workspace = StagedWorkspace::new(
                &session,
                local_dir.clone(),
                remote_dir.display().to_string(),
            );
        }

        assert!(!local_dir.exists());
        assert!(!remote_dir.exists());
    }

    #[test_log::test]
    fn test_missing_directories_are_fine() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        let session = LoopbackSession::new(remote.path());

        let workspace = StagedWorkspace::new(
            &session,
            local.path().join("never-extracted"),
            remote.path().join("never-extracted").display().to_string(),
        );
        assert!(workspace.cleanup().is_ok());
    }
}
