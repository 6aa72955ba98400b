//! `RemoteSession` over the system OpenSSH client.
//!
//! A master connection is opened with `ControlMaster` when the session is
//! created; every later `ssh`/`scp` call is multiplexed over its control
//! socket, and the master is told to exit when the session is dropped.

use super::{CommandOutput, RemoteError, RemoteSession};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// SSH coordinates of the remote machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Private key passed with `-i`, if not using the agent or default key.
    pub identity: Option<PathBuf>,
}

impl SshTarget {
    /// `user@host`, or just `host` when no user is configured.
    #[must_use]
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// `ssh` takes the port as `-p`, `scp` as `-P`.
fn port_args(target: &SshTarget, flag: &str) -> Vec<String> {
    target
        .port
        .map(|port| vec![flag.to_string(), port.to_string()])
        .unwrap_or_default()
}

/// One multiplexed SSH connection, open for the lifetime of the value.
pub struct SshSession {
    target: SshTarget,
    control_path: PathBuf,
    home: String,
}

impl SshSession {
    /// Open the master connection and read the remote home directory.
    pub fn open(target: SshTarget) -> Result<Self, RemoteError> {
        let control_path = std::env::temp_dir().join(format!(
            "rendereval-{}-{}.sock",
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        debug!("Opening SSH master connection to {}", target.destination());

        // `-f` forks the master into the background, so its pipes must not be ours.
        let status = Command::new("ssh")
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(Self::base_args(&target, &control_path))
            .args(port_args(&target, "-p"))
            .args(["-f", "-N"])
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| RemoteError::Spawn {
                program: "ssh",
                source,
            })?;
        if !status.success() {
            return Err(RemoteError::Connect {
                host: target.host.clone(),
                status: status.code(),
            });
        }

        let mut session = SshSession {
            target,
            control_path,
            home: String::new(),
        };
        session.home = session
            .execute_checked("printf '%s' \"$HOME\"")?
            .trim()
            .to_string();
        if session.home.is_empty() {
            return Err(RemoteError::Parse("empty $HOME".to_string()));
        }
        debug!("Remote home directory is {}", session.home);

        Ok(session)
    }

    /// Arguments shared by every `ssh` and `scp` invocation of this session.
    fn base_args(target: &SshTarget, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(ref identity) = target.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn scp(&self, from: &str, to: &str, path_for_errors: &str) -> Result<(), RemoteError> {
        let output = Command::new("scp")
            .arg("-q")
            .args(Self::base_args(&self.target, &self.control_path))
            .args(port_args(&self.target, "-P"))
            .arg(from)
            .arg(to)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RemoteError::Spawn {
                program: "scp",
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer {
                path: path_for_errors.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{path}", self.target.destination())
    }
}

impl RemoteSession for SshSession {
    fn home(&self) -> &str {
        &self.home
    }

    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        debug!("remote$ {command}");
        let output = Command::new("ssh")
            .args(Self::base_args(&self.target, &self.control_path))
            .args(port_args(&self.target, "-p"))
            .arg(self.target.destination())
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RemoteError::Spawn {
                program: "ssh",
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn get(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        self.scp(
            &self.remote_spec(remote_path),
            &local_path.display().to_string(),
            remote_path,
        )
    }

    fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        self.scp(
            &local_path.display().to_string(),
            &self.remote_spec(remote_path),
            remote_path,
        )
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        debug!("Closing SSH master connection to {}", self.target.destination());
        let result = Command::new("ssh")
            .args(Self::base_args(&self.target, &self.control_path))
            .args(port_args(&self.target, "-p"))
            .args(["-O", "exit"])
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .output();
        match result {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                "SSH master for {} did not exit cleanly: {}",
                self.target.host,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to close SSH master for {}: {e}", self.target.host),
        }
    }
}
