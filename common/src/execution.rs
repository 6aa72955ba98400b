//! Run a submission's render command with a wall-clock bound.
//!
//! The render command starts both the local and the remote render process
//! and returns when the local one is done. Its stdout and stderr are pumped
//! into shared buffers as they arrive, so whatever was printed before a
//! timeout is still available afterwards.

use itertools::Itertools;
use log::{debug, info, warn};
use serde::Serialize;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

/// How long to keep reading output once the process is gone.
/// Grandchildren can hold the pipes open long after the render command exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Result of the single render attempt of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed {
        stdout: String,
        stderr: String,
        /// `None` if the process was terminated by a signal.
        exit_code: Option<i32>,
    },
    TimedOut {
        partial_stdout: String,
        partial_stderr: String,
    },
    Crashed {
        message: String,
    },
}

/// Serializable shape of an `ExecutionOutcome`, without the captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionSummary {
    NotRun,
    Completed { exit_code: Option<i32> },
    TimedOut { timeout_secs: u64 },
    Crashed { message: String },
}

impl ExecutionOutcome {
    /// True only for a completed run with exit code 0.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Completed {
                exit_code: Some(0),
                ..
            }
        )
    }

    /// Captured (possibly partial) stdout and stderr.
    #[must_use]
    pub fn output(&self) -> (&str, &str) {
        match self {
            ExecutionOutcome::Completed { stdout, stderr, .. } => (stdout, stderr),
            ExecutionOutcome::TimedOut {
                partial_stdout,
                partial_stderr,
            } => (partial_stdout, partial_stderr),
            ExecutionOutcome::Crashed { .. } => ("", ""),
        }
    }

    /// Why the run counts as failed, or `None` if it succeeded.
    #[must_use]
    pub fn failure_reason(&self, timeout: Duration) -> Option<String> {
        match self {
            ExecutionOutcome::Completed {
                exit_code: Some(0),
                ..
            } => None,
            ExecutionOutcome::Completed {
                exit_code: Some(code),
                ..
            } => Some(format!("render command exited with status {code}")),
            ExecutionOutcome::Completed {
                exit_code: None, ..
            } => Some("render command was terminated by a signal".to_string()),
            ExecutionOutcome::TimedOut { .. } => Some(format!(
                "render command timed out after {}s",
                timeout.as_secs()
            )),
            ExecutionOutcome::Crashed { message } => Some(message.clone()),
        }
    }

    #[must_use]
    pub fn summary(&self, timeout: Duration) -> ExecutionSummary {
        match self {
            ExecutionOutcome::Completed { exit_code, .. } => ExecutionSummary::Completed {
                exit_code: *exit_code,
            },
            ExecutionOutcome::TimedOut { .. } => ExecutionSummary::TimedOut {
                timeout_secs: timeout.as_secs(),
            },
            ExecutionOutcome::Crashed { message } => ExecutionSummary::Crashed {
                message: message.clone(),
            },
        }
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Runs render commands on a private single-threaded runtime.
pub struct ExecutionCoordinator {
    runtime: Runtime,
    timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(timeout: Duration) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(ExecutionCoordinator { runtime, timeout })
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `program args...` inside `working_dir` and wait for it, at most `timeout`.
    /// Never fails: spawn and wait errors come back as `ExecutionOutcome::Crashed`.
    pub fn run(&self, program: &str, args: &[String], working_dir: &Path) -> ExecutionOutcome {
        info!(
            "Running `{program} {}` in {}",
            args.iter().join(" "),
            working_dir.display()
        );
        let outcome = self
            .runtime
            .block_on(run_with_timeout(program, args, working_dir, self.timeout));
        match &outcome {
            ExecutionOutcome::Completed { exit_code, .. } => {
                info!("Render command finished with exit code {exit_code:?}");
            }
            ExecutionOutcome::TimedOut { .. } => {
                warn!("Render command timed out after {}s", self.timeout.as_secs());
            }
            ExecutionOutcome::Crashed { message } => warn!("Render command crashed: {message}"),
        }
        outcome
    }
}

async fn run_with_timeout(
    program: &str,
    args: &[String],
    working_dir: &Path,
    timeout: Duration,
) -> ExecutionOutcome {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so a timeout takes the helpers it started down with it.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionOutcome::Crashed {
                message: format!("failed to start {program}: {e}"),
            };
        }
    };

    let stdout_buf = SharedBuffer::default();
    let stderr_buf = SharedBuffer::default();
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(spawn_pump(stdout, Arc::clone(&stdout_buf)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(spawn_pump(stderr, Arc::clone(&stderr_buf)));
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            drain(pumps, DRAIN_GRACE).await;
            ExecutionOutcome::Completed {
                stdout: take_string(&stdout_buf),
                stderr: take_string(&stderr_buf),
                exit_code: status.code(),
            }
        }
        Ok(Err(e)) => {
            kill_tree(&mut child).await;
            drain(pumps, DRAIN_GRACE).await;
            ExecutionOutcome::Crashed {
                message: format!("failed to wait for {program}: {e}"),
            }
        }
        Err(_) => {
            kill_tree(&mut child).await;
            drain(pumps, DRAIN_GRACE).await;
            ExecutionOutcome::TimedOut {
                partial_stdout: take_string(&stdout_buf),
                partial_stderr: take_string(&stderr_buf),
            }
        }
    }
}

fn spawn_pump<R>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Wait for the pumps to hit EOF, but not longer than `grace`.
/// Pumps still running after that are aborted so they do not outlive the run.
async fn drain(mut pumps: Vec<JoinHandle<()>>, grace: Duration) {
    let all = async {
        for pump in &mut pumps {
            let _ = pump.await;
        }
    };
    let drained = tokio::time::timeout(grace, all).await;
    if drained.is_err() {
        debug!("Output pipes still open after exit, keeping what was read so far");
        for pump in &pumps {
            pump.abort();
        }
    }
}

fn take_string(buffer: &SharedBuffer) -> String {
    let bytes = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id()
        && let Ok(pgid) = libc::pid_t::try_from(pid)
    {
        // SAFETY: plain syscall on the process group created at spawn time.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Render command already gone: {e}");
    }
}
