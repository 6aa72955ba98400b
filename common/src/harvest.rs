//! Work out what a render produced on each machine and bring it into the results.
//!
//! A snapshot of the working directory is taken on each machine right before
//! the render command starts and again once it is over. Files present only in
//! the second snapshot are the render's outputs. Frames among them are kept
//! only if they were written inside the execution window; everything else is
//! copied verbatim into the machine's `other_*_outputs` directory.

use crate::remote::{RemoteError, RemoteSession};
use crate::report::Diagnostic;
use crate::{Machine, remote_join};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

static FRAME_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{3}\.(png|jpg|jpeg)$").expect("frame name pattern is valid")
});

/// File timestamps come from a coarse kernel clock and can trail the wall clock
/// a little, so a frame written right after the snapshot may look older than it.
const MTIME_SLACK_MS: i64 = 1000;

/// Directory listing of one machine's working directory at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub machine: Machine,
    pub files: BTreeSet<String>,
    /// Taken from the clock of the machine that was listed.
    pub captured_at: DateTime<Utc>,
}

/// Names present in `post` but not in `pre`, in name order.
#[must_use]
pub fn diff(pre: &Snapshot, post: &Snapshot) -> Vec<String> {
    post.files.difference(&pre.files).cloned().collect()
}

pub fn snapshot_local(dir: &Path) -> io::Result<Snapshot> {
    let captured_at = Utc::now();
    let mut files = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    debug!("Local snapshot of {}: {} file(s)", dir.display(), files.len());
    Ok(Snapshot {
        machine: Machine::Local,
        files,
        captured_at,
    })
}

pub fn snapshot_remote<S: RemoteSession>(session: &S, dir: &str) -> Result<Snapshot, RemoteError> {
    let captured_at = session.now()?;
    let files = session.list_files(dir)?;
    debug!("Remote snapshot of {dir}: {} file(s)", files.len());
    Ok(Snapshot {
        machine: Machine::Remote,
        files,
        captured_at,
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Frame,
    Other,
}

/// A frame is exactly three digits and a png/jpg/jpeg extension, nothing else.
#[must_use]
pub fn classify(file_name: &str) -> ArtifactKind {
    if FRAME_NAME.is_match(file_name) {
        ArtifactKind::Frame
    } else {
        ArtifactKind::Other
    }
}

/// Interval during which a machine's frames count as produced by this run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExecutionWindow {
    pub start: DateTime<Utc>,
    pub timeout: Duration,
}

impl ExecutionWindow {
    #[must_use]
    pub fn new(start: DateTime<Utc>, timeout: Duration) -> Self {
        ExecutionWindow { start, timeout }
    }

    /// `start <= modified < start + timeout`, with a little slack before `start`.
    #[must_use]
    pub fn contains(&self, modified: DateTime<Utc>) -> bool {
        let elapsed = modified.signed_duration_since(self.start);
        if elapsed < TimeDelta::milliseconds(-MTIME_SLACK_MS) {
            return false;
        }
        // Negative only within the slack, which counts as the start.
        elapsed
            .to_std()
            .ok()
            .is_none_or(|elapsed| elapsed < self.timeout)
    }
}

#[must_use]
pub fn in_window(modified: DateTime<Utc>, start: DateTime<Utc>, timeout: Duration) -> bool {
    ExecutionWindow::new(start, timeout).contains(modified)
}

/// A frame copied out of a working directory, waiting to be renumbered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFrame {
    pub path: PathBuf,
    pub origin: Machine,
    pub original_name: String,
    pub modified: DateTime<Utc>,
}

/// What was collected from one machine.
#[derive(Debug, Default)]
pub struct Harvest {
    pub frames: Vec<StagedFrame>,
    /// Non-frame outputs, already in the result directory.
    pub others: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Where harvested files go.
#[derive(Debug, Clone)]
pub struct HarvestTargets {
    /// The submission's result directory; other outputs land below it.
    pub result_dir: PathBuf,
    /// Frames land in `<frames_dir>/<machine>/`.
    pub frames_dir: PathBuf,
}

impl HarvestTargets {
    #[must_use]
    pub fn frames_for(&self, machine: Machine) -> PathBuf {
        self.frames_dir.join(machine.to_string())
    }

    #[must_use]
    pub fn others_for(&self, machine: Machine) -> PathBuf {
        self.result_dir.join(machine.other_outputs_dir())
    }
}

enum Source<'a> {
    Local(&'a Path),
    Remote(&'a dyn RemoteSession, &'a str),
}

impl Source<'_> {
    fn machine(&self) -> Machine {
        match self {
            Source::Local(_) => Machine::Local,
            Source::Remote(..) => Machine::Remote,
        }
    }

    fn modified(&self, name: &str) -> Result<DateTime<Utc>, String> {
        match self {
            Source::Local(dir) => fs::metadata(dir.join(name))
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .map_err(|e| e.to_string()),
            Source::Remote(session, dir) => session
                .modified(&remote_join(dir, name))
                .map_err(|e| e.to_string()),
        }
    }

    fn copy_to(&self, name: &str, dest: &Path) -> Result<(), String> {
        match self {
            Source::Local(dir) => fs::copy(dir.join(name), dest)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Source::Remote(session, dir) => session
                .get(&remote_join(dir, name), dest)
                .map_err(|e| e.to_string()),
        }
    }
}

/// Collect the local outputs of a run.
pub fn harvest_local(
    dir: &Path,
    before: &Snapshot,
    after: &Snapshot,
    timeout: Duration,
    targets: &HarvestTargets,
) -> Harvest {
    collect(&Source::Local(dir), before, after, timeout, targets)
}

/// Collect the remote outputs of a run.
pub fn harvest_remote<S: RemoteSession>(
    session: &S,
    dir: &str,
    before: &Snapshot,
    after: &Snapshot,
    timeout: Duration,
    targets: &HarvestTargets,
) -> Harvest {
    collect(&Source::Remote(session, dir), before, after, timeout, targets)
}

fn collect(
    source: &Source<'_>,
    before: &Snapshot,
    after: &Snapshot,
    timeout: Duration,
    targets: &HarvestTargets,
) -> Harvest {
    let machine = source.machine();
    let window = ExecutionWindow::new(before.captured_at, timeout);
    let mut harvest = Harvest::default();
    let failed = |file: &str, reason: String| Diagnostic::HarvestFailed {
        machine,
        file: file.to_string(),
        reason,
    };

    for name in diff(before, after) {
        match classify(&name) {
            ArtifactKind::Other => {
                let dest_dir = targets.others_for(machine);
                let dest = dest_dir.join(&name);
                let copied = fs::create_dir_all(&dest_dir)
                    .map_err(|e| e.to_string())
                    .and_then(|()| source.copy_to(&name, &dest));
                match copied {
                    Ok(()) => harvest.others.push(dest),
                    Err(reason) => harvest.diagnostics.push(failed(&name, reason)),
                }
            }
            ArtifactKind::Frame => {
                let modified = match source.modified(&name) {
                    Ok(modified) => modified,
                    Err(reason) => {
                        harvest.diagnostics.push(failed(&name, reason));
                        continue;
                    }
                };
                if !window.contains(modified) {
                    harvest.diagnostics.push(Diagnostic::StaleFrame {
                        machine,
                        file: name,
                    });
                    continue;
                }
                let dest_dir = targets.frames_for(machine);
                let dest = dest_dir.join(&name);
                let staged = fs::create_dir_all(&dest_dir)
                    .map_err(|e| e.to_string())
                    .and_then(|()| source.copy_to(&name, &dest))
                    .and_then(|()| set_modified(&dest, modified).map_err(|e| e.to_string()));
                match staged {
                    Ok(()) => harvest.frames.push(StagedFrame {
                        path: dest,
                        origin: machine,
                        original_name: name,
                        modified,
                    }),
                    Err(reason) => harvest.diagnostics.push(failed(&name, reason)),
                }
            }
        }
    }

    info!(
        "Harvested {} frame(s) and {} other output(s) from the {machine} machine",
        harvest.frames.len(),
        harvest.others.len()
    );
    harvest
}

/// Copies do not keep timestamps; put the source's back.
pub(crate) fn set_modified(path: &Path, modified: DateTime<Utc>) -> io::Result<()> {
    File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::from(modified))
}
