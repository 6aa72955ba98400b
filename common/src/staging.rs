//! Discover submission archives and unpack them onto both machines.

use crate::remote::{RemoteError, RemoteSession};
use crate::{REMOTE_ARCHIVE_DIR, remote_join};
use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;
use zip::result::ZipError;

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("could not open archive {0}: {1}")]
    Open(PathBuf, #[source] io::Error),
    #[error("could not read archive {0}: {1}")]
    Archive(PathBuf, #[source] ZipError),
    #[error("archive entry {0:?} escapes the extraction directory")]
    UnsafeEntry(String),
    #[error("archive must unpack to exactly one top-level directory containing files, found {0}")]
    BadShape(String),
    #[error("could not extract into {0}: {1}")]
    Extract(PathBuf, #[source] ZipError),
    #[error("remote staging failed: {0}")]
    Remote(#[from] RemoteError),
}

/// One archive from the submission directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionPackage {
    /// Archive stem; names the result directory.
    pub name: String,
    pub archive: PathBuf,
}

impl SubmissionPackage {
    #[must_use]
    pub fn from_path(archive: &Path) -> Option<Self> {
        let name = archive.file_stem()?.to_string_lossy().into_owned();
        Some(SubmissionPackage {
            name,
            archive: archive.to_path_buf(),
        })
    }

    /// Archive file name, used for the uploaded copy on the remote machine.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// List the regular files in `source_dir`, sorted by file name.
pub fn discover_submissions(source_dir: &Path) -> Result<Vec<SubmissionPackage>> {
    let mut packages = Vec::new();
    for entry in fs::read_dir(source_dir)
        .with_context(|| format!("Failed to read submission directory {}", source_dir.display()))?
    {
        let entry = entry.context("Failed to read submission directory entry")?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(package) = SubmissionPackage::from_path(&entry.path()) {
            packages.push(package);
        }
    }
    packages.sort_by(|a, b| a.archive.cmp(&b.archive));
    Ok(packages)
}

/// Check the archive shape and return the name of its single top-level directory.
///
/// The archive must hold exactly one top-level directory, no bare top-level
/// files, and at least one file inside that directory. Directory entries are
/// optional; the top level is derived from every entry's path.
pub fn inspect_archive(archive: &Path) -> Result<String, StagingError> {
    let file = File::open(archive).map_err(|e| StagingError::Open(archive.to_path_buf(), e))?;
    let mut zip =
        ZipArchive::new(file).map_err(|e| StagingError::Archive(archive.to_path_buf(), e))?;

    let mut top_levels = BTreeSet::new();
    let mut bare_files = Vec::new();
    let mut nested_files = 0usize;

    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| StagingError::Archive(archive.to_path_buf(), e))?;
        let Some(path) = entry.enclosed_name() else {
            return Err(StagingError::UnsafeEntry(entry.name().to_string()));
        };
        let parts: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let Some(top) = parts.first() else {
            continue;
        };
        top_levels.insert(top.clone());
        if !entry.is_dir() {
            if parts.len() == 1 {
                bare_files.push(top.clone());
            } else {
                nested_files += 1;
            }
        }
    }

    if !bare_files.is_empty() {
        return Err(StagingError::BadShape(format!(
            "top-level file(s) {}",
            bare_files.iter().join(", ")
        )));
    }
    if top_levels.len() != 1 {
        return Err(StagingError::BadShape(format!(
            "{} top-level entries ({})",
            top_levels.len(),
            top_levels.iter().join(", ")
        )));
    }
    if nested_files == 0 {
        return Err(StagingError::BadShape("an empty directory".to_string()));
    }

    top_levels
        .pop_first()
        .ok_or_else(|| StagingError::BadShape("an empty archive".to_string()))
}

/// Where a submission lives on each machine once staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSubmission {
    pub root_dir: String,
    pub local_dir: PathBuf,
    pub remote_dir: String,
}

/// Unpacks archives under the local root and the remote home directory.
pub struct DeploymentStager<'a, S: RemoteSession> {
    session: &'a S,
    local_root: &'a Path,
    /// Archives were already uploaded for the whole batch.
    precopied: bool,
}

impl<'a, S: RemoteSession> DeploymentStager<'a, S> {
    pub fn new(session: &'a S, local_root: &'a Path, precopied: bool) -> Self {
        DeploymentStager {
            session,
            local_root,
            precopied,
        }
    }

    /// Path of the uploaded archive on the remote machine.
    #[must_use]
    pub fn remote_archive_path(session: &S, package: &SubmissionPackage) -> String {
        remote_join(
            &remote_join(session.home(), REMOTE_ARCHIVE_DIR),
            &package.file_name(),
        )
    }

    /// Upload archives to the remote archive directory.
    pub fn upload_archives(session: &S, packages: &[SubmissionPackage]) -> Result<(), RemoteError> {
        session.ensure_dir(&remote_join(session.home(), REMOTE_ARCHIVE_DIR))?;
        for package in packages {
            let remote_path = Self::remote_archive_path(session, package);
            debug!("Uploading {} to {remote_path}", package.archive.display());
            session.put(&package.archive, &remote_path)?;
        }
        Ok(())
    }

    /// Validate the archive and work out the per-machine paths. Touches nothing.
    pub fn prepare(&self, package: &SubmissionPackage) -> Result<StagedSubmission, StagingError> {
        let root_dir = inspect_archive(&package.archive)?;
        let staged = StagedSubmission {
            local_dir: self.local_root.join(&root_dir),
            remote_dir: remote_join(self.session.home(), &root_dir),
            root_dir,
        };
        if staged.local_dir.exists() {
            warn!(
                "{} already exists, extracting over a previous run's leftovers",
                staged.local_dir.display()
            );
        }
        Ok(staged)
    }

    /// Extract the archive on both machines.
    pub fn deploy(
        &self,
        package: &SubmissionPackage,
        staged: &StagedSubmission,
    ) -> Result<(), StagingError> {
        let file = File::open(&package.archive)
            .map_err(|e| StagingError::Open(package.archive.clone(), e))?;
        let mut zip = ZipArchive::new(file)
            .map_err(|e| StagingError::Archive(package.archive.clone(), e))?;
        zip.extract(self.local_root)
            .map_err(|e| StagingError::Extract(self.local_root.to_path_buf(), e))?;
        info!("Extracted {} to {}", package.name, staged.local_dir.display());

        if !self.precopied {
            Self::upload_archives(self.session, std::slice::from_ref(package))?;
        }
        let remote_archive = Self::remote_archive_path(self.session, package);
        self.session.extract(&remote_archive, self.session.home())?;
        info!("Extracted {} to remote {}", package.name, staged.remote_dir);

        Ok(())
    }
}
