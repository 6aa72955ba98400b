//! Turn the harvested frames of both machines into one contiguous sequence.

use crate::Machine;
use crate::harvest::StagedFrame;
use itertools::Itertools;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Prefix of every renumbered frame.
pub const FRAME_PREFIX: &str = "input_";

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("could not create {0}: {1}")]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("could not replace {0}: {1}")]
    Replace(PathBuf, #[source] io::Error),
    #[error("could not move {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFrame {
    pub index: usize,
    pub path: PathBuf,
    pub origin: Machine,
    pub original_name: String,
}

/// Frames named `input_000.ext`, `input_001.ext`, ... with no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSequence {
    pub dir: PathBuf,
    pub frames: Vec<NormalizedFrame>,
}

impl NormalizedSequence {
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Extension of the first frame; the encoder input pattern is built from it.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        self.frames.first().map(|f| extension_of(&f.original_name))
    }

    /// Every distinct extension in the sequence, sorted.
    #[must_use]
    pub fn extensions(&self) -> Vec<String> {
        self.frames
            .iter()
            .map(|f| extension_of(&f.original_name).to_string())
            .unique()
            .sorted()
            .collect()
    }

    /// Number of leading frames sharing the first frame's extension. The
    /// encoder's numbered input stops at the first index it cannot find.
    #[must_use]
    pub fn encodable_len(&self) -> usize {
        let Some(first) = self.extension() else {
            return 0;
        };
        self.frames
            .iter()
            .take_while(|f| extension_of(&f.original_name) == first)
            .count()
    }

    /// printf-style input pattern for the encoder, e.g. `input_%03d.png`.
    #[must_use]
    pub fn input_pattern(&self) -> Option<String> {
        self.extension().map(|ext| format!("{FRAME_PREFIX}%03d.{ext}"))
    }
}

fn extension_of(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

/// Sort frames by original name, local before remote on ties, and move them
/// into `dir` under consecutive names.
///
/// An existing file at a destination is replaced. The move keeps each frame's
/// modification time.
pub fn normalize(
    mut frames: Vec<StagedFrame>,
    dir: &Path,
) -> Result<NormalizedSequence, NormalizeError> {
    fs::create_dir_all(dir).map_err(|e| NormalizeError::CreateDir(dir.to_path_buf(), e))?;
    frames.sort_by(|a, b| {
        a.original_name
            .cmp(&b.original_name)
            .then(a.origin.cmp(&b.origin))
    });

    let mut normalized = Vec::with_capacity(frames.len());
    for (index, frame) in frames.into_iter().enumerate() {
        let dest = dir.join(format!(
            "{FRAME_PREFIX}{index:03}.{}",
            extension_of(&frame.original_name)
        ));
        if dest.exists() {
            debug!("Replacing existing {}", dest.display());
            fs::remove_file(&dest).map_err(|e| NormalizeError::Replace(dest.clone(), e))?;
        }
        fs::rename(&frame.path, &dest).map_err(|source| NormalizeError::Rename {
            from: frame.path.clone(),
            to: dest.clone(),
            source,
        })?;
        normalized.push(NormalizedFrame {
            index,
            path: dest,
            origin: frame.origin,
            original_name: frame.original_name,
        });
    }

    info!("Normalized {} frame(s) in {}", normalized.len(), dir.display());
    Ok(NormalizedSequence {
        dir: dir.to_path_buf(),
        frames: normalized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn stage(dir: &Path, origin: Machine, name: &str) -> StagedFrame {
        let sub = dir.join(origin.to_string());
        fs::create_dir_all(&sub).unwrap();
        let path = sub.join(name);
        fs::write(&path, format!("{origin}:{name}")).unwrap();
        StagedFrame {
            path,
            origin,
            original_name: name.to_string(),
            modified: Utc::now(),
        }
    }

    #[test_log::test]
    fn test_interleaves_both_machines() {
        let dir = tempdir().unwrap();
        let frames = vec![
            stage(dir.path(), Machine::Remote, "001.png"),
            stage(dir.path(), Machine::Local, "002.png"),
            stage(dir.path(), Machine::Local, "000.png"),
            stage(dir.path(), Machine::Remote, "003.png"),
        ];
        let seq = normalize(frames, dir.path()).unwrap();

        let order: Vec<&str> = seq.frames.iter().map(|f| f.original_name.as_str()).collect();
        assert_eq!(order, vec!["000.png", "001.png", "002.png", "003.png"]);
        for (i, frame) in seq.frames.iter().enumerate() {
            assert_eq!(frame.index, i);
            assert_eq!(frame.path, dir.path().join(format!("input_{i:03}.png")));
            assert!(frame.path.is_file());
        }
        assert_eq!(seq.input_pattern().as_deref(), Some("input_%03d.png"));
    }

    #[test_log::test]
    fn test_same_name_on_both_machines_keeps_both() {
        let dir = tempdir().unwrap();
        let frames = vec![
            stage(dir.path(), Machine::Remote, "000.png"),
            stage(dir.path(), Machine::Local, "000.png"),
        ];
        let seq = normalize(frames, dir.path()).unwrap();

        assert_eq!(seq.len(), 2);
        assert_eq!(seq.frames[0].origin, Machine::Local);
        assert_eq!(
            fs::read_to_string(dir.path().join("input_001.png")).unwrap(),
            "remote:000.png"
        );
    }

    #[test_log::test]
    fn test_replaces_existing_destination() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("input_000.jpg"), "stale").unwrap();
        let frames = vec![stage(dir.path(), Machine::Local, "000.jpg")];
        normalize(frames, dir.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("input_000.jpg")).unwrap(),
            "local:000.jpg"
        );
    }

    #[test_log::test]
    fn test_mixed_extensions() {
        let dir = tempdir().unwrap();
        let frames = vec![
            stage(dir.path(), Machine::Local, "000.png"),
            stage(dir.path(), Machine::Local, "001.png"),
            stage(dir.path(), Machine::Remote, "002.jpg"),
            stage(dir.path(), Machine::Local, "003.png"),
        ];
        let seq = normalize(frames, dir.path()).unwrap();
        assert_eq!(seq.extension(), Some("png"));
        assert_eq!(seq.extensions(), vec!["jpg", "png"]);
        assert!(dir.path().join("input_002.jpg").is_file());
        assert_eq!(seq.encodable_len(), 2);
    }

    #[test_log::test]
    fn test_empty() {
        let dir = tempdir().unwrap();
        let seq = normalize(Vec::new(), dir.path()).unwrap();
        assert!(seq.is_empty());
        assert_eq!(seq.input_pattern(), None);
    }
}
