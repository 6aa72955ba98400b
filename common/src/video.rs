//! Encode a normalized frame sequence into a video with an external encoder.

use crate::normalize::NormalizedSequence;
use itertools::Itertools;
use log::{debug, info};
use std::io;
use std::path::{self, Path, PathBuf};
use std::process::{Command, Stdio};

/// Name of the encoded video inside the submission's result directory.
pub const VIDEO_FILE_NAME: &str = "result.mp4";

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("no frames to encode")]
    EmptySequence,
    #[error("frame rate must be positive")]
    InvalidFrameRate,
    #[error("failed to start encoder {0}: {1}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("encoder exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("encoder reported success but {0} is missing")]
    MissingOutput(PathBuf),
    #[error("cannot resolve {0}: {1}")]
    Resolve(PathBuf, #[source] io::Error),
}

/// Drives an ffmpeg-compatible encoder.
#[derive(Debug, Clone)]
pub struct VideoAssembler {
    program: PathBuf,
}

impl VideoAssembler {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        VideoAssembler {
            program: program.into(),
        }
    }

    fn args(pattern: &Path, fps: u32, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-framerate".to_string(),
            fps.to_string(),
            "-i".to_string(),
            pattern.display().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-crf".to_string(),
            "18".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            output.display().to_string(),
        ]
    }

    /// Encode `sequence` at `fps` into `output`, replacing any previous file.
    ///
    /// Relative paths are resolved against the current directory before the
    /// encoder sees them. Returns the absolute path of the video.
    pub fn assemble(
        &self,
        sequence: &NormalizedSequence,
        fps: u32,
        output: &Path,
    ) -> Result<PathBuf, EncodingError> {
        let pattern = sequence.input_pattern().ok_or(EncodingError::EmptySequence)?;
        if fps == 0 {
            return Err(EncodingError::InvalidFrameRate);
        }
        let resolve = |path: &Path| {
            path::absolute(path).map_err(|e| EncodingError::Resolve(path.to_path_buf(), e))
        };
        let input = resolve(&sequence.dir)?.join(pattern);
        let output = resolve(output)?;
        let args = Self::args(&input, fps, &output);
        debug!("{} {}", self.program.display(), args.iter().join(" "));

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EncodingError::Spawn(self.program.clone(), e))?;
        if !result.status.success() {
            return Err(EncodingError::Failed {
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !output.is_file() {
            return Err(EncodingError::MissingOutput(output));
        }

        info!(
            "Encoded {} frame(s) at {fps} fps into {}",
            sequence.len(),
            output.display()
        );
        Ok(output)
    }
}
