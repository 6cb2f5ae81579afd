use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::TranscodeSection;

pub type TranscodeResult<T> = Result<T, TranscodeError>;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder binary not found: {0}")]
    NotFound(String),
    #[error("transcode exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Re-encode step between raw artifact and final file. Implemented by
/// ffmpeg in production and by stubs in tests.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Checks that the transcoder can run at all, before any task starts.
    async fn validate(&self) -> TranscodeResult<()>;
    async fn transcode(&self, input: &Path, output: &Path) -> TranscodeResult<()>;
}

pub struct FfmpegTranscoder {
    section: TranscodeSection,
}

impl FfmpegTranscoder {
    pub fn new(section: TranscodeSection) -> Self {
        Self { section }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn validate(&self) -> TranscodeResult<()> {
        let mut command = Command::new(&self.section.ffmpeg_binary);
        command.kill_on_drop(true).arg("-version");
        match command.output().await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(TranscodeError::NotFound(self.section.ffmpeg_binary.clone()))
            }
            Err(err) => Err(TranscodeError::Io {
                source: err,
                path: PathBuf::from(&self.section.ffmpeg_binary),
            }),
        }
    }

    async fn transcode(&self, input: &Path, output: &Path) -> TranscodeResult<()> {
        let mut command = Command::new(&self.section.ffmpeg_binary);
        command
            .kill_on_drop(true)
            .arg("-y")
            .arg("-fflags")
            .arg("+genpts")
            .arg("-err_detect")
            .arg("ignore_err")
            .arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(format!("scale={}", self.section.scale))
            .arg("-c:v")
            .arg("libx264")
            .arg("-crf")
            .arg(self.section.crf.to_string())
            .arg("-preset")
            .arg(&self.section.preset)
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg(&self.section.audio_bitrate)
            .arg("-map_metadata")
            .arg("-1")
            .arg(output);

        debug!(
            input = %input.display(),
            output = %output.display(),
            crf = self.section.crf,
            preset = %self.section.preset,
            "running ffmpeg"
        );

        let result = match command.output().await {
            Ok(result) => result,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscodeError::NotFound(self.section.ffmpeg_binary.clone()));
            }
            Err(err) => {
                return Err(TranscodeError::Io {
                    source: err,
                    path: input.to_path_buf(),
                });
            }
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(TranscodeError::Failed {
                status: result.status.code(),
                stderr: stderr_tail(&stderr, 500),
            });
        }
        Ok(())
    }
}

/// Keeps the last `limit` characters of ffmpeg's stderr for the error record.
fn stderr_tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    let tail: String = if count <= limit {
        text.to_string()
    } else {
        text.chars().skip(count - limit).collect()
    };
    tail.trim().to_string()
}
