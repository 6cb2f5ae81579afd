use std::path::PathBuf;

use thiserror::Error;

use super::transcode::TranscodeError;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("downloaded file {path} is below the minimum valid size")]
    EmptyDownload { path: PathBuf },
    #[error("invalid playlist: {0}")]
    InvalidPlaylist(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to publish {path}: {source}")]
    Publish {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("transcode operation failed: {0}")]
    Transcode(String),
}

impl From<reqwest::Error> for AcquireError {
    fn from(error: reqwest::Error) -> Self {
        AcquireError::Network(error.to_string())
    }
}

impl From<TranscodeError> for AcquireError {
    fn from(error: TranscodeError) -> Self {
        AcquireError::Transcode(error.to_string())
    }
}

pub type AcquireResult<T> = Result<T, AcquireError>;
