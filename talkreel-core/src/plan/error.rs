use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read schedule {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse schedule {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("two talks map to the same file {path}")]
    DuplicateTarget { path: PathBuf },
}

pub type PlanResult<T> = std::result::Result<T, PlanError>;
