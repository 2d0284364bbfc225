use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors that abort a build before any pixel work starts (§7, *Manifest*).
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("no reconstruction log (*.log) found in {0}")]
    MissingLog(PathBuf),

    #[error("reconstruction log {0} is missing required key {1:?}")]
    MissingKey(PathBuf, &'static str),

    #[error("reconstruction log {0} has an invalid sequence range: first={1}, last={2}")]
    InvalidRange(PathBuf, i64, i64),

    #[error("reconstruction log {0} has an unparseable integer value for key {1:?}: {2}")]
    InvalidInteger(PathBuf, &'static str, String),

    #[error("input directory {0} is empty or unreadable: {1}")]
    Unreadable(PathBuf, std::io::Error),

    #[error("the first slice {0} could not be decoded: {1}")]
    FirstImageUnreadable(PathBuf, String),
}

/// Task-local errors, isolated per task and never allowed to stop the pool (§7).
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error("source image missing: {0}")]
    Missing(PathBuf),

    #[error("failed to decode {0}: {1}")]
    Decode(PathBuf, String),

    #[error("failed to write {0}: {1}")]
    Write(PathBuf, String),

    #[error("task cancelled before it started")]
    Cancelled,
}

/// A `WorkerError` tagged with the task it occurred in, collected into
/// `BuildResult::errors` rather than propagated as a `Result::Err` (§7).
#[derive(Debug, Clone)]
pub struct TaskError {
    pub level: u32,
    pub output_index: u64,
    pub source: WorkerError,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "level {} output {:06}: {}",
            self.level, self.output_index, self.source
        )
    }
}

/// Top-level error returned only for fatal (pre-work) failures.
#[derive(Error, Debug)]
pub enum PyramidError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to create directory {0}: {1}")]
    Directory(PathBuf, std::io::Error),

    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
}
