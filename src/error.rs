//! Error taxonomy for pipeline runs.

use std::path::PathBuf;

use crate::pipeline::StageKind;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing or unreadable artifact, report or output folder.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unparsable table or geometry record.
    #[error("malformed data in {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("cancelled")]
    Cancelled,

    /// Only raised when the exit code policy is strict.
    #[error("command '{command}' exited with status {code}")]
    NonZeroExit { command: String, code: i32 },

    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("annotation store error: {0}")]
    Store(String),

    #[error("image selection is empty")]
    EmptySelection,

    #[error("a cancellation is in progress, no new runs are accepted")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A stage run that ended in `Failed`, with the stage that raised it.
#[derive(Debug, thiserror::Error)]
#[error("stage '{stage}' failed: {error}")]
pub struct StageFailure {
    pub stage: StageKind,
    #[source]
    pub error: PipelineError,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
