//! Error types for the execution engine and the persistence shell

use std::path::PathBuf;

/// Failures surfaced by engine operations
///
/// Provider-call failures are not represented here: the engine converts them
/// into the step's `error` field and a log entry instead of propagating them.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("another step is already running")]
    Busy,
    #[error("step index {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("no provider registered for model `{0}`")]
    UnknownProvider(String),
    #[error("step `{0}` is not awaiting review")]
    StepNotPaused(String),
    #[error("workflow is already complete")]
    WorkflowComplete,
}

/// Snapshot load/save failures
///
/// Always recoverable: a failed load falls back to the default initial state
/// and a failed save is logged, never allowed to block workflow progress.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to access snapshot at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("snapshot rejected: {0}")]
    Invalid(String),
}
