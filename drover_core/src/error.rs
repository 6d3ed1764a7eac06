use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to callers of the engine verbs.
///
/// Only pre-flight problems are errors. A run that ends on its deadline, is
/// stopped, or exits non-zero is a normal outcome and is encoded in the
/// returned result instead.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The executable could not be spawned (missing, not executable, ...).
    #[error("Failed to launch {program:?}: {source}")]
    LaunchFailure {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Minimization failed: {0}")]
    MinimizationFailed(String),

    #[error("Reproduction failed: {0}")]
    ReproductionFailed(String),

    #[error("Engine '{0}' is not registered or not available")]
    EngineNotFound(String),

    #[error("No fuzzing engine is available on this host")]
    NoEngineAvailable,

    #[error("Engine '{engine}' does not support {operation}")]
    UnsupportedOperation {
        engine: String,
        operation: &'static str,
    },

    /// Workspace allocation or corpus seeding failed.
    #[error("Workspace error at {path:?}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The worker task driving an operation panicked or was aborted.
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

impl EngineError {
    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Workspace {
            path: path.into(),
            source,
        }
    }
}
