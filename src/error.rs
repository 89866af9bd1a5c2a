// src/error.rs
//
// =============================================================================
// WJM: ERROR TAXONOMY (v 0.1)
// =============================================================================
//
// Models the error categories from the design (Validation, Capacity,
// Concurrency, Runtime, Timeout, Hook, Ownership, Stale). The Command
// Surface maps each variant to an exit code; internal subsystems return
// `SchedError` directly so callers can match on it instead of string-
// sniffing an `anyhow::Error`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job id space exhausted (job_999 reached); archive before continuing")]
    IdExhausted,

    #[error("lock '{0}' timed out after {1:?}")]
    LockTimeout(&'static str, std::time::Duration),

    #[error("{0} is owned by '{1}', not the invoking user")]
    NotOwner(String, String),

    #[error("signal '{0}' is reserved for pause/resume")]
    ReservedSignal(String),

    #[error("unrecognized signal '{0}'")]
    UnknownSignal(String),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record at {0:?}: {1}")]
    MalformedRecord(PathBuf, String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SchedError>;

impl SchedError {
    /// Exit codes per §6: 0 success; 1 user/validation error; otherwise
    /// subsystem-specific, propagated verbatim where a child's own exit
    /// code is available (that mapping happens at the CLI boundary, not
    /// here).
    pub fn exit_code(&self) -> i32 {
        match self {
            SchedError::Validation { .. } => 1,
            SchedError::NotFound(_) => 1,
            SchedError::NotOwner(_, _) => 1,
            SchedError::ReservedSignal(_) => 1,
            SchedError::UnknownSignal(_) => 1,
            SchedError::IdExhausted => 2,
            SchedError::LockTimeout(_, _) => 3,
            SchedError::Io { .. } => 4,
            SchedError::MalformedRecord(_, _) => 4,
            SchedError::Other(_) => 5,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SchedError::Io {
            path: path.into(),
            source,
        }
    }
}
