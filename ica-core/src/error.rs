use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by ica-core.
#[derive(Debug, Error)]
pub enum IcaError {
    #[error("no subprocessor selected")]
    NoSubprocessor,

    #[error("unknown subprocessor {0}")]
    UnknownSubprocessor(String),

    #[error("at least {required} channels must be enabled for ICA (got {got})")]
    TooFewChannels { required: usize, got: usize },

    #[error("channel {index} is out of range for a subprocessor with {available} channels")]
    InvalidChannel { index: usize, available: usize },

    #[error("component {index} is out of range for an operation with {available} components")]
    InvalidComponent { index: usize, available: usize },

    #[error("ICA training is already running")]
    AlreadyTraining,

    #[error("ICA training is not running")]
    NotTraining,

    #[error("sample cache is not full yet")]
    CacheNotFull,

    #[error("sample cache has zero capacity; set a positive training duration")]
    CacheEmpty,

    #[error("lock is held by another thread")]
    LockContended,

    #[error("no ICA operation to modify")]
    NoOperation,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: expected {expected} bytes, found {actual}")]
    MatrixFileSize {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("matrix is singular and cannot be inverted")]
    SingularMatrix,

    #[error("failed to launch ICA solver: {0}")]
    SolverLaunch(String),

    #[error("ICA solver exited with code {code}")]
    SolverExit { code: i32 },

    #[error("invalid solver config: {0}")]
    SolverConfig(String),

    #[error("could not create a unique run directory under {0}")]
    RunDirectory(PathBuf),

    #[error("persisted state error: {0}")]
    Persist(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IcaError {
    /// Wrap an I/O error with the file it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IcaError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IcaError>;
