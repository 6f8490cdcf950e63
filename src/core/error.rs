use thiserror::Error;

/// Errors surfaced by the replication and migration core.
///
/// Mirrors the taxonomy in spec.md §7: transient errors are expected to be
/// retried by the caller, config-mismatch errors carry enough information
/// for a router to refresh, divergence/fatal errors should drive the
/// replica-set state machine to `ROLLBACK` or `FATAL` respectively.
#[derive(Error, Debug)]
pub enum ReplError {
    #[error("not primary")]
    NotPrimary,

    #[error("transient: {0}")]
    Transient(String),

    #[error("retry with write lock")]
    RetryWithWriteLock,

    #[error("chunk version mismatch: have {have}, want {want}")]
    ChunkVersionMismatch { have: u64, want: u64 },

    #[error("rollback needed")]
    RollbackNeeded,

    #[error("rollback impossible: {0}")]
    RollbackImpossible(String),

    #[error("storage engine error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, ReplError>;

impl ReplError {
    /// True for errors that should drive the owning state machine to `FATAL`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplError::Fatal(_) | ReplError::RollbackImpossible(_))
    }
}

impl From<std::io::Error> for ReplError {
    fn from(err: std::io::Error) -> Self {
        ReplError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ReplError {
    fn from(err: serde_json::Error) -> Self {
        ReplError::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for ReplError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ReplError::Transient(err.to_string())
    }
}
