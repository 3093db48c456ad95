use pipeline_store::StorageError;
use pipeline_types::DomainError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Workflow errors, as seen by callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing, or outside the caller's tenant. The two are not distinguished.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Lock timeout or deadlock; the operation had no effect and may be retried.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Persistence failure; the operation was rolled back.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub(crate) fn transition(
        what: impl std::fmt::Display,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition(format!("{what} cannot move from {from} to {to}"))
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvalidTransition(msg) => Self::InvalidTransition(msg),
            StorageError::InvalidInput(msg) => Self::InvalidInput(msg),
            StorageError::Transient(msg) => Self::Transient(msg),
            StorageError::Serialization(msg) | StorageError::Backend(msg) => Self::Fatal(msg),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}
