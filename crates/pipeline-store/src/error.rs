use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Missing, or owned by a tenant outside the caller's scope.
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The row was not in the phase the write expected.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Lock timeout, deadlock or serialization failure. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<pipeline_types::DomainError> for StorageError {
    fn from(err: pipeline_types::DomainError) -> Self {
        Self::Serialization(err.to_string())
    }
}
