use thiserror::Error;

/// Errors raised while parsing or validating domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type DomainResult<T> = Result<T, DomainError>;
