use thiserror::Error;

/// Errors raised by collaborators plugged into the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("notification sink error: {0}")]
    Sink(String),

    #[error("capability validator error: {0}")]
    Validator(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
