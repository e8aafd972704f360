use concord_core::{PolicyKey, RejectionReason, ValueKind};
use std::fmt;
use thiserror::Error;

/// Single error enum for all policy engine operations.
///
/// Every variant is recovered at the engine boundary and returned to the
/// caller; none leaves partially-applied state behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("type mismatch for {key}: expected {expected}, got {actual}")]
    TypeMismatch {
        key: PolicyKey,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("unknown policy type: {0}")]
    UnknownPolicyType(String),

    #[error("rejected by capability validator: {0}")]
    BusinessRuleRejected(RejectionReason),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PolicyError {
    pub fn kind(&self) -> PolicyErrorKind {
        match self {
            PolicyError::TypeMismatch { .. } => PolicyErrorKind::TypeMismatch,
            PolicyError::UnknownPolicyType(_) => PolicyErrorKind::UnknownPolicyType,
            PolicyError::BusinessRuleRejected(_) => PolicyErrorKind::BusinessRuleRejected,
            PolicyError::InvalidRegistration(_) => PolicyErrorKind::InvalidRegistration,
            PolicyError::Internal(_) => PolicyErrorKind::Internal,
        }
    }
}

/// Discriminator for PolicyError variants, used in structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyErrorKind {
    TypeMismatch,
    UnknownPolicyType,
    BusinessRuleRejected,
    InvalidRegistration,
    Internal,
}

impl fmt::Display for PolicyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyErrorKind::TypeMismatch => write!(f, "TypeMismatch"),
            PolicyErrorKind::UnknownPolicyType => write!(f, "UnknownPolicyType"),
            PolicyErrorKind::BusinessRuleRejected => write!(f, "BusinessRuleRejected"),
            PolicyErrorKind::InvalidRegistration => write!(f, "InvalidRegistration"),
            PolicyErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

pub type PolicyResult<T> = Result<T, PolicyError>;
