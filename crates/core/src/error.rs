//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Validation failures for core primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A name (job, phase, stream) failed validation.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Two entries were registered under the same name.
    #[error("duplicate name: {0}")]
    Duplicate(String),
}

impl CoreError {
    pub fn invalid_name(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason,
        }
    }

    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::Duplicate(name.into())
    }
}
