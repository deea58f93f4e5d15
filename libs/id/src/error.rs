//! Error types for identifier parsing.

use thiserror::Error;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The string is not a valid UUID.
    #[error("invalid {kind} '{input}': {message}")]
    InvalidUuid {
        kind: &'static str,
        input: String,
        message: String,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
