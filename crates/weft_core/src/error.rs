//! Core error types for weft.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Parse error
    ParseError { message: String },

    /// Validation error
    Validation { field: String, reason: String },

    /// Not found
    NotFound { kind: String, id: String },

    /// Argument count does not match the parameter list
    ArityMismatch { expected: usize, actual: usize },

    /// Value kind does not match the declared type
    TypeMismatch { expected: String, actual: String },

    /// Register index outside the frame bank
    RegisterOutOfRange { bank: String, index: usize, len: usize },

    /// Invalid lifecycle transition
    InvalidState { reason: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseError { message } => write!(f, "Parse error: {}", message),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::ArityMismatch { expected, actual } => {
                write!(f, "Expected {} arguments, got {}", expected, actual)
            }
            Self::TypeMismatch { expected, actual } => {
                write!(f, "Type mismatch: expected {}, got {}", expected, actual)
            }
            Self::RegisterOutOfRange { bank, index, len } => {
                write!(f, "Register {}[{}] out of range (bank size {})", bank, index, len)
            }
            Self::InvalidState { reason } => write!(f, "Invalid state: {}", reason),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError {
            message: err.to_string(),
        }
    }
}
