//! Structured runtime errors raised by workers.
//!
//! A `StructuredError` is a managed-language value, not a Rust failure: it is
//! stored in a context's error field, merged through aggregators, and rendered
//! as a stack trace when it escapes the entry point.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One frame of an error's trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    /// Module of the callable
    pub module: String,
    /// Callable name
    pub callable: String,
    /// Worker inside the callable
    pub worker: String,
    /// Instruction pointer at the time of the error
    pub ip: usize,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({}) ip={}", self.module, self.callable, self.worker, self.ip)
    }
}

/// Error value carried by execution contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Error message
    pub message: String,
    /// Optional detail payload
    pub details: Option<Box<Value>>,
    /// Innermost frame first
    pub trace: Vec<TraceFrame>,
    /// Underlying error
    pub cause: Option<Box<StructuredError>>,
}

impl StructuredError {
    /// Create an error with an empty trace
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            trace: Vec::new(),
            cause: None,
        }
    }

    /// Attach a detail payload
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(Box::new(details));
        self
    }

    /// Attach a cause
    #[must_use]
    pub fn with_cause(mut self, cause: StructuredError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Append a frame as the error unwinds into an outer context
    pub fn push_frame(&mut self, frame: TraceFrame) {
        self.trace.push(frame);
    }

    /// Printable stack trace
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for frame in &self.trace {
            out.push_str("\n\tat ");
            out.push_str(&frame.to_string());
        }
        if let Some(cause) = &self.cause {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.render());
        }
        out
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<crate::error::CoreError> for StructuredError {
    fn from(err: crate::error::CoreError) -> Self {
        Self::new(err.to_string())
    }
}
