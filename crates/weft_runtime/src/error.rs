//! Errors surfaced to the host.

use weft_core::{CoreError, StructuredError};

/// Runtime result type
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors returned by the host-facing API
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A worker error reached a caller with nobody left to handle it
    #[error("error: {}", .0.render())]
    Unhandled(StructuredError),

    /// A module init routine failed
    #[error("init routine of module '{module}' failed: {}", .error.render())]
    InitRoutineFailed {
        /// Module name
        module: String,
        /// Error raised by the routine
        error: StructuredError,
    },

    /// Too many workers alive; not retried
    #[error("worker capacity exhausted: {outstanding} outstanding, limit {limit}")]
    CapacityExhausted {
        /// Workers alive when the request was refused
        outstanding: usize,
        /// Configured limit
        limit: usize,
    },

    /// The thread pool could not be started
    #[error("failed to start worker pool: {0}")]
    PoolStartup(#[from] std::io::Error),

    /// The runtime was already shut down
    #[error("runtime is shut down")]
    ShutDown,

    /// Metadata or argument problem
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RuntimeError {
    /// Whether the host must terminate rather than continue
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unhandled(_) | Self::InitRoutineFailed { .. } | Self::CapacityExhausted { .. } | Self::PoolStartup(_)
        )
    }

    /// The managed error carried by this failure, if any
    #[must_use]
    pub fn structured(&self) -> Option<&StructuredError> {
        match self {
            Self::Unhandled(error) | Self::InitRoutineFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}
