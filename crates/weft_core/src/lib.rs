//! weft core types
//!
//! Pure data shared by the execution engine: identifiers, values, register
//! frames and structured errors. Nothing in this crate spawns threads or
//! performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fault;
pub mod frame;
pub mod id;
pub mod value;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use fault::{StructuredError, TraceFrame};
pub use frame::{FrameShape, RegisterFrame};
pub use id::{ContextId, InvocationId};
pub use value::{Value, ValueType};
