//! weft runtime
//!
//! Concurrent execution engine: decomposes a callable into workers, runs them
//! on a shared pool, and joins their results back into the invoking context
//! through a single-fire response aggregator. Fork-joins add "some" joins and
//! timeouts on top of the same machinery.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregator;
pub mod callable;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
mod invoke;
pub mod monitor;
pub mod scheduler;
pub mod timer;

pub use aggregator::{
    AggregatorKind, CallOutcome, FireGuard, FireOutcome, ResponseAggregator, ResponseCallback, Waiter, WorkerSignal,
};
pub use callable::{
    CallableInfo, DEFAULT_WORKER, ForkJoinInfo, JoinTargets, JoinType, Module, Program, StepResult, WorkerBody,
    WorkerInfo, WorkerSet,
};
pub use config::RuntimeConfig;
pub use context::{
    ContextInner, ContextRef, ContextState, ExecutionContext, ExecutionHook, PropertyBag, Step, WorkerStep,
};
pub use engine::Runtime;
pub use error::{RuntimeError, RuntimeResult};
pub use monitor::{MetricsSnapshot, RuntimeMetrics};
pub use scheduler::Scheduler;
pub use timer::{TimeoutHandle, TimeoutService};
