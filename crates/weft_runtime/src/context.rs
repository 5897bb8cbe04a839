//! Execution contexts.
//!
//! One context per running worker. Content lives behind a mutex that is held
//! by the thread executing the worker for the whole step, and briefly by the
//! aggregator that merges results into it once the worker is suspended.

use crate::aggregator::ResponseAggregator;
use crate::callable::{CallableInfo, ForkJoinInfo, JoinTargets, Program, StepResult, WorkerInfo};
use crate::invoke;
use crate::scheduler::Scheduler;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use weft_core::{ContextId, FrameShape, InvocationId, RegisterFrame, StructuredError, TraceFrame, Value};

/// Shared handle to a context
pub type ContextRef = Arc<ExecutionContext>;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Frame populated, not handed to the scheduler
    Created,
    /// Waiting for a thread
    Scheduled,
    /// Executing its body
    Running,
    /// Waiting for children it started
    Suspended,
    /// Finished normally
    Completed,
    /// Finished with an error
    Errored,
}

impl ContextState {
    /// Whether the context can never run again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    /// Whether the scheduler may start running it
    #[must_use]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, Self::Created | Self::Scheduled)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Key-value properties shared by every worker of one invocation
#[derive(Debug, Default)]
pub struct PropertyBag {
    entries: RwLock<IndexMap<String, Value>>,
}

impl PropertyBag {
    /// Create an empty bag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a property
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    /// Set a property, returning the previous value
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.write().insert(key.into(), value)
    }

    /// Whether a property is set
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of properties
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the bag is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Mutable content of a context
#[derive(Debug)]
pub struct ContextInner {
    /// Lifecycle state
    pub state: ContextState,
    /// Instruction pointer the body resumes from
    pub ip: usize,
    /// Local registers
    pub frame: RegisterFrame,
    /// Values the worker returned, by return index
    pub returns: Vec<Option<Value>>,
    /// Error raised by or propagated into this context; never cleared
    pub error: Option<StructuredError>,
}

impl ContextInner {
    /// Record an error unless one is already present
    pub fn set_error(&mut self, error: StructuredError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// Execution state of one worker
pub struct ExecutionContext {
    id: ContextId,
    invocation: InvocationId,
    program: Arc<Program>,
    callable: Option<Arc<CallableInfo>>,
    worker: Option<Arc<WorkerInfo>>,
    parent: Weak<ExecutionContext>,
    aggregator: Option<Arc<ResponseAggregator>>,
    properties: Arc<PropertyBag>,
    run_in_caller: bool,
    init: bool,
    inner: Mutex<ContextInner>,
}

/// Arguments for building a worker context
pub(crate) struct WorkerSpec {
    pub invocation: InvocationId,
    pub program: Arc<Program>,
    pub callable: Arc<CallableInfo>,
    pub worker: Arc<WorkerInfo>,
    pub parent: Option<ContextRef>,
    pub aggregator: Arc<ResponseAggregator>,
    pub properties: Arc<PropertyBag>,
    pub frame: RegisterFrame,
    pub run_in_caller: bool,
    pub init: bool,
}

impl ExecutionContext {
    /// Context that only receives results for a host call; it never runs
    #[must_use]
    pub fn root(program: Arc<Program>, shape: &FrameShape) -> ContextRef {
        Arc::new(Self {
            id: ContextId::new(),
            invocation: InvocationId::new(),
            program,
            callable: None,
            worker: None,
            parent: Weak::new(),
            aggregator: None,
            properties: Arc::new(PropertyBag::new()),
            run_in_caller: false,
            init: false,
            inner: Mutex::new(ContextInner {
                state: ContextState::Suspended,
                ip: 0,
                frame: RegisterFrame::with_shape(shape),
                returns: Vec::new(),
                error: None,
            }),
        })
    }

    pub(crate) fn worker(spec: WorkerSpec) -> ContextRef {
        Arc::new(Self {
            id: ContextId::new(),
            invocation: spec.invocation,
            program: spec.program,
            callable: Some(spec.callable),
            worker: Some(spec.worker),
            parent: spec.parent.as_ref().map(Arc::downgrade).unwrap_or_default(),
            aggregator: Some(spec.aggregator),
            properties: spec.properties,
            run_in_caller: spec.run_in_caller,
            init: spec.init,
            inner: Mutex::new(ContextInner {
                state: ContextState::Created,
                ip: 0,
                frame: spec.frame,
                returns: Vec::new(),
                error: None,
            }),
        })
    }

    /// Context id
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Invocation this context belongs to
    #[must_use]
    pub fn invocation(&self) -> InvocationId {
        self.invocation
    }

    /// Loaded program
    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Callable being executed; `None` for a root context
    #[must_use]
    pub fn callable(&self) -> Option<&Arc<CallableInfo>> {
        self.callable.as_ref()
    }

    /// Worker being executed; `None` for a root context
    #[must_use]
    pub fn worker_info(&self) -> Option<&Arc<WorkerInfo>> {
        self.worker.as_ref()
    }

    /// Worker name, or `root`
    #[must_use]
    pub fn worker_name(&self) -> &str {
        self.worker.as_ref().map_or("root", |w| w.name())
    }

    /// Context that started this one, if still alive
    #[must_use]
    pub fn parent(&self) -> Option<ContextRef> {
        self.parent.upgrade()
    }

    /// Aggregator this context signals on completion
    #[must_use]
    pub fn aggregator(&self) -> Option<&Arc<ResponseAggregator>> {
        self.aggregator.as_ref()
    }

    /// Properties shared with sibling workers
    #[must_use]
    pub fn properties(&self) -> &Arc<PropertyBag> {
        &self.properties
    }

    /// Whether this context may run on the calling thread
    #[must_use]
    pub fn run_in_caller(&self) -> bool {
        self.run_in_caller
    }

    /// Whether this is an init worker
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.init
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    /// Error carried by this context
    #[must_use]
    pub fn error(&self) -> Option<StructuredError> {
        self.inner.lock().error.clone()
    }

    /// Copy of the register frame
    #[must_use]
    pub fn frame_snapshot(&self) -> RegisterFrame {
        self.inner.lock().frame.clone()
    }

    /// Lock the mutable content
    pub fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock()
    }

    /// Trace frame describing this context at `ip`
    #[must_use]
    pub fn trace_frame(&self, ip: usize) -> TraceFrame {
        TraceFrame {
            module: self.callable.as_ref().map_or_else(String::new, |c| c.module().to_string()),
            callable: self.callable.as_ref().map_or_else(String::new, |c| c.name().to_string()),
            worker: self.worker_name().to_string(),
            ip,
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("invocation", &self.invocation)
            .field("worker", &self.worker_name())
            .field("run_in_caller", &self.run_in_caller)
            .finish_non_exhaustive()
    }
}

/// Outcome of one run of a worker body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Body finished; returned values are signaled to the aggregator
    Done,
    /// Body started children and waits for them
    Await,
}

/// Handle given to a worker body while it runs
pub struct WorkerStep<'a> {
    scheduler: &'a Scheduler,
    ctx: &'a ContextRef,
    inner: &'a mut ContextInner,
    inline: Option<ContextRef>,
    awaiting: bool,
}

impl<'a> WorkerStep<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, ctx: &'a ContextRef, inner: &'a mut ContextInner) -> Self {
        Self {
            scheduler,
            ctx,
            inner,
            inline: None,
            awaiting: false,
        }
    }

    pub(crate) fn finish(self) -> (bool, Option<ContextRef>) {
        (self.awaiting, self.inline)
    }

    /// Context being executed
    #[must_use]
    pub fn context(&self) -> &ContextRef {
        self.ctx
    }

    /// Worker name
    #[must_use]
    pub fn worker_name(&self) -> &str {
        self.ctx.worker_name()
    }

    /// Properties shared with sibling workers
    #[must_use]
    pub fn properties(&self) -> &PropertyBag {
        self.ctx.properties()
    }

    /// Instruction pointer
    #[must_use]
    pub fn ip(&self) -> usize {
        self.inner.ip
    }

    /// Move the instruction pointer
    pub fn jump(&mut self, ip: usize) {
        self.inner.ip = ip;
    }

    /// Local registers
    #[must_use]
    pub fn frame(&self) -> &RegisterFrame {
        &self.inner.frame
    }

    /// Local registers, mutably
    pub fn frame_mut(&mut self) -> &mut RegisterFrame {
        &mut self.inner.frame
    }

    /// Error propagated into this context, if any
    #[must_use]
    pub fn error(&self) -> Option<&StructuredError> {
        self.inner.error.as_ref()
    }

    /// Set return value `index`
    pub fn set_return(&mut self, index: usize, value: Value) {
        if self.inner.returns.len() <= index {
            self.inner.returns.resize(index + 1, None);
        }
        self.inner.returns[index] = Some(value);
    }

    /// Call `callee` with arguments read from `arg_regs`; its results are
    /// written to `ret_regs` before this context resumes.
    ///
    /// # Errors
    ///
    /// Returns error if arguments cannot be read or the workers cannot be
    /// started; the body may propagate it
    pub fn invoke(&mut self, callee: &Arc<CallableInfo>, arg_regs: &[usize], ret_regs: &[usize]) -> StepResult {
        self.ensure_can_spawn()?;
        let inline = invoke::invoke_nested(self.scheduler, self.ctx, self.inner, callee, arg_regs, ret_regs)
            .map_err(invoke::into_structured)?;
        self.await_children(inline)
    }

    /// Fork the workers of `info` and resume at the join or timeout target.
    ///
    /// # Errors
    ///
    /// Returns error if the descriptor is invalid, the timeout register is
    /// missing, or the workers cannot be started
    pub fn fork_join(&mut self, info: &ForkJoinInfo, targets: JoinTargets) -> StepResult {
        self.ensure_can_spawn()?;
        let inline = invoke::invoke_fork_join(self.scheduler, self.ctx, self.inner, info, targets)
            .map_err(invoke::into_structured)?;
        self.await_children(inline)
    }

    fn ensure_can_spawn(&self) -> Result<(), StructuredError> {
        if self.ctx.is_init() {
            return Err(StructuredError::new("init worker cannot start workers"));
        }
        if self.awaiting {
            return Err(StructuredError::new("worker is already waiting for children"));
        }
        Ok(())
    }

    fn await_children(&mut self, inline: Option<ContextRef>) -> StepResult {
        self.awaiting = true;
        self.inline = inline;
        Ok(Step::Await)
    }
}

/// Observer notified as workers run
pub trait ExecutionHook: Send + Sync {
    /// A context is about to run its body
    fn worker_executing(&self, ctx: &ExecutionContext);

    /// A context reached a terminal state
    fn worker_finished(&self, _ctx: &ExecutionContext, _state: ContextState) {}
}
