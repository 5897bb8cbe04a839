//! Callable metadata handed over by the loader.
//!
//! A callable is a named unit with typed parameters and returns whose body is
//! one or more workers. A worker's body is opaque to the engine: it is a
//! `WorkerBody` that runs on a register frame and either finishes or suspends
//! on children it started.

use crate::context::{Step, WorkerStep};
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use std::sync::Arc;
use weft_core::{CoreError, CoreResult, FrameShape, StructuredError, ValueType};

/// Name given to the implicit worker of every callable
pub const DEFAULT_WORKER: &str = "default";

/// Result of running a worker body once
pub type StepResult = Result<Step, StructuredError>;

/// Executable body of a worker
pub trait WorkerBody: Send + Sync {
    /// Run from the context's current instruction pointer
    fn run(&self, step: &mut WorkerStep<'_>) -> StepResult;
}

struct FnBody<F>(F);

impl<F> WorkerBody for FnBody<F>
where
    F: Fn(&mut WorkerStep<'_>) -> StepResult + Send + Sync,
{
    fn run(&self, step: &mut WorkerStep<'_>) -> StepResult {
        (self.0)(step)
    }
}

/// One worker of a callable or fork-join
#[derive(Clone)]
pub struct WorkerInfo {
    name: String,
    shape: FrameShape,
    body: Arc<dyn WorkerBody>,
}

impl WorkerInfo {
    /// Create a worker from a closure body
    pub fn new<F>(name: impl Into<String>, shape: FrameShape, body: F) -> Self
    where
        F: Fn(&mut WorkerStep<'_>) -> StepResult + Send + Sync + 'static,
    {
        Self::from_body(name, shape, Arc::new(FnBody(body)))
    }

    /// Create a worker from a shared body
    pub fn from_body(name: impl Into<String>, shape: FrameShape, body: Arc<dyn WorkerBody>) -> Self {
        Self {
            name: name.into(),
            shape,
            body,
        }
    }

    /// Worker whose body finishes immediately
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, FrameShape::empty(), |_| Ok(Step::Done))
    }

    /// Worker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register frame shape
    #[must_use]
    pub fn shape(&self) -> &FrameShape {
        &self.shape
    }

    /// Body
    #[must_use]
    pub fn body(&self) -> &Arc<dyn WorkerBody> {
        &self.body
    }
}

impl fmt::Debug for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInfo")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// Workers of one invocation, by role
#[derive(Debug, Clone)]
pub struct WorkerSet {
    /// Runs first on the calling thread and seeds the general workers
    pub init: Option<Arc<WorkerInfo>>,
    /// Parallel units of the body; never empty
    pub general: Vec<Arc<WorkerInfo>>,
}

/// Function or resource metadata
#[derive(Debug, Clone)]
pub struct CallableInfo {
    module: String,
    name: String,
    param_types: Vec<ValueType>,
    return_types: Vec<ValueType>,
    default_worker: Arc<WorkerInfo>,
    workers: Vec<Arc<WorkerInfo>>,
}

impl CallableInfo {
    /// Create a callable whose body is `default_worker`
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>, default_worker: WorkerInfo) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            param_types: Vec::new(),
            return_types: Vec::new(),
            default_worker: Arc::new(default_worker),
            workers: Vec::new(),
        }
    }

    /// Set parameter types
    #[must_use]
    pub fn with_params(mut self, types: impl Into<Vec<ValueType>>) -> Self {
        self.param_types = types.into();
        self
    }

    /// Set return types
    #[must_use]
    pub fn with_returns(mut self, types: impl Into<Vec<ValueType>>) -> Self {
        self.return_types = types.into();
        self
    }

    /// Declare an explicit worker
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerInfo) -> Self {
        self.workers.push(Arc::new(worker));
        self
    }

    /// Module name
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Callable name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter types
    #[must_use]
    pub fn param_types(&self) -> &[ValueType] {
        &self.param_types
    }

    /// Return types
    #[must_use]
    pub fn return_types(&self) -> &[ValueType] {
        &self.return_types
    }

    /// Explicitly declared workers
    #[must_use]
    pub fn workers(&self) -> &[Arc<WorkerInfo>] {
        &self.workers
    }

    /// Resolve roles: with no explicit workers the default worker is the only
    /// general worker; otherwise it becomes the init worker.
    #[must_use]
    pub fn worker_set(&self) -> WorkerSet {
        if self.workers.is_empty() {
            WorkerSet {
                init: None,
                general: vec![self.default_worker.clone()],
            }
        } else {
            WorkerSet {
                init: Some(self.default_worker.clone()),
                general: self.workers.clone(),
            }
        }
    }
}

/// Join discipline of a fork-join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Every join worker must signal
    All,
    /// The first `n` join workers to signal
    Some(usize),
    /// `some` without a count: as many signals as declared workers
    SomeDefault,
}

/// Where a fork-join resumes its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTargets {
    /// Instruction pointer after a join
    pub join_ip: usize,
    /// Reference register receiving the join results
    pub join_reg: usize,
    /// Instruction pointer after a timeout
    pub timeout_ip: usize,
    /// Reference register receiving the partial results
    pub timeout_reg: usize,
}

/// Fork-join descriptor
#[derive(Debug, Clone)]
pub struct ForkJoinInfo {
    workers: Vec<Arc<WorkerInfo>>,
    join_workers: Vec<String>,
    join: JoinType,
    channels: IndexMap<String, String>,
    arg_types: Vec<ValueType>,
    arg_regs: Vec<usize>,
    timeout_reg: Option<usize>,
}

impl ForkJoinInfo {
    /// Fork the given workers, joining on all of them
    #[must_use]
    pub fn new(workers: Vec<WorkerInfo>) -> Self {
        Self {
            workers: workers.into_iter().map(Arc::new).collect(),
            join_workers: Vec::new(),
            join: JoinType::All,
            channels: IndexMap::new(),
            arg_types: Vec::new(),
            arg_regs: Vec::new(),
            timeout_reg: None,
        }
    }

    /// Set the join discipline
    #[must_use]
    pub fn with_join(mut self, join: JoinType) -> Self {
        self.join = join;
        self
    }

    /// Restrict the join to the named workers
    #[must_use]
    pub fn with_join_workers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_workers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Route a worker's results through a named channel
    #[must_use]
    pub fn with_channel(mut self, worker: impl Into<String>, channel: impl Into<String>) -> Self {
        self.channels.insert(worker.into(), channel.into());
        self
    }

    /// Parent registers copied into every forked worker
    #[must_use]
    pub fn with_args(mut self, types: impl Into<Vec<ValueType>>, regs: impl Into<Vec<usize>>) -> Self {
        self.arg_types = types.into();
        self.arg_regs = regs.into();
        self
    }

    /// Parent integer register holding the timeout in seconds
    #[must_use]
    pub fn with_timeout_reg(mut self, reg: usize) -> Self {
        self.timeout_reg = Some(reg);
        self
    }

    /// Forked workers
    #[must_use]
    pub fn workers(&self) -> &[Arc<WorkerInfo>] {
        &self.workers
    }

    /// Join discipline
    #[must_use]
    pub const fn join(&self) -> JoinType {
        self.join
    }

    /// Worker to channel routing
    #[must_use]
    pub fn channels(&self) -> &IndexMap<String, String> {
        &self.channels
    }

    /// Argument types
    #[must_use]
    pub fn arg_types(&self) -> &[ValueType] {
        &self.arg_types
    }

    /// Argument registers in the parent
    #[must_use]
    pub fn arg_regs(&self) -> &[usize] {
        &self.arg_regs
    }

    /// Timeout register, if the fork-join has a timeout
    #[must_use]
    pub const fn timeout_reg(&self) -> Option<usize> {
        self.timeout_reg
    }

    /// Workers counting toward the join; all workers when none are named
    #[must_use]
    pub fn join_set(&self) -> IndexSet<String> {
        if self.join_workers.is_empty() {
            self.workers.iter().map(|w| w.name().to_string()).collect()
        } else {
            self.join_workers.iter().cloned().collect()
        }
    }

    /// Signals needed before the join fires
    #[must_use]
    pub fn required_count(&self) -> usize {
        match self.join {
            JoinType::All => self.join_set().len(),
            JoinType::Some(count) => count,
            JoinType::SomeDefault => self.workers.len(),
        }
    }

    /// Check the descriptor is consistent
    ///
    /// # Errors
    ///
    /// Returns error on empty worker list, duplicate or unknown names, or an
    /// unreachable join count
    pub fn validate(&self) -> CoreResult<()> {
        if self.workers.is_empty() {
            return Err(CoreError::Validation {
                field: "workers".to_string(),
                reason: "fork-join needs at least one worker".to_string(),
            });
        }
        let mut names = IndexSet::new();
        for worker in &self.workers {
            if !names.insert(worker.name()) {
                return Err(CoreError::Validation {
                    field: "workers".to_string(),
                    reason: format!("duplicate worker name '{}'", worker.name()),
                });
            }
        }
        for name in self.join_workers.iter().chain(self.channels.keys()) {
            if !names.contains(name.as_str()) {
                return Err(CoreError::NotFound {
                    kind: "Worker".to_string(),
                    id: name.clone(),
                });
            }
        }
        if self.arg_types.len() != self.arg_regs.len() {
            return Err(CoreError::ArityMismatch {
                expected: self.arg_types.len(),
                actual: self.arg_regs.len(),
            });
        }
        let join_size = self.join_set().len();
        let required = self.required_count();
        if required == 0 || required > join_size {
            return Err(CoreError::Validation {
                field: "join".to_string(),
                reason: format!("join count {} outside 1..={}", required, join_size),
            });
        }
        Ok(())
    }
}

/// Callables of one module
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    init: Option<Arc<CallableInfo>>,
    functions: IndexMap<String, Arc<CallableInfo>>,
}

impl Module {
    /// Create an empty module
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: None,
            functions: IndexMap::new(),
        }
    }

    /// Set the init routine
    #[must_use]
    pub fn with_init(mut self, init: CallableInfo) -> Self {
        self.init = Some(Arc::new(init));
        self
    }

    /// Add a function
    #[must_use]
    pub fn with_function(mut self, function: CallableInfo) -> Self {
        self.functions.insert(function.name().to_string(), Arc::new(function));
        self
    }

    /// Module name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Init routine
    #[must_use]
    pub fn init(&self) -> Option<&Arc<CallableInfo>> {
        self.init.as_ref()
    }

    /// Look up a function
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Arc<CallableInfo>> {
        self.functions.get(name)
    }
}

/// Loaded program
#[derive(Debug, Clone, Default)]
pub struct Program {
    modules: IndexMap<String, Arc<Module>>,
}

impl Program {
    /// Create an empty program
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module
    #[must_use]
    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.insert(module.name().to_string(), Arc::new(module));
        self
    }

    /// Look up a module
    ///
    /// # Errors
    ///
    /// Returns error if the module is not loaded
    pub fn module(&self, name: &str) -> CoreResult<&Arc<Module>> {
        self.modules.get(name).ok_or_else(|| CoreError::NotFound {
            kind: "Module".to_string(),
            id: name.to_string(),
        })
    }

    /// Look up a function by module and name
    ///
    /// # Errors
    ///
    /// Returns error if either is missing
    pub fn function(&self, module: &str, name: &str) -> CoreResult<&Arc<CallableInfo>> {
        self.module(module)?
            .function(name)
            .ok_or_else(|| CoreError::NotFound {
                kind: "Function".to_string(),
                id: format!("{}:{}", module, name),
            })
    }
}
