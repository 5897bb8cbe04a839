//! Host-facing runtime.
//!
//! Owns the scheduler for a loaded program and exposes the calls a host makes:
//! blocking and callback invocations, module and service init routines, the
//! program entry point, and the final drain.

use crate::aggregator::{AggregatorKind, CallOutcome, Waiter};
use crate::callable::{CallableInfo, Program};
use crate::config::RuntimeConfig;
use crate::context::{ExecutionContext, ExecutionHook};
use crate::error::{RuntimeError, RuntimeResult};
use crate::invoke::{self, Invocation};
use crate::monitor::MetricsSnapshot;
use crate::scheduler::Scheduler;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use weft_core::{CoreError, FrameShape, Value};

/// Execution engine for one program
pub struct Runtime {
    program: Arc<Program>,
    scheduler: Scheduler,
    initialized: Mutex<IndexSet<String>>,
}

impl Runtime {
    /// Start a runtime for `program`
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the pool cannot start
    pub fn new(program: Arc<Program>, config: RuntimeConfig) -> RuntimeResult<Self> {
        Ok(Self {
            program,
            scheduler: Scheduler::new(config)?,
            initialized: Mutex::new(IndexSet::new()),
        })
    }

    /// Install an execution hook
    #[must_use]
    pub fn with_hook(self, hook: Arc<dyn ExecutionHook>) -> Self {
        self.scheduler.set_hook(hook);
        self
    }

    /// Loaded program
    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Scheduler
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Counters so far
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.scheduler.metrics().snapshot()
    }

    /// Invoke `callable` and block until its workers join.
    ///
    /// One worker runs on the calling thread. A worker error comes back as
    /// `RuntimeError::Unhandled`.
    ///
    /// # Errors
    ///
    /// Returns error on bad arguments, worker error, or exhausted capacity
    pub fn invoke_blocking(&self, callable: &Arc<CallableInfo>, args: Vec<Value>) -> RuntimeResult<Vec<Value>> {
        let (shape, regs) = FrameShape::layout(callable.return_types());
        let root = ExecutionContext::root(self.program.clone(), &shape);
        let waiter = Arc::new(Waiter::new());
        let started = invoke::invoke_callable(
            &self.scheduler,
            Invocation {
                program: self.program.clone(),
                callable: callable.clone(),
                args,
                parent: None,
                target: root.clone(),
                kind: AggregatorKind::invocation(callable.return_types().to_vec(), regs.clone(), Some(waiter)),
                run_in_caller: true,
            },
        )?;
        if let Some(ctx) = started.inline {
            self.scheduler.execute_now(ctx);
        }
        if let Some(aggregator) = &started.aggregator {
            aggregator.wait();
        }

        let inner = root.lock();
        if let Some(error) = &inner.error {
            return Err(RuntimeError::Unhandled(error.clone()));
        }
        Ok(inner.frame.load_all(callable.return_types(), &regs)?)
    }

    /// Invoke `callable` without blocking; `callback` receives the outcome
    /// once its workers join. Every worker runs on the pool.
    ///
    /// # Errors
    ///
    /// Returns error on bad arguments or exhausted capacity; worker errors go
    /// to the callback
    pub fn invoke_with_callback<F>(&self, callable: &Arc<CallableInfo>, args: Vec<Value>, callback: F) -> RuntimeResult<()>
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        let (shape, regs) = FrameShape::layout(callable.return_types());
        let root = ExecutionContext::root(self.program.clone(), &shape);
        invoke::invoke_callable(
            &self.scheduler,
            Invocation {
                program: self.program.clone(),
                callable: callable.clone(),
                args,
                parent: None,
                target: root,
                kind: AggregatorKind::callback(callable.return_types().to_vec(), regs, callback),
                run_in_caller: false,
            },
        )?;
        Ok(())
    }

    /// Run the init routine of `module` unless it already ran
    ///
    /// # Errors
    ///
    /// Returns error if the module is unknown or its routine fails
    pub fn invoke_init_routine(&self, module: &str) -> RuntimeResult<()> {
        let init = self.program.module(module)?.init().cloned();
        if !self.initialized.lock().insert(module.to_string()) {
            debug!(module, "Module already initialized");
            return Ok(());
        }
        let Some(init) = init else {
            return Ok(());
        };
        info!(module, "Running module init routine");
        match self.invoke_blocking(&init, Vec::new()) {
            Ok(_) => Ok(()),
            Err(RuntimeError::Unhandled(error)) => Err(RuntimeError::InitRoutineFailed {
                module: module.to_string(),
                error,
            }),
            Err(other) => Err(other),
        }
    }

    /// Run a service's init callable
    ///
    /// # Errors
    ///
    /// Returns error if the callable fails
    pub fn invoke_service_init(&self, callable: &Arc<CallableInfo>) -> RuntimeResult<()> {
        info!(service = callable.name(), "Running service init");
        self.invoke_blocking(callable, Vec::new()).map(|_| ())
    }

    /// Run a program entry point: init its module, call it, then wait for
    /// every worker the program started
    ///
    /// # Errors
    ///
    /// Returns error if the function is unknown, the arguments do not match,
    /// the module init fails, or an error escapes the call
    pub fn invoke_entrypoint(&self, module: &str, function: &str, args: Vec<Value>) -> RuntimeResult<Vec<Value>> {
        let callable = self.program.function(module, function)?.clone();
        if callable.param_types().len() != args.len() {
            return Err(CoreError::ArityMismatch {
                expected: callable.param_types().len(),
                actual: args.len(),
            }
            .into());
        }
        self.invoke_init_routine(module)?;
        info!(module, function, "Invoking entry point");
        let results = self.invoke_blocking(&callable, args);
        if let Err(err) = &results {
            warn!(error = %err, "Entry point failed");
        }
        self.scheduler.wait_for_drain();
        results
    }

    /// Wait for every outstanding worker, then stop the pool
    pub fn drain_and_exit(self) {
        self.scheduler.wait_for_drain();
        let metrics = self.metrics();
        info!(
            completed = metrics.workers_completed,
            errored = metrics.workers_errored,
            success_rate = metrics.success_rate(),
            "Runtime drained"
        );
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::{DEFAULT_WORKER, ForkJoinInfo, JoinTargets, JoinType, Module, StepResult, WorkerInfo};
    use crate::context::{ContextState, Step, WorkerStep};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use weft_core::{StructuredError, ValueType};

    fn runtime(program: Program) -> Runtime {
        Runtime::new(Arc::new(program), RuntimeConfig::new().with_pool_size(8)).unwrap()
    }

    #[derive(Default)]
    struct CountingHook {
        executing: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ExecutionHook for CountingHook {
        fn worker_executing(&self, _ctx: &ExecutionContext) {
            self.executing.fetch_add(1, Ordering::SeqCst);
        }

        fn worker_finished(&self, _ctx: &ExecutionContext, _state: ContextState) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn returning(name: &str, index: usize, value: i64) -> WorkerInfo {
        WorkerInfo::new(name, FrameShape::empty(), move |step| {
            step.set_return(index, Value::Int(value));
            Ok(Step::Done)
        })
    }

    fn sleeping(name: &str, millis: u64, value: i64) -> WorkerInfo {
        WorkerInfo::new(name, FrameShape::empty(), move |step| {
            std::thread::sleep(Duration::from_millis(millis));
            step.set_return(0, Value::Int(value));
            Ok(Step::Done)
        })
    }

    fn three_ints() -> CallableInfo {
        CallableInfo::new("main", "f", WorkerInfo::noop(DEFAULT_WORKER))
            .with_returns([ValueType::Int, ValueType::Int, ValueType::Int])
    }

    #[test]
    fn test_blocking_all_workers_merge() {
        let rt = runtime(Program::new());
        let callable = Arc::new(
            three_ints()
                .with_worker(returning("w1", 0, 1))
                .with_worker(returning("w2", 1, 2))
                .with_worker(returning("w3", 2, 3)),
        );
        let results = rt.invoke_blocking(&callable, vec![]).unwrap();
        assert_eq!(results, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let metrics = rt.metrics();
        assert_eq!(metrics.workers_run_in_caller, 1);
        assert_eq!(metrics.workers_scheduled, 2);
        assert_eq!(metrics.joins_fired, 1);
    }

    #[test]
    fn test_parent_waits_for_slowest_worker() {
        let rt = runtime(Program::new());
        let callable = Arc::new(
            CallableInfo::new("main", "f", WorkerInfo::noop(DEFAULT_WORKER))
                .with_returns([ValueType::Int, ValueType::Int])
                .with_worker(returning("fast", 0, 1))
                .with_worker(WorkerInfo::new("slow", FrameShape::empty(), |step| {
                    std::thread::sleep(Duration::from_millis(50));
                    step.set_return(1, Value::Int(2));
                    Ok(Step::Done)
                })),
        );
        let results = rt.invoke_blocking(&callable, vec![]).unwrap();
        assert_eq!(results, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_worker_two_errors() {
        let rt = runtime(Program::new());
        let callable = Arc::new(
            three_ints()
                .with_worker(returning("w1", 0, 1))
                .with_worker(WorkerInfo::new("w2", FrameShape::empty(), |step| {
                    step.set_return(1, Value::Int(2));
                    Err(StructuredError::new("worker 2 failed"))
                }))
                .with_worker(returning("w3", 2, 3)),
        );
        let (shape, regs) = FrameShape::layout(callable.return_types());
        let root = ExecutionContext::root(rt.program().clone(), &shape);
        let waiter = Arc::new(Waiter::new());
        let started = invoke::invoke_callable(
            rt.scheduler(),
            Invocation {
                program: rt.program().clone(),
                callable: callable.clone(),
                args: vec![],
                parent: None,
                target: root.clone(),
                kind: AggregatorKind::invocation(callable.return_types().to_vec(), regs, Some(waiter.clone())),
                run_in_caller: true,
            },
        )
        .unwrap();
        if let Some(ctx) = started.inline {
            rt.scheduler().execute_now(ctx);
        }
        assert!(waiter.wait_timeout(Duration::from_secs(5)));
        assert!(rt.scheduler().wait_for_drain_timeout(Duration::from_secs(5)));

        let inner = root.lock();
        let error = inner.error.clone().unwrap();
        assert_eq!(error.message, "worker 2 failed");
        assert_eq!(error.trace[0].worker, "w2");
        assert_eq!(inner.frame.int(0), Some(1));
        assert_eq!(inner.frame.int(1), Some(0));
        assert_eq!(inner.frame.int(2), Some(3));
        drop(inner);
        assert_eq!(rt.metrics().joins_fired, 1);
        assert_eq!(rt.metrics().resumptions, 0);
    }

    #[test]
    fn test_blocking_error_is_unhandled() {
        let rt = runtime(Program::new());
        let callable = Arc::new(CallableInfo::new(
            "main",
            "f",
            WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |_| Err(StructuredError::new("boom"))),
        ));
        let err = rt.invoke_blocking(&callable, vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::Unhandled(ref e) if e.message == "boom"));
        assert!(err.to_string().contains("at main:f(default)"));
    }

    #[test]
    fn test_zero_and_one_explicit_worker_equivalent() {
        fn body(step: &mut WorkerStep<'_>) -> StepResult {
            let arg = step.frame().int(0).unwrap_or_default();
            step.set_return(0, Value::Int(arg * 2));
            Ok(Step::Done)
        }

        let rt = runtime(Program::new());
        let implicit = Arc::new(
            CallableInfo::new("main", "f", WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), body))
                .with_params([ValueType::Int])
                .with_returns([ValueType::Int]),
        );
        let explicit = Arc::new(
            CallableInfo::new("main", "g", WorkerInfo::noop(DEFAULT_WORKER))
                .with_params([ValueType::Int])
                .with_returns([ValueType::Int])
                .with_worker(WorkerInfo::new("w1", FrameShape::empty(), body)),
        );
        let a = rt.invoke_blocking(&implicit, vec![Value::Int(21)]).unwrap();
        let b = rt.invoke_blocking(&explicit, vec![Value::Int(21)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, vec![Value::Int(42)]);
    }

    #[test]
    fn test_init_error_runs_no_general_worker() {
        let hook = Arc::new(CountingHook::default());
        let rt = runtime(Program::new()).with_hook(hook.clone());
        let general_runs = Arc::new(AtomicUsize::new(0));
        let counter = general_runs.clone();
        let callable = Arc::new(
            CallableInfo::new(
                "main",
                "f",
                WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |_| Err(StructuredError::new("no locals"))),
            )
            .with_worker(WorkerInfo::new("w1", FrameShape::empty(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Step::Done)
            })),
        );
        let err = rt.invoke_blocking(&callable, vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::Unhandled(_)));
        assert_eq!(general_runs.load(Ordering::SeqCst), 0);
        assert_eq!(hook.executing.load(Ordering::SeqCst), 1);
        assert_eq!(rt.metrics().workers_scheduled, 0);
    }

    #[test]
    fn test_callback_invocation() {
        let rt = runtime(Program::new());
        let callable = Arc::new(
            CallableInfo::new("main", "f", WorkerInfo::noop(DEFAULT_WORKER))
                .with_returns([ValueType::Int])
                .with_worker(returning("w1", 0, 5)),
        );
        let (tx, rx) = std::sync::mpsc::channel();
        rt.invoke_with_callback(&callable, vec![], move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.results, vec![Value::Int(5)]);
        assert!(outcome.is_ok());
        assert_eq!(rt.metrics().workers_run_in_caller, 0);
    }

    #[test]
    fn test_callback_receives_init_error() {
        let rt = runtime(Program::new());
        let callable = Arc::new(
            CallableInfo::new(
                "main",
                "f",
                WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |_| Err(StructuredError::new("init"))),
            )
            .with_worker(WorkerInfo::noop("w1")),
        );
        let (tx, rx) = std::sync::mpsc::channel();
        rt.invoke_with_callback(&callable, vec![], move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.error.map(|e| e.message), Some("init".to_string()));
    }

    #[test]
    fn test_nested_invoke_merges_into_caller() {
        let rt = runtime(Program::new());
        let callee = Arc::new(
            CallableInfo::new("main", "add", WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |step| {
                let a = step.frame().int(0).unwrap_or_default();
                let b = step.frame().int(1).unwrap_or_default();
                step.set_return(0, Value::Int(a + b));
                Ok(Step::Done)
            }))
            .with_params([ValueType::Int, ValueType::Int])
            .with_returns([ValueType::Int]),
        );
        let shape = FrameShape::empty().with(ValueType::Int, 3);
        let caller = Arc::new(
            CallableInfo::new(
                "main",
                "main",
                WorkerInfo::new(DEFAULT_WORKER, shape, move |step| match step.ip() {
                    0 => {
                        step.frame_mut().store(0, Value::Int(2))?;
                        step.frame_mut().store(1, Value::Int(3))?;
                        step.jump(1);
                        step.invoke(&callee, &[0, 1], &[2])
                    }
                    _ => {
                        let sum = step.frame().int(2).unwrap_or_default();
                        step.set_return(0, Value::Int(sum * 10));
                        Ok(Step::Done)
                    }
                }),
            )
            .with_returns([ValueType::Int]),
        );
        let results = rt.invoke_blocking(&caller, vec![]).unwrap();
        assert_eq!(results, vec![Value::Int(50)]);
        let metrics = rt.metrics();
        assert_eq!(metrics.suspensions, 1);
        assert_eq!(metrics.resumptions, 1);
    }

    #[test]
    fn test_nested_error_propagates_with_trace() {
        let rt = runtime(Program::new());
        let callee = Arc::new(CallableInfo::new(
            "main",
            "inner",
            WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |_| Err(StructuredError::new("deep failure"))),
        ));
        let caller = Arc::new(CallableInfo::new(
            "main",
            "outer",
            WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), move |step| {
                step.jump(7);
                step.invoke(&callee, &[], &[])
            }),
        ));
        let err = rt.invoke_blocking(&caller, vec![]).unwrap_err();
        let error = err.structured().cloned().unwrap();
        assert_eq!(error.message, "deep failure");
        let callables: Vec<&str> = error.trace.iter().map(|f| f.callable.as_str()).collect();
        assert_eq!(callables, vec!["inner", "outer"]);
        assert_eq!(error.trace[1].ip, 7);
    }

    fn fork_caller(info: ForkJoinInfo, timeout_secs: Option<i64>) -> Arc<CallableInfo> {
        let shape = FrameShape::empty().with(ValueType::Int, 1).with(ValueType::Ref, 2);
        let info = match timeout_secs {
            Some(_) => info.with_timeout_reg(0),
            None => info,
        };
        Arc::new(
            CallableInfo::new(
                "main",
                "fork",
                WorkerInfo::new(DEFAULT_WORKER, shape, move |step| match step.ip() {
                    0 => {
                        if let Some(secs) = timeout_secs {
                            step.frame_mut().store(0, Value::Int(secs))?;
                        }
                        step.fork_join(
                            &info,
                            JoinTargets {
                                join_ip: 1,
                                join_reg: 0,
                                timeout_ip: 2,
                                timeout_reg: 1,
                            },
                        )
                    }
                    1 => {
                        let joined = step.frame().reference(0).cloned().unwrap_or(Value::Nil);
                        step.set_return(0, Value::from("joined"));
                        step.set_return(1, joined);
                        Ok(Step::Done)
                    }
                    _ => {
                        let partial = step.frame().reference(1).cloned().unwrap_or(Value::Nil);
                        step.set_return(0, Value::from("timeout"));
                        step.set_return(1, partial);
                        Ok(Step::Done)
                    }
                }),
            )
            .with_returns([ValueType::String, ValueType::Ref]),
        )
    }

    #[test]
    fn test_fork_join_all() {
        let rt = runtime(Program::new());
        let info = ForkJoinInfo::new(vec![sleeping("a", 5, 1), sleeping("b", 1, 2), sleeping("c", 10, 3)]);
        let results = rt.invoke_blocking(&fork_caller(info, None), vec![]).unwrap();
        assert_eq!(results[0], Value::from("joined"));
        let map = results[1].as_map().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("c"), Some(&Value::Array(vec![Value::Int(3)])));
    }

    #[test]
    fn test_fork_join_some_resumes_once() {
        let hook = Arc::new(CountingHook::default());
        let rt = runtime(Program::new()).with_hook(hook.clone());
        let info = ForkJoinInfo::new(vec![sleeping("a", 1, 1), sleeping("b", 80, 2), sleeping("c", 80, 3)])
            .with_join(JoinType::Some(1));
        let results = rt.invoke_blocking(&fork_caller(info, None), vec![]).unwrap();
        assert_eq!(results[0], Value::from("joined"));
        let map = results[1].as_map().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("a"));

        assert!(rt.scheduler().wait_for_drain_timeout(Duration::from_secs(5)));
        let metrics = rt.metrics();
        assert_eq!(metrics.joins_fired, 2);
        assert_eq!(metrics.resumptions, 1);
        assert_eq!(metrics.late_signals_discarded, 2);
        assert_eq!(hook.finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_fork_join_timeout_path() {
        let rt = runtime(Program::new());
        let info = ForkJoinInfo::new(vec![sleeping("fast", 1, 1), sleeping("slow", 2500, 2)]);
        let results = rt.invoke_blocking(&fork_caller(info, Some(1)), vec![]).unwrap();
        assert_eq!(results[0], Value::from("timeout"));
        let partial = results[1].as_map().unwrap();
        assert!(partial.contains_key("fast"));
        assert!(!partial.contains_key("slow"));

        assert!(rt.scheduler().wait_for_drain_timeout(Duration::from_secs(5)));
        let metrics = rt.metrics();
        assert_eq!(metrics.timeouts_fired, 1);
        assert_eq!(metrics.resumptions, 1);
        assert_eq!(metrics.late_signals_discarded, 1);
    }

    #[test]
    fn test_fork_join_timeout_with_saturated_pool() {
        let rt = Runtime::new(Arc::new(Program::new()), RuntimeConfig::new().with_pool_size(1)).unwrap();
        let info = ForkJoinInfo::new(vec![sleeping("fast", 1, 1), sleeping("slow", 2500, 2)]);
        let results = rt.invoke_blocking(&fork_caller(info, Some(1)), vec![]).unwrap();
        assert_eq!(results[0], Value::from("timeout"));
        assert!(!results[1].as_map().unwrap().contains_key("slow"));

        assert!(rt.scheduler().wait_for_drain_timeout(Duration::from_secs(5)));
        let metrics = rt.metrics();
        assert_eq!(metrics.timeouts_fired, 1);
        assert_eq!(metrics.joins_fired, 1);
    }

    #[test]
    fn test_fork_join_some_default_waits_for_every_worker() {
        let rt = runtime(Program::new());
        let info = ForkJoinInfo::new(vec![sleeping("a", 1, 1), sleeping("b", 30, 2), sleeping("c", 60, 3)])
            .with_join(JoinType::SomeDefault);
        let results = rt.invoke_blocking(&fork_caller(info, None), vec![]).unwrap();
        assert_eq!(results[0], Value::from("joined"));
        assert_eq!(results[1].as_map().unwrap().len(), 3);
        assert_eq!(rt.metrics().late_signals_discarded, 0);
    }

    #[test]
    fn test_fork_join_error_reaches_parent() {
        let rt = runtime(Program::new());
        let info = ForkJoinInfo::new(vec![
            sleeping("ok", 1, 1),
            WorkerInfo::new("bad", FrameShape::empty(), |_| Err(StructuredError::new("fork failed"))),
        ]);
        let err = rt.invoke_blocking(&fork_caller(info, None), vec![]).unwrap_err();
        assert_eq!(err.structured().map(|e| e.message.as_str()), Some("fork failed"));
    }

    #[test]
    fn test_fork_join_shares_properties() {
        let rt = runtime(Program::new());
        let writer = WorkerInfo::new("writer", FrameShape::empty(), |step| {
            step.properties().insert("seen", Value::Boolean(true));
            Ok(Step::Done)
        });
        let info = ForkJoinInfo::new(vec![writer]);
        let shape = FrameShape::empty().with(ValueType::Ref, 1);
        let caller = Arc::new(
            CallableInfo::new(
                "main",
                "props",
                WorkerInfo::new(DEFAULT_WORKER, shape, move |step| match step.ip() {
                    0 => step.fork_join(
                        &info,
                        JoinTargets {
                            join_ip: 1,
                            join_reg: 0,
                            timeout_ip: 1,
                            timeout_reg: 0,
                        },
                    ),
                    _ => {
                        let seen = step.properties().get("seen").unwrap_or(Value::Boolean(false));
                        step.set_return(0, seen);
                        Ok(Step::Done)
                    }
                }),
            )
            .with_returns([ValueType::Boolean]),
        );
        assert_eq!(rt.invoke_blocking(&caller, vec![]).unwrap(), vec![Value::Boolean(true)]);
    }

    #[test]
    fn test_init_routine_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let init = CallableInfo::new(
            "main",
            "<init>",
            WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Step::Done)
            }),
        );
        let rt = runtime(Program::new().with_module(Module::new("main").with_init(init)));
        rt.invoke_init_routine("main").unwrap();
        rt.invoke_init_routine("main").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(rt.invoke_init_routine("missing").is_err());
    }

    #[test]
    fn test_init_routine_failure() {
        let init = CallableInfo::new(
            "svc",
            "<init>",
            WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |_| Err(StructuredError::new("db down"))),
        );
        let rt = runtime(Program::new().with_module(Module::new("svc").with_init(init)));
        let err = rt.invoke_init_routine("svc").unwrap_err();
        assert!(matches!(err, RuntimeError::InitRoutineFailed { ref module, .. } if module == "svc"));
    }

    #[test]
    fn test_service_init() {
        let rt = runtime(Program::new());
        let ok = Arc::new(CallableInfo::new("svc", "init", WorkerInfo::noop(DEFAULT_WORKER)));
        assert!(rt.invoke_service_init(&ok).is_ok());
        let failing = Arc::new(CallableInfo::new(
            "svc",
            "init",
            WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |_| Err(StructuredError::new("refused"))),
        ));
        assert!(matches!(rt.invoke_service_init(&failing), Err(RuntimeError::Unhandled(_))));
    }

    #[test]
    fn test_entrypoint() {
        let main = CallableInfo::new("app", "main", WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |step| {
            let n = step.frame().int(0).unwrap_or_default();
            step.set_return(0, Value::Int(n + 1));
            Ok(Step::Done)
        }))
        .with_params([ValueType::Int])
        .with_returns([ValueType::Int]);
        let rt = runtime(Program::new().with_module(Module::new("app").with_function(main)));

        assert_eq!(rt.invoke_entrypoint("app", "main", vec![Value::Int(1)]).unwrap(), vec![Value::Int(2)]);
        assert!(matches!(
            rt.invoke_entrypoint("app", "main", vec![]),
            Err(RuntimeError::Core(CoreError::ArityMismatch { expected: 1, actual: 0 }))
        ));
        assert!(matches!(
            rt.invoke_entrypoint("app", "nope", vec![]),
            Err(RuntimeError::Core(CoreError::NotFound { .. }))
        ));
        assert_eq!(rt.scheduler().outstanding(), 0);
        rt.drain_and_exit();
    }
}
