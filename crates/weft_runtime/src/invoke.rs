//! Invocation orchestration.
//!
//! Decomposes a callable into its worker set, runs the init worker, wires one
//! aggregator for the general workers and hands them to the scheduler. The
//! same path serves host calls and calls made from a running worker.

use crate::aggregator::{AggregatorKind, CallOutcome, ResponseAggregator};
use crate::callable::{CallableInfo, ForkJoinInfo, JoinTargets, Program, WorkerInfo};
use crate::context::{ContextInner, ContextRef, ContextState, ExecutionContext, PropertyBag, WorkerSpec};
use crate::error::{RuntimeError, RuntimeResult};
use crate::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use weft_core::{CoreError, FrameShape, InvocationId, RegisterFrame, StructuredError, Value};

/// One call of a callable
pub(crate) struct Invocation {
    pub program: Arc<Program>,
    pub callable: Arc<CallableInfo>,
    pub args: Vec<Value>,
    pub parent: Option<ContextRef>,
    pub target: ContextRef,
    pub kind: AggregatorKind,
    pub run_in_caller: bool,
}

/// Handles to a started invocation
#[derive(Debug, Default)]
pub(crate) struct Started {
    /// Aggregator of the general workers; `None` if the invocation ended early
    pub aggregator: Option<Arc<ResponseAggregator>>,
    /// Worker the caller must run itself
    pub inline: Option<ContextRef>,
}

/// Start the workers of `invocation`.
///
/// An init worker runs to completion first on the calling thread. If it fails
/// no general worker is created: a callback receives the error, any other
/// caller gets `RuntimeError::Unhandled`.
pub(crate) fn invoke_callable(scheduler: &Scheduler, invocation: Invocation) -> RuntimeResult<Started> {
    let Invocation {
        program,
        callable,
        args,
        parent,
        target,
        kind,
        run_in_caller,
    } = invocation;

    let mut arg_frame = RegisterFrame::default();
    arg_frame.load_args(callable.param_types(), &args)?;

    let id = InvocationId::new();
    let set = callable.worker_set();
    let properties = Arc::new(PropertyBag::new());
    debug!(
        invocation = %id,
        callable = callable.name(),
        workers = set.general.len(),
        init = set.init.is_some(),
        "Invoking callable"
    );

    let mut seed = None;
    if let Some(init) = &set.init {
        let ctx = ExecutionContext::worker(WorkerSpec {
            invocation: id,
            program: program.clone(),
            callable: callable.clone(),
            worker: init.clone(),
            parent: parent.clone(),
            aggregator: Arc::new(ResponseAggregator::new(
                id,
                AggregatorKind::InitWorker,
                1,
                1,
                None,
                scheduler.clone(),
            )),
            properties: properties.clone(),
            frame: worker_frame(init, &arg_frame, None),
            run_in_caller: true,
            init: true,
        });
        match run_init_worker(scheduler, ctx) {
            Ok(frame) => seed = Some((frame, *init.shape())),
            Err(RuntimeError::Unhandled(error)) => {
                warn!(invocation = %id, error = %error, "Init worker failed; invocation aborted");
                if let Some(callback) = kind.into_callback() {
                    callback(CallOutcome::failed(error));
                    return Ok(Started::default());
                }
                return Err(RuntimeError::Unhandled(error));
            }
            Err(other) => return Err(other),
        }
    }

    let count = set.general.len();
    scheduler.reserve(count)?;
    let aggregator = Arc::new(ResponseAggregator::new(
        id,
        kind,
        count,
        count,
        Some(target),
        scheduler.clone(),
    ));
    let contexts = set
        .general
        .iter()
        .enumerate()
        .map(|(i, worker)| {
            ExecutionContext::worker(WorkerSpec {
                invocation: id,
                program: program.clone(),
                callable: callable.clone(),
                worker: worker.clone(),
                parent: parent.clone(),
                aggregator: aggregator.clone(),
                properties: properties.clone(),
                frame: worker_frame(worker, &arg_frame, seed.as_ref().map(|(frame, shape)| (frame, shape))),
                run_in_caller: run_in_caller && i == 0,
                init: false,
            })
        })
        .collect();

    Ok(Started {
        aggregator: Some(aggregator),
        inline: dispatch(scheduler, contexts, run_in_caller),
    })
}

fn run_init_worker(scheduler: &Scheduler, ctx: ContextRef) -> RuntimeResult<RegisterFrame> {
    scheduler.reserve(1)?;
    scheduler.execute_now(ctx.clone());
    let inner = ctx.lock();
    match inner.state {
        ContextState::Completed => Ok(inner.frame.clone()),
        state => Err(RuntimeError::Unhandled(inner.error.clone().unwrap_or_else(|| {
            StructuredError::new(format!("init worker ended {}", state))
        }))),
    }
}

/// Call `callee` on behalf of the running `parent`, reading arguments from
/// `arg_regs` and merging results into `ret_regs` of the parent frame
pub(crate) fn invoke_nested(
    scheduler: &Scheduler,
    parent: &ContextRef,
    inner: &ContextInner,
    callee: &Arc<CallableInfo>,
    arg_regs: &[usize],
    ret_regs: &[usize],
) -> RuntimeResult<Option<ContextRef>> {
    let args = inner.frame.load_all(callee.param_types(), arg_regs)?;
    if ret_regs.len() != callee.return_types().len() {
        return Err(CoreError::ArityMismatch {
            expected: callee.return_types().len(),
            actual: ret_regs.len(),
        }
        .into());
    }
    let started = invoke_callable(
        scheduler,
        Invocation {
            program: parent.program().clone(),
            callable: callee.clone(),
            args,
            parent: Some(parent.clone()),
            target: parent.clone(),
            kind: AggregatorKind::invocation(callee.return_types().to_vec(), ret_regs.to_vec(), None),
            run_in_caller: true,
        },
    )?;
    Ok(started.inline)
}

/// Start the workers of a fork-join on behalf of the running `parent`.
///
/// The timeout is armed before any worker starts. The first worker is
/// returned to run inline once the parent has suspended.
pub(crate) fn invoke_fork_join(
    scheduler: &Scheduler,
    parent: &ContextRef,
    inner: &ContextInner,
    info: &ForkJoinInfo,
    targets: JoinTargets,
) -> RuntimeResult<Option<ContextRef>> {
    info.validate()?;
    let callable = parent.callable().cloned().ok_or_else(|| CoreError::InvalidState {
        reason: "fork-join outside a callable".to_string(),
    })?;
    let args = inner.frame.load_all(info.arg_types(), info.arg_regs())?;
    let mut arg_frame = RegisterFrame::default();
    arg_frame.load_args(info.arg_types(), &args)?;
    let timeout = info
        .timeout_reg()
        .map(|reg| read_timeout(&inner.frame, reg))
        .transpose()?;

    let count = info.workers().len();
    scheduler.reserve(count)?;
    let id = parent.invocation();
    let aggregator = Arc::new(ResponseAggregator::new(
        id,
        AggregatorKind::fork_join(info, targets),
        count,
        info.required_count(),
        Some(parent.clone()),
        scheduler.clone(),
    ));
    debug!(
        invocation = %id,
        workers = count,
        required = info.required_count(),
        timeout_ms = timeout.map(|t| t.as_millis() as u64),
        "Fork-join started"
    );

    if let Some(delay) = timeout {
        let on_timeout = aggregator.clone();
        let handle = scheduler.timers().schedule(delay, move || on_timeout.on_timeout());
        aggregator.set_timeout(handle);
    }

    let contexts = info
        .workers()
        .iter()
        .enumerate()
        .map(|(i, worker)| {
            ExecutionContext::worker(WorkerSpec {
                invocation: id,
                program: parent.program().clone(),
                callable: callable.clone(),
                worker: worker.clone(),
                parent: Some(parent.clone()),
                aggregator: aggregator.clone(),
                properties: parent.properties().clone(),
                frame: worker_frame(worker, &arg_frame, None),
                run_in_caller: i == 0,
                init: false,
            })
        })
        .collect();
    Ok(dispatch(scheduler, contexts, true))
}

fn read_timeout(frame: &RegisterFrame, reg: usize) -> Result<Duration, CoreError> {
    let secs = frame.int(reg).ok_or_else(|| CoreError::RegisterOutOfRange {
        bank: "int".to_string(),
        index: reg,
        len: frame.shape().ints,
    })?;
    Ok(Duration::from_millis((secs.max(0) as u64).saturating_mul(1000)))
}

fn worker_frame(
    worker: &WorkerInfo,
    args: &RegisterFrame,
    seed: Option<(&RegisterFrame, &FrameShape)>,
) -> RegisterFrame {
    let mut frame = RegisterFrame::with_shape(worker.shape());
    frame.merge_prefix(args, &args.shape());
    if let Some((locals, shape)) = seed {
        frame.merge_prefix(locals, shape);
    }
    frame
}

fn dispatch(scheduler: &Scheduler, contexts: Vec<ContextRef>, run_in_caller: bool) -> Option<ContextRef> {
    let mut contexts = contexts.into_iter();
    let inline = if run_in_caller { contexts.next() } else { None };
    for ctx in contexts {
        scheduler.schedule(ctx);
    }
    if inline.is_some() {
        scheduler.metrics().record_run_in_caller();
    }
    inline
}

/// Error value a worker sees when a call it made cannot start
pub(crate) fn into_structured(err: RuntimeError) -> StructuredError {
    match err {
        RuntimeError::Unhandled(error) | RuntimeError::InitRoutineFailed { error, .. } => error,
        RuntimeError::Core(core) => core.into(),
        RuntimeError::CapacityExhausted { outstanding, limit } => {
            let details = [
                ("outstanding".to_string(), Value::Int(outstanding as i64)),
                ("limit".to_string(), Value::Int(limit as i64)),
            ];
            StructuredError::new(format!(
                "worker capacity exhausted: {} outstanding, limit {}",
                outstanding, limit
            ))
            .with_details(Value::Map(details.into_iter().collect()))
        }
        other => StructuredError::new(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Waiter;
    use crate::callable::DEFAULT_WORKER;
    use crate::config::RuntimeConfig;
    use crate::context::Step;
    use weft_core::ValueType;

    fn scheduler() -> Scheduler {
        Scheduler::new(RuntimeConfig::new().with_pool_size(4)).unwrap()
    }

    fn call(
        scheduler: &Scheduler,
        callable: CallableInfo,
        args: Vec<Value>,
        run_in_caller: bool,
    ) -> (RuntimeResult<Started>, ContextRef, Arc<Waiter>) {
        let callable = Arc::new(callable);
        let (shape, regs) = FrameShape::layout(callable.return_types());
        let program = Arc::new(Program::new());
        let target = ExecutionContext::root(program.clone(), &shape);
        let waiter = Arc::new(Waiter::new());
        let started = invoke_callable(
            scheduler,
            Invocation {
                program,
                callable: callable.clone(),
                args,
                parent: None,
                target: target.clone(),
                kind: AggregatorKind::invocation(callable.return_types().to_vec(), regs, Some(waiter.clone())),
                run_in_caller,
            },
        );
        (started, target, waiter)
    }

    #[test]
    fn test_init_locals_seed_general_workers() {
        let scheduler = scheduler();
        let locals = FrameShape::empty().with(ValueType::Int, 2);
        let init = WorkerInfo::new(DEFAULT_WORKER, locals, |step| {
            let arg = step.frame().int(0).unwrap_or_default();
            step.frame_mut().store(1, Value::Int(arg * 10))?;
            Ok(Step::Done)
        });
        let worker = WorkerInfo::new("w1", locals, |step| {
            let seeded = step.frame().int(1).unwrap_or_default();
            step.set_return(0, Value::Int(seeded + 1));
            Ok(Step::Done)
        });
        let callable = CallableInfo::new("m", "f", init)
            .with_params([ValueType::Int])
            .with_returns([ValueType::Int])
            .with_worker(worker);

        let (started, target, waiter) = call(&scheduler, callable, vec![Value::Int(4)], true);
        let started = started.unwrap();
        assert!(started.inline.is_some());
        scheduler.execute_now(started.inline.unwrap());
        assert!(waiter.wait_timeout(Duration::from_secs(5)));
        assert_eq!(target.frame_snapshot().int(0), Some(41));
    }

    #[test]
    fn test_init_error_aborts_before_general_workers() {
        let scheduler = scheduler();
        let init = WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |_| Err(StructuredError::new("init failed")));
        let callable = CallableInfo::new("m", "f", init).with_worker(WorkerInfo::noop("w1"));

        let (started, _, _) = call(&scheduler, callable, vec![], true);
        match started {
            Err(RuntimeError::Unhandled(error)) => assert_eq!(error.message, "init failed"),
            other => panic!("unexpected {:?}", other.map(|s| s.inline.is_some())),
        }
        assert_eq!(scheduler.metrics().snapshot().steps_executed, 1);
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[test]
    fn test_init_worker_cannot_spawn() {
        let scheduler = scheduler();
        let callee = Arc::new(CallableInfo::new("m", "g", WorkerInfo::noop(DEFAULT_WORKER)));
        let init = WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), move |step| step.invoke(&callee, &[], &[]));
        let callable = CallableInfo::new("m", "f", init).with_worker(WorkerInfo::noop("w1"));
        let (started, _, _) = call(&scheduler, callable, vec![], true);
        assert!(matches!(started, Err(RuntimeError::Unhandled(_))));
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let scheduler = scheduler();
        let callable = CallableInfo::new("m", "f", WorkerInfo::noop(DEFAULT_WORKER)).with_params([ValueType::Int]);
        let (started, _, _) = call(&scheduler, callable, vec![], true);
        assert!(matches!(
            started,
            Err(RuntimeError::Core(CoreError::ArityMismatch { expected: 1, actual: 0 }))
        ));
    }

    #[test]
    fn test_nested_return_arity_rejected() {
        let scheduler = scheduler();
        let parent = ExecutionContext::root(Arc::new(Program::new()), &FrameShape::empty());
        let callee = Arc::new(
            CallableInfo::new("m", "g", WorkerInfo::noop(DEFAULT_WORKER)).with_returns([ValueType::Int]),
        );
        let inner = parent.lock();
        let started = invoke_nested(&scheduler, &parent, &inner, &callee, &[], &[]);
        assert!(matches!(
            started,
            Err(RuntimeError::Core(CoreError::ArityMismatch { expected: 1, actual: 0 }))
        ));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[test]
    fn test_without_run_in_caller_everything_is_scheduled() {
        let scheduler = scheduler();
        let callable = CallableInfo::new("m", "f", WorkerInfo::noop(DEFAULT_WORKER))
            .with_worker(WorkerInfo::noop("a"))
            .with_worker(WorkerInfo::noop("b"));
        let (started, _, waiter) = call(&scheduler, callable, vec![], false);
        assert!(started.unwrap().inline.is_none());
        assert!(waiter.wait_timeout(Duration::from_secs(5)));
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.workers_scheduled, 2);
        assert_eq!(snapshot.workers_run_in_caller, 0);
    }

    #[test]
    fn test_capacity_exhausted() {
        let scheduler = Scheduler::new(RuntimeConfig::new().with_max_outstanding_workers(1)).unwrap();
        let callable = CallableInfo::new("m", "f", WorkerInfo::noop(DEFAULT_WORKER))
            .with_worker(WorkerInfo::noop("a"))
            .with_worker(WorkerInfo::noop("b"));
        let (started, _, _) = call(&scheduler, callable, vec![], true);
        assert!(matches!(started, Err(RuntimeError::CapacityExhausted { limit: 1, .. })));
    }

    #[test]
    fn test_read_timeout() {
        let mut frame = RegisterFrame::with_shape(&FrameShape::empty().with(ValueType::Int, 1));
        frame.store(0, Value::Int(2)).unwrap();
        assert_eq!(read_timeout(&frame, 0).unwrap(), Duration::from_secs(2));
        frame.store(0, Value::Int(i64::MAX)).unwrap();
        assert_eq!(read_timeout(&frame, 0).unwrap(), Duration::from_millis(u64::MAX));
        frame.store(0, Value::Int(-5)).unwrap();
        assert_eq!(read_timeout(&frame, 0).unwrap(), Duration::ZERO);
        assert!(read_timeout(&frame, 3).is_err());
    }

    #[test]
    fn test_into_structured() {
        let err = into_structured(RuntimeError::Unhandled(StructuredError::new("x")));
        assert_eq!(err.message, "x");
        let err = into_structured(RuntimeError::CapacityExhausted { outstanding: 3, limit: 4 });
        assert!(err.message.contains("capacity"));
        let details = err.details.as_deref().and_then(Value::as_map).unwrap();
        assert_eq!(details.get("limit"), Some(&Value::Int(4)));
    }
}
