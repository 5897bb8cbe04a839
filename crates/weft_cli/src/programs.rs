//! Built-in demonstration programs.

use std::sync::Arc;
use std::time::Duration;
use weft_core::{FrameShape, StructuredError, Value, ValueType};
use weft_runtime::{
    CallableInfo, DEFAULT_WORKER, ForkJoinInfo, JoinTargets, JoinType, Module, Program, Step, StepResult, WorkerInfo,
    WorkerStep,
};

/// Module holding the demo entry point
pub const DEMO_MODULE: &str = "demo";

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

/// `delay * (index + 1)`, saturating
fn stagger(delay: Duration, index: usize) -> Duration {
    let factor = u32::try_from(index.saturating_add(1)).unwrap_or(u32::MAX);
    delay.saturating_mul(factor)
}

/// Callable with `workers` explicit workers; worker `i` returns `i * i` into
/// return slot `i` after sleeping `delay * (i + 1)`. Worker `fail` errors.
pub fn fan_out(workers: usize, fail: Option<usize>, delay: Duration) -> Arc<CallableInfo> {
    let mut callable = CallableInfo::new(DEMO_MODULE, "fan_out", WorkerInfo::noop(DEFAULT_WORKER))
        .with_returns(vec![ValueType::Int; workers]);
    for i in 0..workers {
        let failing = fail == Some(i);
        callable = callable.with_worker(WorkerInfo::new(format!("w{}", i), FrameShape::empty(), move |step| {
            pause(stagger(delay, i));
            if failing {
                return Err(StructuredError::new(format!("worker w{} failed", i)));
            }
            step.set_return(i, Value::Int((i * i) as i64));
            Ok(Step::Done)
        }));
    }
    Arc::new(callable)
}

/// Callable that forks `workers` workers and returns which path resumed it
/// together with the collected results
pub fn fork_join(workers: usize, join: JoinType, timeout_secs: Option<i64>, delay: Duration) -> Arc<CallableInfo> {
    let forked = (0..workers)
        .map(|i| {
            WorkerInfo::new(format!("f{}", i), FrameShape::empty(), move |step| {
                pause(stagger(delay, i));
                step.set_return(0, Value::Int(i as i64));
                Ok(Step::Done)
            })
        })
        .collect();
    let mut info = ForkJoinInfo::new(forked).with_join(join);
    if timeout_secs.is_some() {
        info = info.with_timeout_reg(0);
    }
    let targets = JoinTargets {
        join_ip: 1,
        join_reg: 0,
        timeout_ip: 2,
        timeout_reg: 1,
    };
    let shape = FrameShape::empty().with(ValueType::Int, 1).with(ValueType::Ref, 2);
    let body = WorkerInfo::new(DEFAULT_WORKER, shape, move |step| match step.ip() {
        0 => {
            if let Some(secs) = timeout_secs {
                step.frame_mut().store(0, Value::Int(secs))?;
            }
            step.fork_join(&info, targets)
        }
        1 => finish(step, "joined", 0),
        _ => finish(step, "timeout", 1),
    });
    Arc::new(
        CallableInfo::new(DEMO_MODULE, "fork_join", body).with_returns([ValueType::String, ValueType::Ref]),
    )
}

fn finish(step: &mut WorkerStep<'_>, path: &str, reg: usize) -> StepResult {
    let collected = step.frame().reference(reg).cloned().unwrap_or(Value::Nil);
    step.set_return(0, Value::from(path));
    step.set_return(1, collected);
    Ok(Step::Done)
}

/// Program whose `main(n)` calls `square(n)` and adds one
pub fn demo_program() -> Program {
    let square = Arc::new(
        CallableInfo::new(
            DEMO_MODULE,
            "square",
            WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |step| {
                let n = step.frame().int(0).unwrap_or_default();
                step.set_return(0, Value::Int(n * n));
                Ok(Step::Done)
            }),
        )
        .with_params([ValueType::Int])
        .with_returns([ValueType::Int]),
    );

    let callee = square.clone();
    let main = CallableInfo::new(
        DEMO_MODULE,
        "main",
        WorkerInfo::new(
            DEFAULT_WORKER,
            FrameShape::empty().with(ValueType::Int, 2),
            move |step| match step.ip() {
                0 => {
                    step.jump(1);
                    step.invoke(&callee, &[0], &[1])
                }
                _ => {
                    let squared = step.frame().int(1).unwrap_or_default();
                    step.set_return(0, Value::Int(squared + 1));
                    Ok(Step::Done)
                }
            },
        ),
    )
    .with_params([ValueType::Int])
    .with_returns([ValueType::Int]);

    let init = CallableInfo::new(
        DEMO_MODULE,
        "<init>",
        WorkerInfo::new(DEFAULT_WORKER, FrameShape::empty(), |step| {
            tracing::info!(worker = step.worker_name(), "Demo module initialized");
            Ok(Step::Done)
        }),
    );

    Program::new().with_module(
        Module::new(DEMO_MODULE)
            .with_init(init)
            .with_function(main)
            .with_function((*square).clone()),
    )
}
