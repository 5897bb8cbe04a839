//! Worker scheduler.
//!
//! Workers run on the blocking thread pool of an owned tokio runtime; the
//! runtime's async threads only drive timers. A suspended context holds no
//! thread: it is dispatched again when its aggregator fires.
//!
//! Every worker context is counted from creation until it reaches a terminal
//! state. The count bounds how many workers may be alive at once and backs the
//! program drain barrier.

use crate::aggregator::WorkerSignal;
use crate::config::RuntimeConfig;
use crate::context::{ContextInner, ContextRef, ContextState, ExecutionContext, ExecutionHook, Step, WorkerStep};
use crate::error::{RuntimeError, RuntimeResult};
use crate::monitor::RuntimeMetrics;
use crate::timer::TimeoutService;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};
use weft_core::{StructuredError, Value};

struct SchedulerShared {
    config: RuntimeConfig,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    handle: Handle,
    timers: TimeoutService,
    metrics: RuntimeMetrics,
    hook: RwLock<Option<Arc<dyn ExecutionHook>>>,
    outstanding: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
    shut_down: AtomicBool,
}

impl Drop for SchedulerShared {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// Cloneable handle to the worker pool
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Start the pool
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the threads cannot start
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.timer_threads)
            .max_blocking_threads(config.pool_size)
            .thread_name(config.thread_name.clone())
            .thread_keep_alive(Duration::from_millis(config.keep_alive_ms))
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        info!(
            pool_size = config.pool_size,
            max_outstanding = config.max_outstanding_workers,
            "Scheduler started"
        );
        Ok(Self {
            shared: Arc::new(SchedulerShared {
                timers: TimeoutService::new(handle.clone()),
                handle,
                runtime: Mutex::new(Some(runtime)),
                config,
                metrics: RuntimeMetrics::new(),
                hook: RwLock::new(None),
                outstanding: AtomicUsize::new(0),
                drain_lock: Mutex::new(()),
                drained: Condvar::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Live counters
    #[must_use]
    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.shared.metrics
    }

    /// Timer facility
    #[must_use]
    pub fn timers(&self) -> &TimeoutService {
        &self.shared.timers
    }

    /// Install an execution hook
    pub fn set_hook(&self, hook: Arc<dyn ExecutionHook>) {
        *self.shared.hook.write() = Some(hook);
    }

    /// Workers created and not yet finished
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Whether the pool was shut down
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Account for `count` new workers
    ///
    /// # Errors
    ///
    /// Returns `CapacityExhausted` if the limit would be exceeded, or
    /// `ShutDown` after shutdown
    pub fn reserve(&self, count: usize) -> RuntimeResult<()> {
        if self.is_shut_down() {
            return Err(RuntimeError::ShutDown);
        }
        let limit = self.shared.config.max_outstanding_workers;
        let mut current = self.shared.outstanding.load(Ordering::Acquire);
        loop {
            if current + count > limit {
                error!(outstanding = current, requested = count, limit, "Worker capacity exhausted");
                return Err(RuntimeError::CapacityExhausted {
                    outstanding: current,
                    limit,
                });
            }
            match self.shared.outstanding.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, count: usize) {
        let previous = self.shared.outstanding.fetch_sub(count, Ordering::AcqRel);
        if previous == count {
            let _guard = self.shared.drain_lock.lock();
            self.shared.drained.notify_all();
        }
    }

    /// Hand a ready context to the pool; returns the same handle
    pub fn schedule(&self, ctx: ContextRef) -> ContextRef {
        ctx.lock().state = ContextState::Scheduled;
        self.metrics().record_scheduled();
        trace!(context = %ctx.id(), worker = ctx.worker_name(), "Worker scheduled");
        self.dispatch(ctx.clone());
        ctx
    }

    /// Dispatch a context whose children fired its continuation
    pub fn resume(&self, ctx: ContextRef) {
        self.metrics().record_resumption();
        debug!(context = %ctx.id(), worker = ctx.worker_name(), "Worker resumed");
        self.dispatch(ctx);
    }

    fn dispatch(&self, ctx: ContextRef) {
        if self.is_shut_down() {
            warn!(context = %ctx.id(), "Scheduler shut down; worker dropped");
            self.abandon(&ctx);
            return;
        }
        let task = Dispatched {
            scheduler: self.clone(),
            ctx: Some(ctx),
        };
        self.shared.handle.spawn_blocking(move || task.run());
    }

    /// Fail a context that will never run and signal its aggregator
    fn abandon(&self, ctx: &ExecutionContext) {
        let error = {
            let mut inner = ctx.lock();
            if inner.state.is_terminal() {
                return;
            }
            let mut error = StructuredError::new("scheduler shut down");
            error.push_frame(ctx.trace_frame(inner.ip));
            inner.set_error(error.clone());
            inner.state = ContextState::Errored;
            error
        };
        self.finish(ctx, ContextState::Errored, Err(error));
    }

    /// Run a context on the calling thread, then any context it hands back
    /// to run inline
    pub fn execute_now(&self, ctx: ContextRef) {
        let mut next = Some(ctx);
        while let Some(ctx) = next.take() {
            next = self.run_step(&ctx);
        }
    }

    /// Record that a context waits for its children; its thread is released
    /// when the current step returns
    pub fn mark_waiting_for_response(&self, ctx: &ExecutionContext, inner: &mut ContextInner) {
        inner.state = ContextState::Suspended;
        self.metrics().record_suspension();
        debug!(context = %ctx.id(), worker = ctx.worker_name(), ip = inner.ip, "Worker suspended");
    }

    fn run_step(&self, ctx: &ContextRef) -> Option<ContextRef> {
        let worker = ctx.worker_info()?.clone();
        {
            let mut inner = ctx.lock();
            if !inner.state.is_runnable() {
                warn!(context = %ctx.id(), state = %inner.state, "Context not runnable");
                return None;
            }
            inner.state = ContextState::Running;
        }
        self.metrics().record_step();
        if let Some(hook) = self.hook() {
            hook.worker_executing(ctx);
        }
        trace!(context = %ctx.id(), worker = worker.name(), "Worker running");

        let mut inner = ctx.lock();
        let (result, inline) = match inner.error.clone() {
            Some(error) => (Err(error), None),
            None => {
                let mut step = WorkerStep::new(self, ctx, &mut inner);
                let result = worker.body().run(&mut step);
                let (awaiting, inline) = step.finish();
                (check_step(result, awaiting), inline)
            }
        };

        match result {
            Ok(Step::Await) => {
                self.mark_waiting_for_response(ctx, &mut inner);
            }
            Ok(Step::Done) => {
                inner.state = ContextState::Completed;
                let returns = std::mem::take(&mut inner.returns);
                drop(inner);
                self.finish(ctx, ContextState::Completed, Ok(returns));
            }
            Err(mut error) => {
                error.push_frame(ctx.trace_frame(inner.ip));
                inner.set_error(error.clone());
                inner.state = ContextState::Errored;
                drop(inner);
                self.finish(ctx, ContextState::Errored, Err(error));
            }
        }
        inline
    }

    fn finish(&self, ctx: &ExecutionContext, state: ContextState, outcome: Result<Vec<Option<Value>>, StructuredError>) {
        match &outcome {
            Ok(_) => {
                self.metrics().record_completion();
                debug!(context = %ctx.id(), worker = ctx.worker_name(), "Worker completed");
            }
            Err(e) => {
                self.metrics().record_failure();
                debug!(context = %ctx.id(), worker = ctx.worker_name(), error = %e, "Worker errored");
            }
        }
        if let Some(hook) = self.hook() {
            hook.worker_finished(ctx, state);
        }
        if let Some(aggregator) = ctx.aggregator() {
            aggregator.signal(WorkerSignal {
                worker: ctx.worker_name().to_string(),
                outcome,
            });
        }
        self.release(1);
    }

    fn hook(&self) -> Option<Arc<dyn ExecutionHook>> {
        self.shared.hook.read().clone()
    }

    /// Block until every outstanding worker has finished
    pub fn wait_for_drain(&self) {
        let mut guard = self.shared.drain_lock.lock();
        while self.outstanding() > 0 {
            self.shared.drained.wait(&mut guard);
        }
        debug!("Program drained");
    }

    /// Like `wait_for_drain` with a deadline; returns whether drained
    pub fn wait_for_drain_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.shared.drain_lock.lock();
        let _ = self
            .shared
            .drained
            .wait_while_for(&mut guard, |_| self.outstanding() > 0, timeout);
        self.outstanding() == 0
    }

    /// Stop the pool without waiting for running workers
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.shared.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("Scheduler shut down");
    }
}

/// Context handed to the pool; abandoned if the pool drops it unrun
struct Dispatched {
    scheduler: Scheduler,
    ctx: Option<ContextRef>,
}

impl Dispatched {
    fn run(mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.scheduler.execute_now(ctx);
        }
    }
}

impl Drop for Dispatched {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            warn!(context = %ctx.id(), "Worker pool dropped a queued worker");
            self.scheduler.abandon(&ctx);
        }
    }
}

fn check_step(result: Result<Step, StructuredError>, awaiting: bool) -> Result<Step, StructuredError> {
    match (result, awaiting) {
        (Ok(Step::Await), false) => Err(StructuredError::new("worker suspended without starting children")),
        (Ok(Step::Done), true) => Err(StructuredError::new("worker finished while waiting for children")),
        (result, _) => result,
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool_size", &self.shared.config.pool_size)
            .field("outstanding", &self.outstanding())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
