//! Response aggregation for multi-worker invocations.
//!
//! Every worker of an invocation signals the same aggregator when it reaches a
//! terminal state. The aggregator counts signals, merges results into the
//! target context, keeps the first error, and fires the target's continuation
//! exactly once: when the join threshold is reached, or when a fork-join
//! timeout elapses first.
//!
//! Lock order is `state` then the target context. The timeout handle has its
//! own lock, never held while taking another.

use crate::callable::{ForkJoinInfo, JoinTargets};
use crate::context::{ContextInner, ContextRef, ContextState};
use crate::scheduler::Scheduler;
use crate::timer::TimeoutHandle;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};
use weft_core::{InvocationId, StructuredError, Value, ValueType};

/// Callback receiving the outcome of a non-blocking invocation
pub type ResponseCallback = Box<dyn FnOnce(CallOutcome) + Send>;

/// Results and error delivered to a callback
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Values of the declared return types; defaults where nothing was merged
    pub results: Vec<Value>,
    /// First worker error, if any
    pub error: Option<StructuredError>,
}

impl CallOutcome {
    /// Outcome of an invocation that failed before producing results
    #[must_use]
    pub fn failed(error: StructuredError) -> Self {
        Self {
            results: Vec::new(),
            error: Some(error),
        }
    }

    /// Whether no error was raised
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Completion signal of one worker
#[derive(Debug, Clone)]
pub struct WorkerSignal {
    /// Worker name
    pub worker: String,
    /// Returned values by index, or the worker's error
    pub outcome: Result<Vec<Option<Value>>, StructuredError>,
}

impl WorkerSignal {
    /// Successful completion
    #[must_use]
    pub fn completed(worker: impl Into<String>, returns: Vec<Option<Value>>) -> Self {
        Self {
            worker: worker.into(),
            outcome: Ok(returns),
        }
    }

    /// Failed completion
    #[must_use]
    pub fn errored(worker: impl Into<String>, error: StructuredError) -> Self {
        Self {
            worker: worker.into(),
            outcome: Err(error),
        }
    }
}

/// Blocks a host thread until an aggregator fires
#[derive(Debug, Default)]
pub struct Waiter {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Waiter {
    /// Create an unsignaled waiter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every waiting thread
    pub fn notify(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    /// Block until notified
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    /// Block until notified or `timeout` elapses; returns whether notified
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            let _ = self.cond.wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }
}

/// Atomic pending to fired transition
#[derive(Debug, Default)]
pub struct FireGuard(AtomicBool);

impl FireGuard {
    /// Claim the single fire; true for exactly one caller
    pub fn try_fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the fire was claimed
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Which path fired the continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Join threshold reached
    Joined,
    /// Timeout elapsed first
    TimedOut,
}

/// Variant-specific merge and continuation behavior
pub enum AggregatorKind {
    /// Results merged into the target frame; the target is resumed, or a
    /// blocked host thread is released
    Invocation {
        /// Declared return types
        return_types: Vec<ValueType>,
        /// Target register per return index
        target_regs: Vec<usize>,
        /// Host thread waiting for the result
        waiter: Option<std::sync::Arc<Waiter>>,
    },
    /// Results merged into the target frame and handed to a callback
    Callback {
        /// Declared return types
        return_types: Vec<ValueType>,
        /// Target register per return index
        target_regs: Vec<usize>,
        /// Consumed on fire
        callback: Mutex<Option<ResponseCallback>>,
    },
    /// Results collected per channel and written as one map
    ForkJoin {
        /// Workers counting toward the join
        join_set: IndexSet<String>,
        /// Worker to channel routing
        channels: IndexMap<String, String>,
        /// Resume targets
        targets: JoinTargets,
    },
    /// Single init worker run synchronously; nothing to resume
    InitWorker,
}

impl AggregatorKind {
    /// Plain invocation variant
    #[must_use]
    pub fn invocation(
        return_types: Vec<ValueType>,
        target_regs: Vec<usize>,
        waiter: Option<std::sync::Arc<Waiter>>,
    ) -> Self {
        Self::Invocation {
            return_types,
            target_regs,
            waiter,
        }
    }

    /// Callback variant
    pub fn callback<F>(return_types: Vec<ValueType>, target_regs: Vec<usize>, callback: F) -> Self
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        Self::Callback {
            return_types,
            target_regs,
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Fork-join variant
    #[must_use]
    pub fn fork_join(info: &ForkJoinInfo, targets: JoinTargets) -> Self {
        Self::ForkJoin {
            join_set: info.join_set(),
            channels: info.channels().clone(),
            targets,
        }
    }

    /// Variant name for diagnostics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Invocation { .. } => "invocation",
            Self::Callback { .. } => "callback",
            Self::ForkJoin { .. } => "fork_join",
            Self::InitWorker => "init_worker",
        }
    }

    pub(crate) fn into_callback(self) -> Option<ResponseCallback> {
        match self {
            Self::Callback { callback, .. } => callback.into_inner(),
            _ => None,
        }
    }
}

impl fmt::Debug for AggregatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
struct JoinState {
    signaled: usize,
    joined: usize,
    results: IndexMap<String, Value>,
    fired_by: Option<FireOutcome>,
}

/// Shared completion state of one invocation's workers
pub struct ResponseAggregator {
    invocation: InvocationId,
    kind: AggregatorKind,
    expected: usize,
    required: usize,
    target: Option<ContextRef>,
    scheduler: Scheduler,
    guard: FireGuard,
    error: OnceLock<StructuredError>,
    state: Mutex<JoinState>,
    timeout: Mutex<Option<TimeoutHandle>>,
}

impl ResponseAggregator {
    /// Create an aggregator expecting `expected` signals and firing after
    /// `required` of them count toward the join
    #[must_use]
    pub fn new(
        invocation: InvocationId,
        kind: AggregatorKind,
        expected: usize,
        required: usize,
        target: Option<ContextRef>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            invocation,
            kind,
            expected,
            required: required.min(expected),
            target,
            scheduler,
            guard: FireGuard::default(),
            error: OnceLock::new(),
            state: Mutex::new(JoinState::default()),
            timeout: Mutex::new(None),
        }
    }

    /// Invocation id
    #[must_use]
    pub fn invocation(&self) -> InvocationId {
        self.invocation
    }

    /// Variant
    #[must_use]
    pub fn kind(&self) -> &AggregatorKind {
        &self.kind
    }

    /// Workers expected to signal
    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Signals needed to fire
    #[must_use]
    pub fn required(&self) -> usize {
        self.required
    }

    /// Signals received so far, late ones included
    #[must_use]
    pub fn signaled(&self) -> usize {
        self.state.lock().signaled
    }

    /// Whether every expected worker has signaled
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.signaled() == self.expected
    }

    /// Whether the continuation fired
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.guard.is_fired()
    }

    /// Which path fired the continuation
    #[must_use]
    pub fn fired_by(&self) -> Option<FireOutcome> {
        self.state.lock().fired_by
    }

    /// First error observed
    #[must_use]
    pub fn first_error(&self) -> Option<&StructuredError> {
        self.error.get()
    }

    /// Attach the fork-join timeout so a join can cancel it
    pub fn set_timeout(&self, mut handle: TimeoutHandle) {
        if self.guard.is_fired() {
            handle.cancel();
            return;
        }
        *self.timeout.lock() = Some(handle);
    }

    /// Block until the continuation fires; returns at once for variants
    /// without a waiter
    pub fn wait(&self) {
        if let AggregatorKind::Invocation { waiter: Some(waiter), .. } = &self.kind {
            waiter.wait();
        }
    }

    /// Record one worker's completion
    pub fn signal(&self, signal: WorkerSignal) {
        let mut state = self.state.lock();
        if state.signaled >= self.expected {
            warn!(
                invocation = %self.invocation,
                worker = %signal.worker,
                expected = self.expected,
                "Signal beyond expected worker count ignored"
            );
            return;
        }
        state.signaled += 1;

        if self.guard.is_fired() {
            self.scheduler.metrics().record_late_signal();
            debug!(
                invocation = %self.invocation,
                worker = %signal.worker,
                signaled = state.signaled,
                "Late signal discarded"
            );
            return;
        }

        let counts = self.counts_toward_join(&signal.worker);
        match signal.outcome {
            Err(error) => self.record_error(error),
            Ok(returns) => {
                if let Err(error) = self.merge(&mut state, &signal.worker, returns) {
                    self.record_error(error);
                }
            }
        }
        if counts {
            state.joined += 1;
        }
        trace!(
            invocation = %self.invocation,
            worker = %signal.worker,
            joined = state.joined,
            required = self.required,
            "Signal recorded"
        );

        if state.joined < self.required || !self.guard.try_fire() {
            return;
        }
        state.fired_by = Some(FireOutcome::Joined);
        let results = std::mem::take(&mut state.results);
        drop(state);

        self.cancel_timeout();
        self.scheduler.metrics().record_join();
        debug!(invocation = %self.invocation, kind = self.kind.name(), "Join fired");
        self.fire(results, FireOutcome::Joined);
    }

    /// Fire the timeout path unless the join already fired
    pub fn on_timeout(&self) {
        let results = {
            let mut state = self.state.lock();
            if !self.guard.try_fire() {
                trace!(invocation = %self.invocation, "Timeout lost the race to the join");
                return;
            }
            state.fired_by = Some(FireOutcome::TimedOut);
            std::mem::take(&mut state.results)
        };
        self.scheduler.metrics().record_timeout();
        debug!(
            invocation = %self.invocation,
            partial = results.len(),
            "Fork-join timed out"
        );
        self.fire(results, FireOutcome::TimedOut);
    }

    fn counts_toward_join(&self, worker: &str) -> bool {
        match &self.kind {
            AggregatorKind::ForkJoin { join_set, .. } => join_set.contains(worker),
            _ => true,
        }
    }

    fn record_error(&self, error: StructuredError) {
        if let Err(later) = self.error.set(error) {
            debug!(
                invocation = %self.invocation,
                error = %later,
                "Later worker error discarded"
            );
        }
    }

    fn merge(
        &self,
        state: &mut JoinState,
        worker: &str,
        returns: Vec<Option<Value>>,
    ) -> Result<(), StructuredError> {
        match &self.kind {
            AggregatorKind::Invocation {
                return_types,
                target_regs,
                ..
            }
            | AggregatorKind::Callback {
                return_types,
                target_regs,
                ..
            } => {
                let Some(target) = &self.target else {
                    return Ok(());
                };
                let mut inner = target.lock();
                for (index, value) in returns.into_iter().enumerate() {
                    let Some(value) = value else { continue };
                    let (Some(kind), Some(reg)) = (return_types.get(index), target_regs.get(index)) else {
                        return Err(StructuredError::new(format!(
                            "worker '{}' returned value {} but only {} are declared",
                            worker,
                            index,
                            return_types.len()
                        )));
                    };
                    inner.frame.store_typed(*kind, *reg, value)?;
                }
                Ok(())
            }
            AggregatorKind::ForkJoin {
                join_set, channels, ..
            } => {
                if join_set.contains(worker) {
                    let key = channels.get(worker).map_or(worker, String::as_str);
                    let values = returns.into_iter().map(|v| v.unwrap_or(Value::Nil)).collect();
                    state.results.insert(key.to_string(), Value::Array(values));
                }
                Ok(())
            }
            AggregatorKind::InitWorker => Ok(()),
        }
    }

    fn cancel_timeout(&self) {
        if let Some(mut handle) = self.timeout.lock().take() {
            handle.cancel();
        }
    }

    fn fire(&self, results: IndexMap<String, Value>, outcome: FireOutcome) {
        match &self.kind {
            AggregatorKind::InitWorker => {}
            AggregatorKind::Invocation { waiter, .. } => {
                self.resume_target(|_| {});
                if let Some(waiter) = waiter {
                    waiter.notify();
                }
            }
            AggregatorKind::Callback {
                return_types,
                target_regs,
                callback,
            } => {
                self.resume_target(|_| {});
                let loaded = self
                    .target
                    .as_ref()
                    .map(|target| target.lock().frame.load_all(return_types, target_regs));
                let mut error = self.error.get().cloned();
                let results = match loaded {
                    Some(Ok(values)) => values,
                    Some(Err(e)) => {
                        error.get_or_insert_with(|| e.into());
                        Vec::new()
                    }
                    None => Vec::new(),
                };
                if let Some(callback) = callback.lock().take() {
                    callback(CallOutcome { results, error });
                }
            }
            AggregatorKind::ForkJoin { targets, .. } => {
                let (ip, reg) = match outcome {
                    FireOutcome::Joined => (targets.join_ip, targets.join_reg),
                    FireOutcome::TimedOut => (targets.timeout_ip, targets.timeout_reg),
                };
                self.resume_target(|inner| {
                    inner.ip = ip;
                    if let Err(e) = inner.frame.store(reg, Value::Map(results)) {
                        inner.set_error(e.into());
                    }
                });
            }
        }
    }

    fn resume_target<F>(&self, update: F)
    where
        F: FnOnce(&mut ContextInner),
    {
        let Some(target) = &self.target else {
            return;
        };
        let resume = {
            let mut inner = target.lock();
            if let Some(error) = self.error.get() {
                inner.set_error(error.clone());
            }
            update(&mut inner);
            if target.worker_info().is_none() {
                inner.state = if inner.error.is_some() {
                    ContextState::Errored
                } else {
                    ContextState::Completed
                };
                false
            } else if inner.state == ContextState::Suspended {
                inner.state = ContextState::Scheduled;
                true
            } else {
                debug!(
                    context = %target.id(),
                    state = %inner.state,
                    "Target no longer waiting; continuation dropped"
                );
                false
            }
        };
        if resume {
            self.scheduler.resume(target.clone());
        }
    }
}

impl fmt::Debug for ResponseAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseAggregator")
            .field("invocation", &self.invocation)
            .field("kind", &self.kind)
            .field("expected", &self.expected)
            .field("required", &self.required)
            .field("fired", &self.guard.is_fired())
            .finish_non_exhaustive()
    }
}
