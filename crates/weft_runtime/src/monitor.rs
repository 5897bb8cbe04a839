//! Execution metrics.
//!
//! Counters are updated from every pool thread, so they are plain atomics
//! with relaxed ordering. `snapshot` gives a consistent-enough copy for
//! reporting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the scheduler and aggregators
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    scheduled: AtomicU64,
    run_in_caller: AtomicU64,
    steps: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    suspensions: AtomicU64,
    resumptions: AtomicU64,
    joins_fired: AtomicU64,
    timeouts_fired: AtomicU64,
    late_signals: AtomicU64,
}

impl RuntimeMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker handed to the pool
    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Worker kept on the calling thread
    pub fn record_run_in_caller(&self) {
        self.run_in_caller.fetch_add(1, Ordering::Relaxed);
    }

    /// A context started running
    pub fn record_step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker completed
    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker errored
    pub fn record_failure(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    /// A context suspended on its children
    pub fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    /// A suspended context was resumed
    pub fn record_resumption(&self) {
        self.resumptions.fetch_add(1, Ordering::Relaxed);
    }

    /// An aggregator fired through its join path
    pub fn record_join(&self) {
        self.joins_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// An aggregator fired through its timeout path
    pub fn record_timeout(&self) {
        self.timeouts_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// A signal arrived after the aggregator fired
    pub fn record_late_signal(&self) {
        self.late_signals.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            workers_scheduled: self.scheduled.load(Ordering::Relaxed),
            workers_run_in_caller: self.run_in_caller.load(Ordering::Relaxed),
            steps_executed: self.steps.load(Ordering::Relaxed),
            workers_completed: self.completed.load(Ordering::Relaxed),
            workers_errored: self.errored.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            resumptions: self.resumptions.load(Ordering::Relaxed),
            joins_fired: self.joins_fired.load(Ordering::Relaxed),
            timeouts_fired: self.timeouts_fired.load(Ordering::Relaxed),
            late_signals_discarded: self.late_signals.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Workers handed to the pool
    pub workers_scheduled: u64,
    /// Workers kept on the calling thread
    pub workers_run_in_caller: u64,
    /// Times a context started running
    pub steps_executed: u64,
    /// Workers completed
    pub workers_completed: u64,
    /// Workers errored
    pub workers_errored: u64,
    /// Suspensions
    pub suspensions: u64,
    /// Resumptions
    pub resumptions: u64,
    /// Join continuations fired
    pub joins_fired: u64,
    /// Timeout continuations fired
    pub timeouts_fired: u64,
    /// Signals discarded after a fire
    pub late_signals_discarded: u64,
}

impl MetricsSnapshot {
    /// Workers that reached a terminal state
    #[must_use]
    pub fn workers_finished(&self) -> u64 {
        self.workers_completed + self.workers_errored
    }

    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let finished = self.workers_finished();
        if finished == 0 {
            return 1.0;
        }
        self.workers_completed as f64 / finished as f64
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let finished = self.workers_finished();
        if finished == 0 {
            return 0.0;
        }
        self.workers_errored as f64 / finished as f64
    }
}
