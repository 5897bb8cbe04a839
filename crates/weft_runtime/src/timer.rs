//! One-shot deferred callbacks.
//!
//! Used by fork-join to race a join against a deadline. The callback runs on
//! the timer thread itself, so a saturated worker pool cannot delay it; it
//! must only take short-lived locks.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Schedules callbacks on the engine's async threads
#[derive(Debug, Clone)]
pub struct TimeoutService {
    handle: Handle,
}

impl TimeoutService {
    /// Create a service driven by `handle`
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Run `callback` once after `delay` unless the returned handle is
    /// cancelled first
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        trace!(delay_ms = delay.as_millis() as u64, "Timeout scheduled");
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimeoutHandle { task: Some(task) }
    }
}

/// Pending timeout; cancelled explicitly or on drop
#[derive(Debug)]
pub struct TimeoutHandle {
    task: Option<JoinHandle<()>>,
}

impl TimeoutHandle {
    /// Stop the timeout if it has not elapsed yet
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_timeout_fires() {
        let rt = runtime();
        let service = TimeoutService::new(rt.handle().clone());
        let (tx, rx) = std::sync::mpsc::channel();
        let _handle = service.schedule(Duration::from_millis(5), move || {
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_timeout_fires_while_blocking_pool_is_busy() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        rt.spawn_blocking(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        let service = TimeoutService::new(rt.handle().clone());
        let (tx, rx) = std::sync::mpsc::channel();
        let _handle = service.schedule(Duration::from_millis(5), move || {
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let rt = runtime();
        let service = TimeoutService::new(rt.handle().clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut handle = service.schedule(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
