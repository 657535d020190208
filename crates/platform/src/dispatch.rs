//! Callback execution contexts.
//!
//! Session-internal work runs on a per-session serial worker; everything
//! caller-facing (delegate notifications, request callbacks) is handed off
//! to a [`CallbackQueue`] chosen at session construction. The queue only
//! promises to run each job once. It makes no ordering or exclusivity
//! guarantees of its own, so delegate code must be prepared for concurrent
//! delivery when a spawning queue is used.

use std::fmt;

/// A unit of caller-facing work.
pub type CallbackJob = Box<dyn FnOnce() + Send + 'static>;

/// Execution context for delegate notifications and request callbacks.
pub trait CallbackQueue: Send + Sync {
    /// Run `job` on this context.
    ///
    /// Implementations must not drop the job without running it while the
    /// process is healthy; suppressed callbacks break the exactly-once
    /// delivery contract of the request lifecycle.
    fn execute(&self, job: CallbackJob);
}

/// Runs each callback on a freshly spawned tokio task.
///
/// Callbacks may execute concurrently with each other. This is the default
/// context for applications running inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCallbackQueue;

impl CallbackQueue for TokioCallbackQueue {
    fn execute(&self, job: CallbackJob) {
        tokio::spawn(async move {
            job();
        });
    }
}

/// Runs each callback inline on the task that dispatched it.
///
/// Intended for tests and small tools where deterministic delivery matters
/// more than isolation. A callback that blocks will stall whatever
/// dispatched it, so long-running delegate work does not belong here.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineCallbackQueue;

impl CallbackQueue for InlineCallbackQueue {
    fn execute(&self, job: CallbackJob) {
        job();
    }
}

impl fmt::Debug for dyn CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackQueue")
    }
}
