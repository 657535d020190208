//! Asynchronous SFTP requests.
//!
//! Every queued path operation is tracked by a request with a small state
//! machine: `Created` until the worker picks it up, `Started` while the
//! engine call is in flight, then exactly one of `Succeeded`, `Failed` or
//! `Cancelled`. All terminal transitions go through a compare-exchange on
//! the state word, so a cancellation racing a completion resolves
//! deterministically: whichever transition lands first wins, the loser's
//! result is discarded, and the matching callback fires exactly once.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use skiff_platform::CallbackQueue;
use tracing::{debug, warn};

use crate::channel::ChannelId;
use crate::config::CancelledFailurePolicy;
use crate::sftp::channel::RawAttributes;
use crate::sftp::types::{FileExistence, SftpError};

/// Lifecycle state of an SFTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Queued, not yet picked up by the session worker.
    Created = 0,
    /// The engine call is in flight.
    Started = 1,
    /// Completed successfully. Terminal.
    Succeeded = 2,
    /// Completed with an error. Terminal.
    Failed = 3,
    /// Cancelled before a result arrived. Terminal.
    Cancelled = 4,
}

impl RequestState {
    /// True once the request can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::Cancelled
        )
    }

    fn from_u8(value: u8) -> RequestState {
        match value {
            1 => RequestState::Started,
            2 => RequestState::Succeeded,
            3 => RequestState::Failed,
            4 => RequestState::Cancelled,
            _ => RequestState::Created,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Created => "created",
            RequestState::Started => "started",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A path operation that can be queued against an SFTP channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpOperation {
    /// Fetch the attributes of `path`.
    Stat {
        /// Remote path.
        path: String,
    },
    /// Probe whether `path` exists.
    Exists {
        /// Remote path.
        path: String,
    },
    /// Resolve `path` to its canonical server-side form.
    Canonicalize {
        /// Remote path.
        path: String,
    },
    /// Change the permission bits of `path`.
    Chmod {
        /// Remote path.
        path: String,
        /// New permission bits.
        mode: u32,
    },
    /// Rename `old_path` to `new_path`.
    Rename {
        /// Current remote path.
        old_path: String,
        /// Desired remote path.
        new_path: String,
    },
    /// Create the directory `path`.
    Mkdir {
        /// Remote path.
        path: String,
        /// Permission bits for the new directory.
        mode: u32,
    },
    /// Remove the directory `path`.
    Rmdir {
        /// Remote path.
        path: String,
    },
    /// Remove the file `path`.
    Unlink {
        /// Remote path.
        path: String,
    },
    /// Create a symlink at `destination` pointing to `target`.
    Symlink {
        /// Link target.
        target: String,
        /// Where the link itself is created.
        destination: String,
    },
    /// Read the target of the symlink at `path`.
    Readlink {
        /// Remote path.
        path: String,
    },
}

impl SftpOperation {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SftpOperation::Stat { .. } => "stat",
            SftpOperation::Exists { .. } => "exists",
            SftpOperation::Canonicalize { .. } => "canonicalize",
            SftpOperation::Chmod { .. } => "chmod",
            SftpOperation::Rename { .. } => "rename",
            SftpOperation::Mkdir { .. } => "mkdir",
            SftpOperation::Rmdir { .. } => "rmdir",
            SftpOperation::Unlink { .. } => "unlink",
            SftpOperation::Symlink { .. } => "symlink",
            SftpOperation::Readlink { .. } => "readlink",
        }
    }

    /// Check every path argument before any engine call is made.
    pub(crate) fn validate(&self) -> Result<(), SftpError> {
        match self {
            SftpOperation::Stat { path }
            | SftpOperation::Exists { path }
            | SftpOperation::Canonicalize { path }
            | SftpOperation::Chmod { path, .. }
            | SftpOperation::Mkdir { path, .. }
            | SftpOperation::Rmdir { path }
            | SftpOperation::Unlink { path }
            | SftpOperation::Readlink { path } => validate_path(path),
            SftpOperation::Rename { old_path, new_path } => {
                validate_path(old_path)?;
                validate_path(new_path)
            }
            SftpOperation::Symlink {
                target,
                destination,
            } => {
                validate_path(target)?;
                validate_path(destination)
            }
        }
    }
}

/// Reject paths the wire protocol cannot carry.
pub(crate) fn validate_path(path: &str) -> Result<(), SftpError> {
    if path.is_empty() {
        return Err(SftpError::invalid_path("path is empty"));
    }
    if path.contains('\0') {
        return Err(SftpError::invalid_path("path contains a NUL byte"));
    }
    Ok(())
}

/// What a successful request produced.
#[derive(Debug)]
pub enum SftpOutcome {
    /// The operation has no payload.
    Unit,
    /// Result of an existence probe.
    Existence(FileExistence),
    /// A server-side path, from canonicalize or readlink.
    Path(String),
    /// File attributes, from stat.
    Attributes(RawAttributes),
}

/// Completion callbacks for one request.
///
/// Each callback fires at most once, on the session's callback queue, and
/// exactly one of them fires over the lifetime of a request.
#[derive(Default)]
pub struct SftpCallbacks {
    success: Option<Box<dyn FnOnce(SftpOutcome) + Send>>,
    failure: Option<Box<dyn FnOnce(SftpError) + Send>>,
    cancelled: Option<Box<dyn FnOnce() + Send>>,
}

impl SftpCallbacks {
    /// No callbacks; attach them with the builder methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the outcome when the request succeeds.
    pub fn on_success(mut self, f: impl FnOnce(SftpOutcome) + Send + 'static) -> Self {
        self.success = Some(Box::new(f));
        self
    }

    /// Called with the error when the request fails.
    pub fn on_failure(mut self, f: impl FnOnce(SftpError) + Send + 'static) -> Self {
        self.failure = Some(Box::new(f));
        self
    }

    /// Called when the request is cancelled before completing.
    pub fn on_cancelled(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.cancelled = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SftpCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpCallbacks")
            .field("success", &self.success.is_some())
            .field("failure", &self.failure.is_some())
            .field("cancelled", &self.cancelled.is_some())
            .finish()
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Requests still owned by an SFTP channel, cancelled in bulk when the
/// channel is torn down.
pub(crate) type RequestRegistry = Arc<Mutex<Vec<Arc<RequestShared>>>>;

/// State shared between the public handle, the owning channel's registry
/// and the session worker.
pub(crate) struct RequestShared {
    id: u64,
    channel: ChannelId,
    operation: SftpOperation,
    state: AtomicU8,
    callbacks: Mutex<Option<SftpCallbacks>>,
    error: Mutex<Option<SftpError>>,
    queue: Arc<dyn CallbackQueue>,
    policy: CancelledFailurePolicy,
}

impl RequestShared {
    pub(crate) fn new(
        channel: ChannelId,
        operation: SftpOperation,
        callbacks: SftpCallbacks,
        queue: Arc<dyn CallbackQueue>,
        policy: CancelledFailurePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            operation,
            state: AtomicU8::new(RequestState::Created as u8),
            callbacks: Mutex::new(Some(callbacks)),
            error: Mutex::new(None),
            queue,
            policy,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn channel(&self) -> ChannelId {
        self.channel
    }

    pub(crate) fn operation(&self) -> &SftpOperation {
        &self.operation
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn error(&self) -> Option<SftpError> {
        match self.error.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }

    fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The callbacks leave the slot exactly once, with the terminal
    /// transition that won.
    fn take_callbacks(&self) -> Option<SftpCallbacks> {
        match self.callbacks.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }

    /// `Created` to `Started`. False when a cancellation got there first.
    pub(crate) fn mark_started(&self) -> bool {
        self.transition(RequestState::Created, RequestState::Started)
    }

    pub(crate) fn succeed(&self, outcome: SftpOutcome) {
        if !self.transition(RequestState::Started, RequestState::Succeeded) {
            self.discard_late("success", None);
            return;
        }
        debug!(request = self.id, operation = self.operation.name(), "request succeeded");
        if let Some(callbacks) = self.take_callbacks() {
            if let Some(on_success) = callbacks.success {
                self.queue.execute(Box::new(move || on_success(outcome)));
            }
        }
    }

    pub(crate) fn fail(&self, error: SftpError) {
        if !self.transition(RequestState::Started, RequestState::Failed) {
            self.discard_late("failure", Some(&error));
            return;
        }
        debug!(
            request = self.id,
            operation = self.operation.name(),
            %error,
            "request failed"
        );
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(error.clone());
        }
        if let Some(callbacks) = self.take_callbacks() {
            if let Some(on_failure) = callbacks.failure {
                self.queue.execute(Box::new(move || on_failure(error)));
            }
        }
    }

    /// Cancel from any non-terminal state. No-op once terminal. The
    /// cancellation callback fires once, on the first effective call.
    pub(crate) fn cancel(&self) {
        let won = self.transition(RequestState::Created, RequestState::Cancelled)
            || self.transition(RequestState::Started, RequestState::Cancelled);
        if !won {
            return;
        }
        debug!(request = self.id, operation = self.operation.name(), "request cancelled");
        if let Some(callbacks) = self.take_callbacks() {
            if let Some(on_cancelled) = callbacks.cancelled {
                self.queue.execute(Box::new(on_cancelled));
            }
        }
    }

    /// A result arrived after the request was already cancelled.
    fn discard_late(&self, kind: &str, error: Option<&SftpError>) {
        match self.policy {
            CancelledFailurePolicy::Silent => {}
            CancelledFailurePolicy::Log => match error {
                Some(error) => warn!(
                    request = self.id,
                    operation = self.operation.name(),
                    %error,
                    "late {} after cancellation discarded",
                    kind
                ),
                None => warn!(
                    request = self.id,
                    operation = self.operation.name(),
                    "late {} after cancellation discarded",
                    kind
                ),
            },
        }
    }
}

impl fmt::Debug for RequestShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestShared")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("operation", &self.operation.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a queued SFTP request.
///
/// Dropping the handle does not cancel the request; call
/// [`SftpRequest::cancel`] for that.
#[derive(Clone)]
pub struct SftpRequest {
    shared: Arc<RequestShared>,
}

impl SftpRequest {
    pub(crate) fn new(shared: Arc<RequestShared>) -> Self {
        Self { shared }
    }

    /// Identifier unique within the process.
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// The operation this request performs.
    pub fn operation(&self) -> &SftpOperation {
        self.shared.operation()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.shared.state()
    }

    /// True once the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    /// The failure, once the request is in the `Failed` state.
    pub fn error(&self) -> Option<SftpError> {
        self.shared.error()
    }

    /// Cancel the request. Safe to call at any time and from any task; a
    /// request that already completed is left untouched.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl fmt::Debug for SftpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpRequest")
            .field("id", &self.id())
            .field("operation", &self.operation().name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_platform::InlineCallbackQueue;
    use std::sync::atomic::AtomicUsize;

    fn request_with_counters() -> (Arc<RequestShared>, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let success = Arc::new(AtomicUsize::new(0));
        let failure = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let callbacks = SftpCallbacks::new()
            .on_success({
                let success = Arc::clone(&success);
                move |_| {
                    success.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_failure({
                let failure = Arc::clone(&failure);
                move |_| {
                    failure.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_cancelled({
                let cancelled = Arc::clone(&cancelled);
                move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
            });
        let request = RequestShared::new(
            ChannelId(1),
            SftpOperation::Unlink {
                path: "/tmp/victim".to_string(),
            },
            callbacks,
            Arc::new(InlineCallbackQueue),
            CancelledFailurePolicy::Silent,
        );
        (request, success, failure, cancelled)
    }

    #[test]
    fn test_success_is_terminal_and_fires_once() {
        let (request, success, failure, cancelled) = request_with_counters();
        assert!(request.mark_started());
        request.succeed(SftpOutcome::Unit);
        assert_eq!(request.state(), RequestState::Succeeded);

        // Late results and cancellations bounce off the terminal state.
        request.fail(SftpError::invalid_state("late"));
        request.cancel();
        assert_eq!(request.state(), RequestState::Succeeded);
        assert_eq!(success.load(Ordering::SeqCst), 1);
        assert_eq!(failure.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_records_the_error() {
        let (request, success, failure, _) = request_with_counters();
        assert!(request.mark_started());
        request.fail(SftpError::invalid_path("path is empty"));
        assert_eq!(request.state(), RequestState::Failed);
        assert_eq!(failure.load(Ordering::SeqCst), 1);
        assert_eq!(success.load(Ordering::SeqCst), 0);
        let error = request.error();
        assert!(error.is_some());
    }

    #[test]
    fn test_cancel_before_start_blocks_the_start() {
        let (request, _, _, cancelled) = request_with_counters();
        request.cancel();
        assert_eq!(request.state(), RequestState::Cancelled);
        assert!(!request.mark_started());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (request, _, _, cancelled) = request_with_counters();
        assert!(request.mark_started());
        request.cancel();
        request.cancel();
        request.cancel();
        assert_eq!(request.state(), RequestState::Cancelled);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_success_after_cancellation_is_discarded() {
        let (request, success, _, cancelled) = request_with_counters();
        assert!(request.mark_started());
        request.cancel();
        request.succeed(SftpOutcome::Unit);
        assert_eq!(request.state(), RequestState::Cancelled);
        assert_eq!(success.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_operation_validation() {
        assert!(SftpOperation::Mkdir {
            path: "/data/incoming".to_string(),
            mode: 0o755,
        }
        .validate()
        .is_ok());

        let empty = SftpOperation::Mkdir {
            path: String::new(),
            mode: 0o755,
        };
        assert!(empty.validate().is_err());

        let nul = SftpOperation::Unlink {
            path: "bad\0path".to_string(),
        };
        assert!(nul.validate().is_err());

        let rename = SftpOperation::Rename {
            old_path: "/a".to_string(),
            new_path: String::new(),
        };
        assert!(rename.validate().is_err());
    }

    #[test]
    fn test_request_states_terminality() {
        assert!(!RequestState::Created.is_terminal());
        assert!(!RequestState::Started.is_terminal());
        assert!(RequestState::Succeeded.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Cancelled.is_terminal());
    }
}
