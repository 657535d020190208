//! Delegate protocol between a session and its owner.
//!
//! The session holds only a weak reference to the delegate; the caller is
//! free to drop it at any time, and notifications for a released delegate
//! are silently skipped. Every delegate method runs on the callback queue
//! configured at session construction, never on the session's own serial
//! worker. The two value-returning interactions (host-key trust, prompt
//! suppliers) round-trip back to the worker over a oneshot channel.

use std::sync::{Arc, Weak};

use skiff_platform::{CallbackQueue, SkiffError};
use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelId, ForwardedChannelInfo};
use crate::engine::{AuthMethod, HostKey, NegotiatedAlgorithms, ServerBanner};

/// Receiver of session-level events.
///
/// All methods have defaults, so implementors override only what they care
/// about. Note the default for [`SessionDelegate::should_trust_host_key`]
/// is `false`: a delegate that does not explicitly verify host keys never
/// accepts one.
pub trait SessionDelegate: Send + Sync {
    /// Decide whether the presented host key is trusted.
    ///
    /// Returning `false` fails the connection with a host-key error.
    fn should_trust_host_key(&self, _key: &HostKey) -> bool {
        false
    }

    /// The protocol greeting finished; software banners are known.
    fn on_server_banner(&self, _banner: &ServerBanner) {}

    /// The server sent a pre-authentication issue banner.
    fn on_issue_banner(&self, _banner: &str) {}

    /// Key exchange completed with this algorithm suite.
    fn on_negotiated(&self, _algorithms: &NegotiatedAlgorithms) {}

    /// The server reported which authentication methods it accepts.
    ///
    /// `partial_success` is true when a method already succeeded but the
    /// server wants another.
    fn on_auth_methods(&self, _methods: &[AuthMethod], _partial_success: bool) {}

    /// Authentication completed for `username`.
    fn on_authenticated(&self, _username: &str) {}

    /// The session reached its terminal stage.
    ///
    /// `error` is `None` for a caller-initiated disconnect.
    fn on_disconnected(&self, _error: Option<&SkiffError>) {}

    /// The server opened a forwarded channel; the handle is already
    /// read-write.
    fn on_forward_channel(&self, _channel: Channel, _info: &ForwardedChannelInfo) {}

    /// A channel failed outside any caller-visible operation.
    fn on_channel_error(&self, _channel: ChannelId, _error: &SkiffError) {}
}

/// The session worker's door to the delegate.
pub(crate) struct DelegateHandle {
    delegate: Weak<dyn SessionDelegate>,
    queue: Arc<dyn CallbackQueue>,
}

impl DelegateHandle {
    pub(crate) fn new(delegate: Weak<dyn SessionDelegate>, queue: Arc<dyn CallbackQueue>) -> Self {
        Self { delegate, queue }
    }

    pub(crate) fn queue(&self) -> &Arc<dyn CallbackQueue> {
        &self.queue
    }

    /// Fire-and-forget notification. The upgrade happens inside the queued
    /// job, so a delegate released while the job is in flight is skipped.
    pub(crate) fn notify(&self, f: impl FnOnce(&dyn SessionDelegate) + Send + 'static) {
        let delegate = self.delegate.clone();
        self.queue.execute(Box::new(move || {
            if let Some(delegate) = delegate.upgrade() {
                f(delegate.as_ref());
            }
        }));
    }

    /// Value query against the delegate; resolves `None` if the delegate
    /// is gone or the queue dropped the job.
    pub(crate) async fn query<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn SessionDelegate) -> R + Send + 'static,
    {
        let delegate = self.delegate.clone();
        let (tx, rx) = oneshot::channel();
        self.queue.execute(Box::new(move || {
            if let Some(delegate) = delegate.upgrade() {
                let _ = tx.send(f(delegate.as_ref()));
            }
        }));
        rx.await.ok()
    }
}

/// Run a caller-supplied closure on the callback queue and hand its result
/// back to the worker. Used for prompt suppliers, which are caller code
/// and must not run on the serial context.
pub(crate) async fn run_on_queue<R>(
    queue: &Arc<dyn CallbackQueue>,
    job: Box<dyn FnOnce() -> R + Send>,
) -> Option<R>
where
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    queue.execute(Box::new(move || {
        let _ = tx.send(job());
    }));
    rx.await.ok()
}
