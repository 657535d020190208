//! Session lifecycle and public surface.
//!
//! A [`Session`] is a cheap cloneable handle. The authoritative state —
//! the protocol engine, the stage machine, channel records — lives in a
//! dedicated worker task (see `worker`), and every public operation turns
//! into a command on that worker's queue. Commands execute one at a time
//! in enqueue order, which is the entire concurrency story: the engine is
//! only ever touched from the worker, so no locking exists anywhere on the
//! session path.
//!
//! Lifecycle operations (`connect`, `authenticate_*`, `disconnect`) are
//! fire-and-forget: they enqueue and return, and outcomes arrive through
//! the [`SessionDelegate`](crate::delegate::SessionDelegate). Channel and
//! SFTP operations await their result over a oneshot reply.

mod worker;

pub(crate) use worker::SessionCommand;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use skiff_platform::{CallbackQueue, ErrorKind, SkiffError, SkiffResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{await_reply, Channel, ChannelSpec, ChannelType};
use crate::config::SessionConfig;
use crate::delegate::{DelegateHandle, SessionDelegate};
use crate::engine::{self, InteractiveRound, KeyPair, SocketDescriptor, SshEngine};
use crate::sftp::channel::SftpChannel;

/// Supplies the password for a password authentication attempt.
///
/// Runs on the callback queue, never on the session worker. Returning
/// `None` aborts the attempt with an auth error and no engine call.
pub type PasswordPrompt = Box<dyn FnOnce() -> Option<String> + Send + 'static>;

/// Answers keyboard-interactive rounds, one call per round.
///
/// Runs on the callback queue. Returning `None` aborts the exchange with
/// an auth error.
pub type InteractivePrompter =
    Box<dyn FnMut(&InteractiveRound) -> Option<Vec<String>> + Send + 'static>;

/// Produces an already-connected socket for the engine to adopt.
///
/// Runs on the callback queue, since opening a socket is caller territory.
pub type DescriptorSupplier = Box<dyn FnOnce() -> SkiffResult<SocketDescriptor> + Send + 'static>;

/// Lifecycle stage of a session.
///
/// Forward transitions are strict and monotonic; the only shortcut is that
/// every non-terminal stage may fall directly to `Disconnected` on a fatal
/// error. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStage {
    /// Created, no connection attempt yet.
    NotConnected = 0,
    /// Transport connection in progress.
    Connecting = 1,
    /// Transport up, host key trusted, no auth exchange yet.
    PreAuthenticating = 2,
    /// Authentication exchange in progress.
    Authenticating = 3,
    /// Fully authenticated and usable.
    Connected = 4,
    /// Torn down. Terminal.
    Disconnected = 5,
}

impl SessionStage {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionStage) -> bool {
        matches!(
            (self, next),
            (SessionStage::NotConnected, SessionStage::Connecting)
                | (SessionStage::Connecting, SessionStage::PreAuthenticating)
                | (SessionStage::PreAuthenticating, SessionStage::Authenticating)
                | (SessionStage::Authenticating, SessionStage::Connected)
        ) || (next == SessionStage::Disconnected && self != SessionStage::Disconnected)
    }

    /// True once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self == SessionStage::Disconnected
    }

    fn from_u8(value: u8) -> SessionStage {
        match value {
            1 => SessionStage::Connecting,
            2 => SessionStage::PreAuthenticating,
            3 => SessionStage::Authenticating,
            4 => SessionStage::Connected,
            5 => SessionStage::Disconnected,
            _ => SessionStage::NotConnected,
        }
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStage::NotConnected => "not-connected",
            SessionStage::Connecting => "connecting",
            SessionStage::PreAuthenticating => "pre-authenticating",
            SessionStage::Authenticating => "authenticating",
            SessionStage::Connected => "connected",
            SessionStage::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Shared stage cell: the worker writes, handles read.
#[derive(Debug)]
pub(crate) struct SessionStageCell(AtomicU8);

impl SessionStageCell {
    pub(crate) fn new(stage: SessionStage) -> Self {
        Self(AtomicU8::new(stage as u8))
    }

    pub(crate) fn load(&self) -> SessionStage {
        SessionStage::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, stage: SessionStage) {
        self.0.store(stage as u8, Ordering::SeqCst);
    }
}

/// State shared between the public handle and everything that needs a
/// non-owning way back to the session (channels, requests). Dropping the
/// last strong reference closes the command queue, which ends the worker.
pub(crate) struct SessionShared {
    host: String,
    port: u16,
    username: String,
    config: Arc<SessionConfig>,
    stage: Arc<SessionStageCell>,
    blocking: AtomicBool,
    tx: mpsc::UnboundedSender<SessionCommand>,
    queue: Arc<dyn CallbackQueue>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    pub(crate) fn send(&self, command: SessionCommand) -> SkiffResult<()> {
        self.tx
            .send(command)
            .map_err(|_| SkiffError::session(ErrorKind::Fatal, "session worker terminated"))
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn callback_queue(&self) -> &Arc<dyn CallbackQueue> {
        &self.queue
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

/// Handle to one SSH connection.
///
/// Create with [`Session::new`], drive with `connect` and an
/// `authenticate_*` call, then open channels. All handles are clones of
/// the same session; the worker shuts down when the last one is dropped.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Create a session over `engine`, targeting `host:port` as `username`.
    ///
    /// The delegate is held weakly; the caller keeps ownership. Delegate
    /// methods and prompt closures run on `delegate_queue`. Fails if the
    /// configuration does not validate.
    pub fn new<E, D>(
        engine: E,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        config: SessionConfig,
        delegate: &Arc<D>,
        delegate_queue: Arc<dyn CallbackQueue>,
    ) -> SkiffResult<Session>
    where
        E: SshEngine + 'static,
        D: SessionDelegate + 'static,
    {
        config.validate()?;
        engine::run_library_init(&engine);

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            host: host.into(),
            port,
            username: username.into(),
            config: Arc::new(config),
            stage: Arc::new(SessionStageCell::new(SessionStage::NotConnected)),
            blocking: AtomicBool::new(true),
            tx,
            queue: Arc::clone(&delegate_queue),
            pump: Mutex::new(None),
        });

        // Two steps: `Arc::downgrade` must infer `Weak<D>` before the
        // unsized coercion to the trait object.
        let weak_delegate = Arc::downgrade(delegate);
        let weak_delegate: Weak<dyn SessionDelegate> = weak_delegate;
        let delegate = DelegateHandle::new(weak_delegate, delegate_queue);

        worker::spawn(Box::new(engine), &shared, delegate, rx);

        if let Some(interval) = shared.config.event_poll_interval {
            let handle = worker::spawn_event_pump(shared.tx.downgrade(), interval);
            if let Ok(mut pump) = shared.pump.lock() {
                *pump = Some(handle);
            }
        }

        Ok(Session { shared })
    }

    /// Begin connecting. `Duration::ZERO` means the engine's default
    /// timeout.
    ///
    /// Returns as soon as the work is enqueued; progress and the outcome
    /// arrive via the delegate.
    pub fn connect(&self, timeout: Duration) -> SkiffResult<()> {
        self.shared.send(SessionCommand::Connect {
            timeout,
            descriptor: None,
        })
    }

    /// Like [`Session::connect`], but adopt a socket from `supplier`
    /// instead of dialing `host:port`.
    pub fn connect_with_descriptor(
        &self,
        timeout: Duration,
        supplier: DescriptorSupplier,
    ) -> SkiffResult<()> {
        self.shared.send(SessionCommand::Connect {
            timeout,
            descriptor: Some(supplier),
        })
    }

    /// Begin password authentication, asking `prompt` for the password.
    pub fn authenticate_with_password(&self, prompt: PasswordPrompt) -> SkiffResult<()> {
        self.shared.send(SessionCommand::AuthPassword { prompt })
    }

    /// Begin public key authentication with `key_pair`.
    pub fn authenticate_with_key_pair(&self, key_pair: KeyPair) -> SkiffResult<()> {
        self.shared.send(SessionCommand::AuthKeyPair { key_pair })
    }

    /// Begin keyboard-interactive authentication, answering rounds through
    /// `prompt`.
    pub fn authenticate_with_interactive(&self, prompt: InteractivePrompter) -> SkiffResult<()> {
        self.shared.send(SessionCommand::AuthInteractive { prompt })
    }

    /// Disconnect. Idempotent: repeated calls (and calls after the worker
    /// is already gone) are no-ops.
    pub fn disconnect(&self) -> SkiffResult<()> {
        match self.shared.send(SessionCommand::Disconnect) {
            Ok(()) => Ok(()),
            // Worker gone means the session is already torn down.
            Err(_) => Ok(()),
        }
    }

    /// Open a channel described by `spec`.
    ///
    /// Resolves once the channel reaches read-write, or with the open
    /// failure. Subsystem specs are rejected here, before any engine
    /// interaction.
    pub async fn open_channel(&self, spec: ChannelSpec) -> SkiffResult<Channel> {
        if spec.channel_type() == ChannelType::Subsystem {
            return Err(SkiffError::channel(
                ErrorKind::Generic,
                "subsystem channels are not supported",
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .send(SessionCommand::OpenChannel { spec, reply: tx })?;
        await_reply(rx).await
    }

    /// Open an SFTP channel, completing the subsystem handshake.
    pub async fn open_sftp_channel(&self) -> SkiffResult<SftpChannel> {
        let (tx, rx) = oneshot::channel();
        self.shared.send(SessionCommand::OpenSftp { reply: tx })?;
        await_reply(rx).await
    }

    /// Run `job` on the session's serial context, fire-and-forget.
    ///
    /// This is the sanctioned way to touch the engine directly; jobs for
    /// the same session never run concurrently and execute in enqueue
    /// order.
    pub fn dispatch_async<F>(&self, job: F) -> SkiffResult<()>
    where
        F: FnOnce(&mut dyn SshEngine) + Send + 'static,
    {
        self.shared.send(SessionCommand::Dispatch { job: Box::new(job) })
    }

    /// Run `job` on the session's serial context and await its result.
    pub async fn dispatch_sync<R, F>(&self, job: F) -> SkiffResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn SshEngine) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.shared.send(SessionCommand::Dispatch {
            job: Box::new(move |engine| {
                let _ = tx.send(job(engine));
            }),
        })?;
        rx.await
            .map_err(|_| SkiffError::session(ErrorKind::Fatal, "session worker terminated"))
    }

    /// The engine's connected socket, if the transport is up.
    pub async fn descriptor(&self) -> SkiffResult<Option<SocketDescriptor>> {
        self.dispatch_sync(|engine| engine.descriptor()).await
    }

    /// Switch the engine transport between blocking and non-blocking mode.
    pub fn set_blocking(&self, blocking: bool) -> SkiffResult<()> {
        self.shared.blocking.store(blocking, Ordering::SeqCst);
        self.shared.send(SessionCommand::SetBlocking { blocking })
    }

    /// Last blocking mode requested via [`Session::set_blocking`].
    pub fn blocking(&self) -> bool {
        self.shared.blocking.load(Ordering::SeqCst)
    }

    /// Target host.
    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Username this session authenticates as.
    pub fn username(&self) -> &str {
        &self.shared.username
    }

    /// The configuration the session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> SessionStage {
        self.shared.stage.load()
    }

    /// True while fully authenticated and usable.
    pub fn is_connected(&self) -> bool {
        self.stage() == SessionStage::Connected
    }

    /// True once the session reached its terminal stage.
    pub fn is_disconnected(&self) -> bool {
        self.stage() == SessionStage::Disconnected
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("username", &self.shared.username)
            .field("stage", &self.stage())
            .finish()
    }
}
