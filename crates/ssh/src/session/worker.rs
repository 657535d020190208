//! The session worker: a single task that owns the protocol engine.
//!
//! Every operation on a [`Session`](super::Session) becomes a
//! [`SessionCommand`] on the worker's queue. The worker drains the queue
//! one command at a time, so engine calls for a session are strictly
//! serialized and execute in enqueue order. Delegate callbacks and prompt
//! closures never run here; they are handed to the callback queue, and
//! when the worker needs an answer back (host key trust, a password) it
//! parks on a oneshot until the callback resolves.
//!
//! After each command the worker drains engine events, picking up peer
//! channel closes, server-opened forwarded channels, and transport loss.
//! A lightweight pump task enqueues periodic polls so events surface even
//! while the caller is idle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use skiff_platform::{CallbackQueue, ErrorDomain, ErrorKind, SkiffError, SkiffResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::channel::{
    Channel, ChannelId, ChannelSpec, ChannelStage, ChannelStageCell, ChannelType,
    ForwardedChannelInfo,
};
use crate::config::SessionConfig;
use crate::delegate::{run_on_queue, DelegateHandle};
use crate::engine::{
    AttributesHandle, AuthOutcome, ConnectTarget, EngineChannelId, EngineEvent, EngineFileId,
    InteractiveRound, InteractiveStep, KeyPair, SftpHandle, SshEngine,
};
use crate::session::{
    DescriptorSupplier, InteractivePrompter, PasswordPrompt, SessionShared, SessionStage,
    SessionStageCell,
};
use crate::sftp::channel::{RawAttributes, SftpChannel};
use crate::sftp::request::{RequestRegistry, RequestShared, SftpOperation, SftpOutcome};
use crate::sftp::types::{FileExistence, FileOpenFlags, SftpError, SftpStatus};

/// One unit of work for the session worker.
pub(crate) enum SessionCommand {
    Connect {
        timeout: Duration,
        descriptor: Option<DescriptorSupplier>,
    },
    AuthPassword {
        prompt: PasswordPrompt,
    },
    AuthKeyPair {
        key_pair: KeyPair,
    },
    AuthInteractive {
        prompt: InteractivePrompter,
    },
    Disconnect,
    SetBlocking {
        blocking: bool,
    },
    Dispatch {
        job: Box<dyn FnOnce(&mut dyn SshEngine) + Send>,
    },
    OpenChannel {
        spec: ChannelSpec,
        reply: oneshot::Sender<SkiffResult<Channel>>,
    },
    ChannelRead {
        id: ChannelId,
        max_len: usize,
        reply: oneshot::Sender<SkiffResult<Vec<u8>>>,
    },
    ChannelWrite {
        id: ChannelId,
        data: Vec<u8>,
        reply: oneshot::Sender<SkiffResult<usize>>,
    },
    ChannelClose {
        id: ChannelId,
        reply: Option<oneshot::Sender<SkiffResult<()>>>,
    },
    OpenSftp {
        reply: oneshot::Sender<SkiffResult<SftpChannel>>,
    },
    SftpExecute {
        channel: ChannelId,
        operation: SftpOperation,
        reply: oneshot::Sender<Result<SftpOutcome, SftpError>>,
    },
    SftpStart {
        request: Arc<RequestShared>,
    },
    SftpFreeAttributes {
        channel: ChannelId,
        attributes: AttributesHandle,
        reply: oneshot::Sender<Result<(), SftpError>>,
    },
    SftpOpenFile {
        channel: ChannelId,
        path: String,
        flags: FileOpenFlags,
        mode: u32,
        reply: oneshot::Sender<Result<(u64, Arc<AtomicBool>), SftpError>>,
    },
    SftpCloseFile {
        channel: ChannelId,
        file: u64,
        reply: oneshot::Sender<Result<(), SftpError>>,
    },
    Poll,
}

/// A channel as the worker sees it.
struct ChannelRecord {
    id: ChannelId,
    stage: Arc<ChannelStageCell>,
    engine_id: Option<EngineChannelId>,
    sftp: Option<SftpState>,
}

/// Extra bookkeeping carried by the SFTP channel record: the subsystem
/// handle plus everything that must be invalidated when the channel goes
/// away.
struct SftpState {
    handle: SftpHandle,
    files: HashMap<u64, FileRecord>,
    next_file_id: u64,
    attributes: HashSet<u64>,
    requests: RequestRegistry,
}

struct FileRecord {
    engine_id: EngineFileId,
    valid: Arc<AtomicBool>,
}

/// Everything the worker owns. Holds only a weak reference back to the
/// shared session state so that dropping the last public handle closes
/// the queue and ends the worker.
struct SessionCore {
    engine: Box<dyn SshEngine>,
    session: Weak<SessionShared>,
    stage: Arc<SessionStageCell>,
    host: String,
    port: u16,
    username: String,
    config: Arc<SessionConfig>,
    delegate: DelegateHandle,
    channels: HashMap<u64, ChannelRecord>,
    next_channel_id: u64,
}

pub(crate) fn spawn(
    engine: Box<dyn SshEngine>,
    shared: &Arc<SessionShared>,
    delegate: DelegateHandle,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let core = SessionCore {
        engine,
        session: Arc::downgrade(shared),
        stage: Arc::clone(&shared.stage),
        host: shared.host.clone(),
        port: shared.port,
        username: shared.username.clone(),
        config: Arc::clone(&shared.config),
        delegate,
        channels: HashMap::new(),
        next_channel_id: 1,
    };
    tokio::spawn(async move {
        SessionWorker { core, rx }.run().await;
    });
}

/// Periodically enqueues a poll so engine events are drained while the
/// caller is idle. Holds only a weak sender; the pump winds down once the
/// session is gone.
pub(crate) fn spawn_event_pump(
    tx: mpsc::WeakUnboundedSender<SessionCommand>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let tx = match tx.upgrade() {
                Some(tx) => tx,
                None => break,
            };
            if tx.send(SessionCommand::Poll).is_err() {
                break;
            }
        }
    })
}

struct SessionWorker {
    core: SessionCore,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl SessionWorker {
    async fn run(mut self) {
        debug!(host = %self.core.host, port = self.core.port, "session worker started");
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
            self.pump_events();
        }
        // Last handle dropped; tear down whatever is still up.
        if !self.core.stage.load().is_terminal() {
            self.disconnect_with_error(None);
        }
        debug!(host = %self.core.host, "session worker stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { timeout, descriptor } => {
                self.handle_connect(timeout, descriptor).await;
            }
            SessionCommand::AuthPassword { prompt } => self.handle_auth_password(prompt).await,
            SessionCommand::AuthKeyPair { key_pair } => self.handle_auth_key_pair(key_pair),
            SessionCommand::AuthInteractive { prompt } => {
                self.handle_auth_interactive(prompt).await;
            }
            SessionCommand::Disconnect => self.disconnect_with_error(None),
            SessionCommand::SetBlocking { blocking } => {
                debug!(blocking, "switching transport blocking mode");
                self.core.engine.set_blocking(blocking);
            }
            SessionCommand::Dispatch { job } => job(self.core.engine.as_mut()),
            SessionCommand::OpenChannel { spec, reply } => {
                let _ = reply.send(self.open_channel(spec));
            }
            SessionCommand::ChannelRead { id, max_len, reply } => {
                let _ = reply.send(self.channel_read(id, max_len));
            }
            SessionCommand::ChannelWrite { id, data, reply } => {
                let _ = reply.send(self.channel_write(id, &data));
            }
            SessionCommand::ChannelClose { id, reply } => {
                let result = self.close_channel(id);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(error) = result {
                    debug!(channel = %id, %error, "channel close failed");
                }
            }
            SessionCommand::OpenSftp { reply } => {
                let _ = reply.send(self.open_sftp());
            }
            SessionCommand::SftpExecute { channel, operation, reply } => {
                let _ = reply.send(self.execute_sftp(channel, &operation));
            }
            SessionCommand::SftpStart { request } => self.start_request(request),
            SessionCommand::SftpFreeAttributes { channel, attributes, reply } => {
                let _ = reply.send(self.free_attributes(channel, attributes));
            }
            SessionCommand::SftpOpenFile { channel, path, flags, mode, reply } => {
                let _ = reply.send(self.open_file(channel, &path, flags, mode));
            }
            SessionCommand::SftpCloseFile { channel, file, reply } => {
                let _ = reply.send(self.close_file(channel, file));
            }
            SessionCommand::Poll => {}
        }
    }

    // ---- lifecycle ----

    async fn handle_connect(&mut self, timeout: Duration, descriptor: Option<DescriptorSupplier>) {
        let stage = self.core.stage.load();
        if stage != SessionStage::NotConnected {
            warn!(%stage, "connect ignored outside the not-connected stage");
            return;
        }
        self.advance(SessionStage::Connecting);

        let target = match descriptor {
            Some(supplier) => match run_on_queue(self.core.delegate.queue(), supplier).await {
                Some(Ok(descriptor)) => ConnectTarget::Descriptor(descriptor),
                Some(Err(error)) => {
                    self.disconnect_with_error(Some(error));
                    return;
                }
                None => {
                    self.disconnect_with_error(Some(SkiffError::session(
                        ErrorKind::Fatal,
                        "socket descriptor supplier went away",
                    )));
                    return;
                }
            },
            None => ConnectTarget::HostPort {
                host: self.core.host.clone(),
                port: self.core.port,
            },
        };

        info!(host = %self.core.host, port = self.core.port, ?timeout, "connecting");
        if let Err(failure) = self.core.engine.connect(&target, &self.core.config, timeout) {
            self.disconnect_with_error(Some(failure.into_error(ErrorDomain::Session)));
            return;
        }
        let negotiation = match self.core.engine.negotiate() {
            Ok(negotiation) => negotiation,
            Err(failure) => {
                self.disconnect_with_error(Some(failure.into_error(ErrorDomain::Session)));
                return;
            }
        };
        debug!(
            server = %negotiation.banner.server_software,
            kex = %negotiation.algorithms.kex,
            "transport negotiated"
        );
        {
            let banner = negotiation.banner.clone();
            self.core.delegate.notify(move |delegate| delegate.on_server_banner(&banner));
        }
        {
            let algorithms = negotiation.algorithms.clone();
            self.core.delegate.notify(move |delegate| delegate.on_negotiated(&algorithms));
        }
        if let Some(issue) = negotiation.issue_banner.clone() {
            self.core.delegate.notify(move |delegate| delegate.on_issue_banner(&issue));
        }

        let fingerprint = negotiation.host_key.fingerprint();
        let key = negotiation.host_key.clone();
        let trusted = self
            .core
            .delegate
            .query(move |delegate| delegate.should_trust_host_key(&key))
            .await
            .unwrap_or(false);
        if !trusted {
            self.disconnect_with_error(Some(SkiffError::session(
                ErrorKind::HostKey,
                format!("host key {fingerprint} was not trusted"),
            )));
            return;
        }
        debug!(%fingerprint, "host key trusted");
        self.advance(SessionStage::PreAuthenticating);
    }

    /// Move into `Authenticating`, probing the server's methods first if
    /// this is the opening attempt. Returns false when authentication
    /// cannot proceed from the current stage.
    fn ensure_authenticating(&mut self) -> bool {
        match self.core.stage.load() {
            SessionStage::Authenticating => true,
            SessionStage::PreAuthenticating => {
                match self.core.engine.auth_methods(&self.core.username) {
                    Ok(methods) => {
                        debug!(?methods, "authentication methods");
                        self.advance(SessionStage::Authenticating);
                        self.core
                            .delegate
                            .notify(move |delegate| delegate.on_auth_methods(&methods, false));
                        true
                    }
                    Err(failure) => {
                        self.disconnect_with_error(Some(failure.into_error(ErrorDomain::Session)));
                        false
                    }
                }
            }
            stage => {
                warn!(%stage, "authentication ignored in this stage");
                false
            }
        }
    }

    async fn handle_auth_password(&mut self, prompt: PasswordPrompt) {
        if !self.ensure_authenticating() {
            return;
        }
        let password = match run_on_queue(self.core.delegate.queue(), prompt).await.flatten() {
            Some(password) => password,
            None => {
                self.disconnect_with_error(Some(SkiffError::session(
                    ErrorKind::Auth,
                    "no password was provided",
                )));
                return;
            }
        };
        match self.core.engine.auth_password(&self.core.username, &password) {
            Ok(outcome) => self.settle_auth(outcome),
            Err(failure) => {
                self.disconnect_with_error(Some(failure.into_error(ErrorDomain::Session)));
            }
        }
    }

    fn handle_auth_key_pair(&mut self, key_pair: KeyPair) {
        if !self.ensure_authenticating() {
            return;
        }
        match self.core.engine.auth_key_pair(&self.core.username, &key_pair) {
            Ok(outcome) => self.settle_auth(outcome),
            Err(failure) => {
                self.disconnect_with_error(Some(failure.into_error(ErrorDomain::Session)));
            }
        }
    }

    async fn handle_auth_interactive(&mut self, prompt: InteractivePrompter) {
        if !self.ensure_authenticating() {
            return;
        }
        let mut prompt = prompt;
        let mut step = match self.core.engine.auth_interactive_start(&self.core.username) {
            Ok(step) => step,
            Err(failure) => {
                self.disconnect_with_error(Some(failure.into_error(ErrorDomain::Session)));
                return;
            }
        };
        loop {
            match step {
                InteractiveStep::Outcome(outcome) => {
                    self.settle_auth(outcome);
                    return;
                }
                InteractiveStep::Prompts(round) => {
                    debug!(prompts = round.prompts.len(), "keyboard-interactive round");
                    let (answers, returned) =
                        match prompt_round(self.core.delegate.queue(), prompt, round).await {
                            Some(result) => result,
                            None => {
                                self.disconnect_with_error(Some(SkiffError::session(
                                    ErrorKind::Auth,
                                    "keyboard-interactive prompt went away",
                                )));
                                return;
                            }
                        };
                    prompt = returned;
                    let answers = match answers {
                        Some(answers) => answers,
                        None => {
                            self.disconnect_with_error(Some(SkiffError::session(
                                ErrorKind::Auth,
                                "keyboard-interactive exchange was abandoned",
                            )));
                            return;
                        }
                    };
                    step = match self.core.engine.auth_interactive_respond(&answers) {
                        Ok(step) => step,
                        Err(failure) => {
                            self.disconnect_with_error(Some(
                                failure.into_error(ErrorDomain::Session),
                            ));
                            return;
                        }
                    };
                }
            }
        }
    }

    fn settle_auth(&mut self, outcome: AuthOutcome) {
        match outcome {
            AuthOutcome::Success => {
                self.advance(SessionStage::Connected);
                info!(username = %self.core.username, "authenticated");
                let username = self.core.username.clone();
                self.core.delegate.notify(move |delegate| delegate.on_authenticated(&username));
            }
            AuthOutcome::Partial { methods } => {
                debug!(?methods, "partial authentication success, more methods required");
                self.core
                    .delegate
                    .notify(move |delegate| delegate.on_auth_methods(&methods, true));
            }
            AuthOutcome::Denied { methods } => {
                let accepted = methods
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                self.disconnect_with_error(Some(SkiffError::session(
                    ErrorKind::Auth,
                    format!("authentication was rejected (server accepts: {accepted})"),
                )));
            }
        }
    }

    /// The single teardown path. Closes channels, drops the transport,
    /// moves to `Disconnected` and notifies the delegate exactly once;
    /// later calls are no-ops.
    fn disconnect_with_error(&mut self, error: Option<SkiffError>) {
        if self.core.stage.load() == SessionStage::Disconnected {
            if let Some(error) = error {
                debug!(%error, "failure after disconnect suppressed");
            }
            return;
        }
        match &error {
            Some(error) => error!(%error, "session failed, disconnecting"),
            None => info!(host = %self.core.host, "disconnecting"),
        }
        let ids: Vec<ChannelId> = self.core.channels.values().map(|record| record.id).collect();
        for id in ids {
            if let Err(close_error) = self.close_channel(id) {
                debug!(channel = %id, error = %close_error, "channel teardown failed");
            }
        }
        self.core.engine.disconnect();
        self.advance(SessionStage::Disconnected);
        self.core
            .delegate
            .notify(move |delegate| delegate.on_disconnected(error.as_ref()));
    }

    fn advance(&mut self, next: SessionStage) {
        let current = self.core.stage.load();
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "illegal session stage transition ignored");
            return;
        }
        self.core.stage.store(next);
        debug!(from = %current, to = %next, "session stage advanced");
    }

    // ---- channels ----

    fn ensure_connected(&self) -> SkiffResult<()> {
        let stage = self.core.stage.load();
        if stage != SessionStage::Connected {
            return Err(SkiffError::channel(
                ErrorKind::Generic,
                format!("session is {stage}"),
            ));
        }
        Ok(())
    }

    /// Allocate an id and walk a fresh stage cell up to `Opening`.
    fn begin_channel(&mut self) -> (ChannelId, Arc<ChannelStageCell>) {
        let id = ChannelId(self.core.next_channel_id);
        self.core.next_channel_id += 1;
        let stage = Arc::new(ChannelStageCell::new(ChannelStage::Invalid));
        advance_channel(&stage, ChannelStage::Created);
        advance_channel(&stage, ChannelStage::Opening);
        debug!(channel = %id, "opening channel");
        (id, stage)
    }

    /// Record a successfully opened channel and mint the public handle.
    fn finish_channel(
        &mut self,
        id: ChannelId,
        channel_type: ChannelType,
        stage: Arc<ChannelStageCell>,
        engine_id: EngineChannelId,
        sftp: Option<SftpState>,
    ) -> Channel {
        advance_channel(&stage, ChannelStage::ReadWrite);
        self.core.channels.insert(
            id.0,
            ChannelRecord {
                id,
                stage: Arc::clone(&stage),
                engine_id: Some(engine_id),
                sftp,
            },
        );
        info!(channel = %id, kind = %channel_type, "channel open");
        Channel::new(id, channel_type, stage, self.core.session.clone())
    }

    fn open_channel(&mut self, spec: ChannelSpec) -> SkiffResult<Channel> {
        self.ensure_connected()?;
        let channel_type = spec.channel_type();
        if channel_type == ChannelType::Subsystem {
            return Err(SkiffError::channel(
                ErrorKind::Generic,
                "subsystem channels are not supported",
            ));
        }
        let (id, stage) = self.begin_channel();
        match self.core.engine.open_channel(&spec) {
            Ok(engine_id) => Ok(self.finish_channel(id, channel_type, stage, engine_id, None)),
            Err(failure) => {
                stage.store(ChannelStage::Closed);
                Err(failure.into_error(ErrorDomain::Channel))
            }
        }
    }

    fn open_sftp(&mut self) -> SkiffResult<SftpChannel> {
        self.ensure_connected()?;
        let (id, stage) = self.begin_channel();
        match self.core.engine.open_sftp() {
            Ok((engine_id, handle)) => {
                let requests: RequestRegistry = Arc::new(Mutex::new(Vec::new()));
                let state = SftpState {
                    handle,
                    files: HashMap::new(),
                    next_file_id: 1,
                    attributes: HashSet::new(),
                    requests: Arc::clone(&requests),
                };
                let channel = self.finish_channel(id, ChannelType::Sftp, stage, engine_id, Some(state));
                Ok(SftpChannel::new(channel, requests))
            }
            Err(failure) => {
                stage.store(ChannelStage::Closed);
                Err(failure.into_error(ErrorDomain::Channel))
            }
        }
    }

    /// Look up a channel that is ready for I/O.
    fn ready_channel(&self, id: ChannelId) -> SkiffResult<EngineChannelId> {
        let record = match self.core.channels.get(&id.0) {
            Some(record) => record,
            None => {
                return Err(SkiffError::channel(ErrorKind::Generic, "channel is closed"));
            }
        };
        let stage = record.stage.load();
        if stage != ChannelStage::ReadWrite {
            return Err(SkiffError::channel(
                ErrorKind::Generic,
                format!("channel is {stage}, not read-write"),
            ));
        }
        match record.engine_id {
            Some(engine_id) => Ok(engine_id),
            None => Err(SkiffError::channel(
                ErrorKind::Fatal,
                "channel lost its engine handle",
            )),
        }
    }

    fn channel_read(&mut self, id: ChannelId, max_len: usize) -> SkiffResult<Vec<u8>> {
        let engine_id = self.ready_channel(id)?;
        self.core
            .engine
            .channel_read(engine_id, max_len)
            .map_err(|failure| failure.into_error(ErrorDomain::Channel))
    }

    fn channel_write(&mut self, id: ChannelId, data: &[u8]) -> SkiffResult<usize> {
        let engine_id = self.ready_channel(id)?;
        self.core
            .engine
            .channel_write(engine_id, data)
            .map_err(|failure| failure.into_error(ErrorDomain::Channel))
    }

    /// Close a channel from any live stage. Idempotent. SFTP bookkeeping
    /// is torn down first so file handles and requests are invalidated
    /// before the channel itself goes away.
    fn close_channel(&mut self, id: ChannelId) -> SkiffResult<()> {
        let record = match self.core.channels.get_mut(&id.0) {
            Some(record) => record,
            None => return Ok(()),
        };
        let stage = Arc::clone(&record.stage);
        let engine_id = record.engine_id;
        let sftp = record.sftp.take();
        self.core.channels.remove(&id.0);

        if let Some(state) = sftp {
            self.teardown_sftp(state);
        }
        let result = match (stage.load(), engine_id) {
            (ChannelStage::ReadWrite, Some(engine_id)) => self
                .core
                .engine
                .close_channel(engine_id)
                .map_err(|failure| failure.into_error(ErrorDomain::Channel)),
            _ => Ok(()),
        };
        advance_channel(&stage, ChannelStage::Closed);
        debug!(channel = %id, "channel closed");
        result
    }

    fn teardown_sftp(&mut self, state: SftpState) {
        if let Ok(mut requests) = state.requests.lock() {
            for request in requests.drain(..) {
                request.cancel();
            }
        }
        for (_, file) in state.files {
            file.valid.store(false, Ordering::SeqCst);
            if let Err(failure) = self.core.engine.sftp_close(state.handle, file.engine_id) {
                debug!(error = %failure, "remote file close failed during teardown");
            }
        }
        for raw in state.attributes {
            self.core.engine.sftp_free_attributes(state.handle, AttributesHandle(raw));
        }
        self.core.engine.sftp_shutdown(state.handle);
    }

    // ---- SFTP ----

    /// Preconditions shared by every SFTP operation: the session is
    /// connected, the channel is read-write, and the subsystem handle is
    /// alive.
    fn sftp_handle(&self, channel: ChannelId) -> Result<SftpHandle, SftpError> {
        let stage = self.core.stage.load();
        if stage != SessionStage::Connected {
            return Err(SftpError::invalid_state(format!("session is {stage}")));
        }
        let record = match self.core.channels.get(&channel.0) {
            Some(record) => record,
            None => return Err(SftpError::invalid_state("channel is closed")),
        };
        let channel_stage = record.stage.load();
        if channel_stage != ChannelStage::ReadWrite {
            return Err(SftpError::invalid_state(format!(
                "channel is {channel_stage}, not read-write"
            )));
        }
        match &record.sftp {
            Some(state) => Ok(state.handle),
            None => Err(SftpError::subsystem_lost("channel has no SFTP subsystem")),
        }
    }

    fn sftp_state_mut(&mut self, channel: ChannelId) -> Option<&mut SftpState> {
        self.core
            .channels
            .get_mut(&channel.0)
            .and_then(|record| record.sftp.as_mut())
    }

    /// Validate and run one path operation against the engine.
    fn execute_sftp(
        &mut self,
        channel: ChannelId,
        operation: &SftpOperation,
    ) -> Result<SftpOutcome, SftpError> {
        let handle = self.sftp_handle(channel)?;
        operation.validate()?;
        self.run_operation(channel, handle, operation)
    }

    fn run_operation(
        &mut self,
        channel: ChannelId,
        handle: SftpHandle,
        operation: &SftpOperation,
    ) -> Result<SftpOutcome, SftpError> {
        match operation {
            SftpOperation::Stat { path } => {
                let (token, attributes) = self
                    .core
                    .engine
                    .sftp_stat(handle, path)
                    .map_err(|failure| failure.into_error())?;
                if let Some(state) = self.sftp_state_mut(channel) {
                    state.attributes.insert(token.0);
                }
                Ok(SftpOutcome::Attributes(RawAttributes::new(token, attributes)))
            }
            SftpOperation::Exists { path } => match self.core.engine.sftp_stat(handle, path) {
                Ok((token, _)) => {
                    self.core.engine.sftp_free_attributes(handle, token);
                    Ok(SftpOutcome::Existence(FileExistence::Exists))
                }
                Err(failure) if SftpStatus::from_raw(failure.status) == SftpStatus::NoSuchFile => {
                    Ok(SftpOutcome::Existence(FileExistence::NotExists))
                }
                Err(failure) => Err(failure.into_error()),
            },
            SftpOperation::Canonicalize { path } => {
                let real = self
                    .core
                    .engine
                    .sftp_canonicalize(handle, path)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Path(real))
            }
            SftpOperation::Chmod { path, mode } => {
                self.core
                    .engine
                    .sftp_setstat(handle, path, *mode)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Unit)
            }
            SftpOperation::Rename { old_path, new_path } => {
                self.core
                    .engine
                    .sftp_rename(handle, old_path, new_path)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Unit)
            }
            SftpOperation::Mkdir { path, mode } => {
                self.core
                    .engine
                    .sftp_mkdir(handle, path, *mode)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Unit)
            }
            SftpOperation::Rmdir { path } => {
                self.core
                    .engine
                    .sftp_rmdir(handle, path)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Unit)
            }
            SftpOperation::Unlink { path } => {
                self.core
                    .engine
                    .sftp_unlink(handle, path)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Unit)
            }
            SftpOperation::Symlink { target, destination } => {
                self.core
                    .engine
                    .sftp_symlink(handle, target, destination)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Unit)
            }
            SftpOperation::Readlink { path } => {
                let target = self
                    .core
                    .engine
                    .sftp_readlink(handle, path)
                    .map_err(|failure| failure.into_error())?;
                Ok(SftpOutcome::Path(target))
            }
        }
    }

    /// Drive one queued request through its lifecycle. A request whose
    /// start lost to a cancellation is skipped without touching the
    /// engine.
    fn start_request(&mut self, request: Arc<RequestShared>) {
        if !request.mark_started() {
            debug!(request = request.id(), "request was cancelled before it started");
            self.prune_requests(request.channel());
            return;
        }
        match self.execute_sftp(request.channel(), request.operation()) {
            Ok(outcome) => request.succeed(outcome),
            Err(error) => request.fail(error),
        }
        self.prune_requests(request.channel());
    }

    fn prune_requests(&mut self, channel: ChannelId) {
        if let Some(state) = self.sftp_state_mut(channel) {
            if let Ok(mut requests) = state.requests.lock() {
                requests.retain(|request| !request.is_terminal());
            }
        }
    }

    fn free_attributes(
        &mut self,
        channel: ChannelId,
        attributes: AttributesHandle,
    ) -> Result<(), SftpError> {
        let handle = self.sftp_handle(channel)?;
        if let Some(state) = self.sftp_state_mut(channel) {
            state.attributes.remove(&attributes.0);
        }
        self.core.engine.sftp_free_attributes(handle, attributes);
        Ok(())
    }

    fn open_file(
        &mut self,
        channel: ChannelId,
        path: &str,
        flags: FileOpenFlags,
        mode: u32,
    ) -> Result<(u64, Arc<AtomicBool>), SftpError> {
        let handle = self.sftp_handle(channel)?;
        crate::sftp::request::validate_path(path)?;
        let engine_file = self
            .core
            .engine
            .sftp_open(handle, path, flags, mode)
            .map_err(|failure| failure.into_error())?;
        match self.sftp_state_mut(channel) {
            Some(state) => {
                let id = state.next_file_id;
                state.next_file_id += 1;
                let valid = Arc::new(AtomicBool::new(true));
                state.files.insert(
                    id,
                    FileRecord {
                        engine_id: engine_file,
                        valid: Arc::clone(&valid),
                    },
                );
                debug!(channel = %channel, file = id, path = %path, "remote file opened");
                Ok((id, valid))
            }
            None => {
                let _ = self.core.engine.sftp_close(handle, engine_file);
                Err(SftpError::subsystem_lost("channel has no SFTP subsystem"))
            }
        }
    }

    fn close_file(&mut self, channel: ChannelId, file: u64) -> Result<(), SftpError> {
        let handle = self.sftp_handle(channel)?;
        let record = self
            .sftp_state_mut(channel)
            .and_then(|state| state.files.remove(&file));
        match record {
            Some(record) => {
                record.valid.store(false, Ordering::SeqCst);
                debug!(channel = %channel, file, "remote file closed");
                self.core
                    .engine
                    .sftp_close(handle, record.engine_id)
                    .map_err(|failure| failure.into_error())
            }
            // Already invalidated by a channel close, or closed twice.
            None => Ok(()),
        }
    }

    // ---- engine events ----

    fn pump_events(&mut self) {
        if self.core.stage.load() != SessionStage::Connected {
            return;
        }
        for event in self.core.engine.drain_events() {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ForwardChannelOpened {
                id,
                destination_port,
                originator_host,
                originator_port,
            } => {
                let (channel_id, stage) = self.begin_channel();
                let channel = self.finish_channel(channel_id, ChannelType::Forward, stage, id, None);
                let info = ForwardedChannelInfo {
                    destination_port,
                    originator_host,
                    originator_port,
                };
                info!(channel = %channel_id, port = info.destination_port, "peer opened forwarded channel");
                self.core
                    .delegate
                    .notify(move |delegate| delegate.on_forward_channel(channel, &info));
            }
            EngineEvent::ChannelClosed { id } => {
                if let Some(channel_id) = self.find_channel(id) {
                    debug!(channel = %channel_id, "peer closed channel");
                    if let Err(error) = self.close_channel(channel_id) {
                        debug!(channel = %channel_id, %error, "peer close teardown failed");
                    }
                }
            }
            EngineEvent::ChannelFault { id, failure } => {
                if let Some(channel_id) = self.find_channel(id) {
                    let error = failure.into_error(ErrorDomain::Channel);
                    warn!(channel = %channel_id, %error, "channel fault");
                    if let Err(close_error) = self.close_channel(channel_id) {
                        debug!(channel = %channel_id, error = %close_error, "fault teardown failed");
                    }
                    self.core
                        .delegate
                        .notify(move |delegate| delegate.on_channel_error(channel_id, &error));
                }
            }
            EngineEvent::TransportLost { failure } => {
                self.disconnect_with_error(Some(failure.into_error(ErrorDomain::Session)));
            }
        }
    }

    fn find_channel(&self, engine_id: EngineChannelId) -> Option<ChannelId> {
        self.core
            .channels
            .values()
            .find(|record| record.engine_id == Some(engine_id))
            .map(|record| record.id)
    }
}

fn advance_channel(cell: &ChannelStageCell, next: ChannelStage) {
    let current = cell.load();
    if !current.can_transition_to(next) {
        warn!(from = %current, to = %next, "illegal channel stage transition ignored");
        return;
    }
    cell.store(next);
}

/// Run one keyboard-interactive round on the callback queue, handing the
/// prompter back for the next round.
async fn prompt_round(
    queue: &Arc<dyn CallbackQueue>,
    mut prompt: InteractivePrompter,
    round: InteractiveRound,
) -> Option<(Option<Vec<String>>, InteractivePrompter)> {
    let (tx, rx) = oneshot::channel();
    queue.execute(Box::new(move || {
        let answers = prompt(&round);
        let _ = tx.send((answers, prompt));
    }));
    rx.await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_channel_refuses_illegal_transitions() {
        let cell = ChannelStageCell::new(ChannelStage::Invalid);
        advance_channel(&cell, ChannelStage::Created);
        advance_channel(&cell, ChannelStage::Opening);
        advance_channel(&cell, ChannelStage::ReadWrite);
        assert_eq!(cell.load(), ChannelStage::ReadWrite);

        // Going backwards is ignored.
        advance_channel(&cell, ChannelStage::Created);
        assert_eq!(cell.load(), ChannelStage::ReadWrite);

        advance_channel(&cell, ChannelStage::Closed);
        assert_eq!(cell.load(), ChannelStage::Closed);

        // Closed is terminal.
        advance_channel(&cell, ChannelStage::ReadWrite);
        assert_eq!(cell.load(), ChannelStage::Closed);
    }

    #[tokio::test]
    async fn test_event_pump_stops_once_the_queue_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump = spawn_event_pump(tx.downgrade(), Duration::from_millis(1));

        match rx.recv().await {
            Some(SessionCommand::Poll) => {}
            _ => panic!("expected a poll"),
        }

        drop(rx);
        drop(tx);
        let joined = tokio::time::timeout(Duration::from_secs(1), pump).await;
        assert!(joined.is_ok(), "pump task kept running");
    }
}
