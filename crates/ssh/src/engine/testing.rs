//! A scripted in-memory engine for tests, demos and prototyping.
//!
//! [`ScriptedEngine`] answers every call with a canned happy-path reply,
//! records each call in a [`CallJournal`], and lets a test override
//! individual replies or inject asynchronous events before the engine is
//! handed to a session. Because the journal and the event queue are
//! shared handles, they stay usable after the engine has moved into the
//! session worker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::channel::ChannelSpec;
use crate::config::SessionConfig;
use crate::sftp::types::{FileAttributes, FileMode, FileOpenFlags};

use super::{
    AttributesHandle, AuthMethod, AuthOutcome, ConnectTarget, EngineChannelId, EngineEvent,
    EngineFailure, EngineFileId, EngineResult, EngineSftpResult, HostKey, HostKeyKind,
    InteractiveStep, KeyPair, NegotiatedAlgorithms, Negotiation, ServerBanner, SftpFailure,
    SftpHandle, SocketDescriptor, SshEngine,
};

/// One recorded engine call, reduced to what tests assert on.
///
/// Event drains are deliberately not recorded; the poll loop would bury
/// everything else in noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// Process-wide initialization ran.
    LibraryInit,
    /// A transport connection was attempted.
    Connect {
        /// Host, or `fd N` for an adopted descriptor.
        host: String,
        /// Timeout exactly as the caller passed it, zero included.
        timeout: std::time::Duration,
    },
    /// The protocol handshake ran.
    Negotiate,
    /// The transport blocking mode was switched.
    SetBlocking(bool),
    /// The server was probed for authentication methods.
    AuthMethods {
        /// Username the probe ran for.
        username: String,
    },
    /// A password authentication attempt.
    AuthPassword {
        /// Username the attempt ran for.
        username: String,
    },
    /// A public key authentication attempt.
    AuthKeyPair {
        /// Username the attempt ran for.
        username: String,
        /// Key algorithm name.
        algorithm: String,
    },
    /// A keyboard-interactive exchange began.
    AuthInteractiveStart {
        /// Username the exchange ran for.
        username: String,
    },
    /// Answers for one keyboard-interactive round were submitted.
    AuthInteractiveRespond {
        /// How many answers were sent.
        answers: usize,
    },
    /// A channel open.
    OpenChannel {
        /// Channel kind, as displayed.
        kind: String,
    },
    /// A channel read.
    ChannelRead {
        /// Engine channel id.
        id: u64,
        /// Read limit.
        max_len: usize,
    },
    /// A channel write.
    ChannelWrite {
        /// Engine channel id.
        id: u64,
        /// Payload length.
        len: usize,
    },
    /// A channel close.
    CloseChannel {
        /// Engine channel id.
        id: u64,
    },
    /// The SFTP subsystem handshake.
    OpenSftp,
    /// A stat call.
    SftpStat {
        /// Remote path.
        path: String,
    },
    /// A canonicalize call.
    SftpCanonicalize {
        /// Remote path.
        path: String,
    },
    /// A setstat call.
    SftpSetstat {
        /// Remote path.
        path: String,
        /// Requested permission bits.
        mode: u32,
    },
    /// A rename call.
    SftpRename {
        /// Source path.
        old: String,
        /// Destination path.
        new: String,
    },
    /// A mkdir call.
    SftpMkdir {
        /// Remote path.
        path: String,
        /// Requested permission bits.
        mode: u32,
    },
    /// A rmdir call.
    SftpRmdir {
        /// Remote path.
        path: String,
    },
    /// An unlink call.
    SftpUnlink {
        /// Remote path.
        path: String,
    },
    /// A symlink call.
    SftpSymlink {
        /// Link target.
        target: String,
        /// Link location.
        destination: String,
    },
    /// A readlink call.
    SftpReadlink {
        /// Remote path.
        path: String,
    },
    /// A remote file open.
    SftpOpen {
        /// Remote path.
        path: String,
    },
    /// A remote file close.
    SftpCloseFile {
        /// Engine file id.
        file: u64,
    },
    /// An attribute allocation was released.
    SftpFreeAttributes {
        /// Allocation token.
        token: u64,
    },
    /// The SFTP subsystem was shut down.
    SftpShutdown,
    /// The transport was dropped.
    Disconnect,
}

/// Shared, clonable view of the calls a [`ScriptedEngine`] received.
#[derive(Debug, Clone)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<EngineCall>>>,
}

impl CallJournal {
    /// Copy of the calls recorded so far, in order.
    pub fn snapshot(&self) -> Vec<EngineCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Whether `call` was recorded.
    pub fn contains(&self, call: &EngineCall) -> bool {
        self.snapshot().iter().any(|recorded| recorded == call)
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

/// Shared handle for injecting engine events from a test while the
/// engine itself lives inside the session worker.
#[derive(Debug, Clone)]
pub struct EventInjector {
    events: Arc<Mutex<VecDeque<EngineEvent>>>,
}

impl EventInjector {
    /// Queue `event` for the next drain.
    pub fn push(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(event);
        }
    }
}

/// In-memory [`SshEngine`] with scriptable replies.
pub struct ScriptedEngine {
    journal: Arc<Mutex<Vec<EngineCall>>>,
    events: Arc<Mutex<VecDeque<EngineEvent>>>,
    negotiation: Negotiation,
    connect_failure: Option<EngineFailure>,
    auth_methods: Vec<AuthMethod>,
    password_outcomes: VecDeque<AuthOutcome>,
    key_pair_outcome: Option<AuthOutcome>,
    interactive_script: VecDeque<InteractiveStep>,
    open_channel_failure: Option<EngineFailure>,
    sftp_failures: HashMap<&'static str, SftpFailure>,
    read_data: VecDeque<Vec<u8>>,
    readlink_target: String,
    connected: bool,
    next_channel: u64,
    next_attributes: u64,
    next_file: u64,
}

impl ScriptedEngine {
    /// An engine where everything succeeds.
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(VecDeque::new())),
            negotiation: default_negotiation(),
            connect_failure: None,
            auth_methods: vec![AuthMethod::Password, AuthMethod::PublicKey, AuthMethod::Interactive],
            password_outcomes: VecDeque::new(),
            key_pair_outcome: None,
            interactive_script: VecDeque::new(),
            open_channel_failure: None,
            sftp_failures: HashMap::new(),
            read_data: VecDeque::new(),
            readlink_target: "/resolved/link".to_string(),
            connected: false,
            next_channel: 1,
            next_attributes: 1,
            next_file: 1,
        }
    }

    /// Journal handle; take it before moving the engine into a session.
    pub fn journal(&self) -> CallJournal {
        CallJournal {
            calls: Arc::clone(&self.journal),
        }
    }

    /// Event injector handle; take it before moving the engine.
    pub fn event_injector(&self) -> EventInjector {
        EventInjector {
            events: Arc::clone(&self.events),
        }
    }

    /// Fail the next connect attempt with `failure`.
    pub fn with_connect_failure(mut self, failure: EngineFailure) -> Self {
        self.connect_failure = Some(failure);
        self
    }

    /// Replace the canned negotiation result.
    pub fn with_negotiation(mut self, negotiation: Negotiation) -> Self {
        self.negotiation = negotiation;
        self
    }

    /// Replace the advertised authentication methods.
    pub fn with_auth_methods(mut self, methods: Vec<AuthMethod>) -> Self {
        self.auth_methods = methods;
        self
    }

    /// Queue an outcome for a password attempt. Attempts beyond the
    /// queue succeed.
    pub fn with_password_outcome(mut self, outcome: AuthOutcome) -> Self {
        self.password_outcomes.push_back(outcome);
        self
    }

    /// Fix the outcome of public key attempts.
    pub fn with_key_pair_outcome(mut self, outcome: AuthOutcome) -> Self {
        self.key_pair_outcome = Some(outcome);
        self
    }

    /// Queue the next keyboard-interactive step. Steps beyond the queue
    /// report success.
    pub fn with_interactive_step(mut self, step: InteractiveStep) -> Self {
        self.interactive_script.push_back(step);
        self
    }

    /// Fail the next channel open with `failure`.
    pub fn with_open_channel_failure(mut self, failure: EngineFailure) -> Self {
        self.open_channel_failure = Some(failure);
        self
    }

    /// Fail every SFTP call named `operation` (`"stat"`, `"mkdir"`, ...)
    /// with `failure`.
    pub fn with_sftp_failure(mut self, operation: &'static str, failure: SftpFailure) -> Self {
        self.sftp_failures.insert(operation, failure);
        self
    }

    /// Queue a payload for the next channel read. Reads beyond the queue
    /// return no data.
    pub fn with_read_data(mut self, data: Vec<u8>) -> Self {
        self.read_data.push_back(data);
        self
    }

    fn record(&self, call: EngineCall) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(call);
        }
    }

    fn sftp_reply(&self, operation: &'static str) -> EngineSftpResult<()> {
        match self.sftp_failures.get(operation) {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SshEngine for ScriptedEngine {
    fn library_init(&self) {
        self.record(EngineCall::LibraryInit);
    }

    fn connect(
        &mut self,
        target: &ConnectTarget,
        _config: &SessionConfig,
        timeout: std::time::Duration,
    ) -> EngineResult<()> {
        let host = match target {
            ConnectTarget::HostPort { host, .. } => host.clone(),
            ConnectTarget::Descriptor(descriptor) => descriptor.to_string(),
        };
        self.record(EngineCall::Connect { host, timeout });
        if let Some(failure) = self.connect_failure.take() {
            return Err(failure);
        }
        self.connected = true;
        Ok(())
    }

    fn negotiate(&mut self) -> EngineResult<Negotiation> {
        self.record(EngineCall::Negotiate);
        Ok(self.negotiation.clone())
    }

    fn descriptor(&self) -> Option<SocketDescriptor> {
        self.connected.then_some(SocketDescriptor(9))
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.record(EngineCall::SetBlocking(blocking));
    }

    fn auth_methods(&mut self, username: &str) -> EngineResult<Vec<AuthMethod>> {
        self.record(EngineCall::AuthMethods {
            username: username.to_string(),
        });
        Ok(self.auth_methods.clone())
    }

    fn auth_password(&mut self, username: &str, _password: &str) -> EngineResult<AuthOutcome> {
        self.record(EngineCall::AuthPassword {
            username: username.to_string(),
        });
        Ok(self
            .password_outcomes
            .pop_front()
            .unwrap_or(AuthOutcome::Success))
    }

    fn auth_key_pair(&mut self, username: &str, key_pair: &KeyPair) -> EngineResult<AuthOutcome> {
        self.record(EngineCall::AuthKeyPair {
            username: username.to_string(),
            algorithm: key_pair.algorithm.clone(),
        });
        Ok(self.key_pair_outcome.clone().unwrap_or(AuthOutcome::Success))
    }

    fn auth_interactive_start(&mut self, username: &str) -> EngineResult<InteractiveStep> {
        self.record(EngineCall::AuthInteractiveStart {
            username: username.to_string(),
        });
        Ok(self
            .interactive_script
            .pop_front()
            .unwrap_or(InteractiveStep::Outcome(AuthOutcome::Success)))
    }

    fn auth_interactive_respond(&mut self, answers: &[String]) -> EngineResult<InteractiveStep> {
        self.record(EngineCall::AuthInteractiveRespond {
            answers: answers.len(),
        });
        Ok(self
            .interactive_script
            .pop_front()
            .unwrap_or(InteractiveStep::Outcome(AuthOutcome::Success)))
    }

    fn open_channel(&mut self, spec: &ChannelSpec) -> EngineResult<EngineChannelId> {
        self.record(EngineCall::OpenChannel {
            kind: spec.channel_type().to_string(),
        });
        if let Some(failure) = self.open_channel_failure.take() {
            return Err(failure);
        }
        let id = self.next_channel;
        self.next_channel += 1;
        Ok(EngineChannelId(id))
    }

    fn channel_read(&mut self, id: EngineChannelId, max_len: usize) -> EngineResult<Vec<u8>> {
        self.record(EngineCall::ChannelRead { id: id.0, max_len });
        let mut data = self.read_data.pop_front().unwrap_or_default();
        data.truncate(max_len);
        Ok(data)
    }

    fn channel_write(&mut self, id: EngineChannelId, data: &[u8]) -> EngineResult<usize> {
        self.record(EngineCall::ChannelWrite {
            id: id.0,
            len: data.len(),
        });
        Ok(data.len())
    }

    fn close_channel(&mut self, id: EngineChannelId) -> EngineResult<()> {
        self.record(EngineCall::CloseChannel { id: id.0 });
        Ok(())
    }

    fn open_sftp(&mut self) -> EngineResult<(EngineChannelId, SftpHandle)> {
        self.record(EngineCall::OpenSftp);
        let id = self.next_channel;
        self.next_channel += 1;
        Ok((EngineChannelId(id), SftpHandle(id)))
    }

    fn sftp_stat(
        &mut self,
        _sftp: SftpHandle,
        path: &str,
    ) -> EngineSftpResult<(AttributesHandle, FileAttributes)> {
        self.record(EngineCall::SftpStat {
            path: path.to_string(),
        });
        self.sftp_reply("stat")?;
        let token = self.next_attributes;
        self.next_attributes += 1;
        Ok((AttributesHandle(token), canned_attributes()))
    }

    fn sftp_canonicalize(&mut self, _sftp: SftpHandle, path: &str) -> EngineSftpResult<String> {
        self.record(EngineCall::SftpCanonicalize {
            path: path.to_string(),
        });
        self.sftp_reply("canonicalize")?;
        if path.starts_with('/') {
            Ok(path.to_string())
        } else {
            Ok(format!("/home/{path}"))
        }
    }

    fn sftp_setstat(&mut self, _sftp: SftpHandle, path: &str, mode: u32) -> EngineSftpResult<()> {
        self.record(EngineCall::SftpSetstat {
            path: path.to_string(),
            mode,
        });
        self.sftp_reply("setstat")
    }

    fn sftp_rename(&mut self, _sftp: SftpHandle, old: &str, new: &str) -> EngineSftpResult<()> {
        self.record(EngineCall::SftpRename {
            old: old.to_string(),
            new: new.to_string(),
        });
        self.sftp_reply("rename")
    }

    fn sftp_mkdir(&mut self, _sftp: SftpHandle, path: &str, mode: u32) -> EngineSftpResult<()> {
        self.record(EngineCall::SftpMkdir {
            path: path.to_string(),
            mode,
        });
        self.sftp_reply("mkdir")
    }

    fn sftp_rmdir(&mut self, _sftp: SftpHandle, path: &str) -> EngineSftpResult<()> {
        self.record(EngineCall::SftpRmdir {
            path: path.to_string(),
        });
        self.sftp_reply("rmdir")
    }

    fn sftp_unlink(&mut self, _sftp: SftpHandle, path: &str) -> EngineSftpResult<()> {
        self.record(EngineCall::SftpUnlink {
            path: path.to_string(),
        });
        self.sftp_reply("unlink")
    }

    fn sftp_symlink(
        &mut self,
        _sftp: SftpHandle,
        target: &str,
        destination: &str,
    ) -> EngineSftpResult<()> {
        self.record(EngineCall::SftpSymlink {
            target: target.to_string(),
            destination: destination.to_string(),
        });
        self.sftp_reply("symlink")
    }

    fn sftp_readlink(&mut self, _sftp: SftpHandle, path: &str) -> EngineSftpResult<String> {
        self.record(EngineCall::SftpReadlink {
            path: path.to_string(),
        });
        self.sftp_reply("readlink")?;
        Ok(self.readlink_target.clone())
    }

    fn sftp_open(
        &mut self,
        _sftp: SftpHandle,
        path: &str,
        _flags: FileOpenFlags,
        _mode: u32,
    ) -> EngineSftpResult<EngineFileId> {
        self.record(EngineCall::SftpOpen {
            path: path.to_string(),
        });
        self.sftp_reply("open")?;
        let id = self.next_file;
        self.next_file += 1;
        Ok(EngineFileId(id))
    }

    fn sftp_close(&mut self, _sftp: SftpHandle, file: EngineFileId) -> EngineSftpResult<()> {
        self.record(EngineCall::SftpCloseFile { file: file.0 });
        self.sftp_reply("close")
    }

    fn sftp_free_attributes(&mut self, _sftp: SftpHandle, attrs: AttributesHandle) {
        self.record(EngineCall::SftpFreeAttributes { token: attrs.0 });
    }

    fn sftp_shutdown(&mut self, _sftp: SftpHandle) {
        self.record(EngineCall::SftpShutdown);
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        match self.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn disconnect(&mut self) {
        self.record(EngineCall::Disconnect);
        self.connected = false;
    }
}

fn default_negotiation() -> Negotiation {
    Negotiation {
        banner: ServerBanner {
            server_software: "OpenSSH_9.6".to_string(),
            client_software: "skiff_0.1".to_string(),
            protocol_version: 2,
        },
        algorithms: NegotiatedAlgorithms {
            kex: "curve25519-sha256".to_string(),
            cipher: "chacha20-poly1305@openssh.com".to_string(),
            hmac: "hmac-sha2-256-etm@openssh.com".to_string(),
        },
        host_key: HostKey {
            kind: HostKeyKind::Ed25519,
            blob: vec![0x0b; 32],
        },
        issue_banner: None,
    }
}

fn canned_attributes() -> FileAttributes {
    FileAttributes {
        size: Some(4096),
        uid: Some(1000),
        gid: Some(1000),
        permissions: Some(FileMode(0o100644)),
        atime: Some(1_700_000_000),
        mtime: Some(1_700_000_000),
    }
}
