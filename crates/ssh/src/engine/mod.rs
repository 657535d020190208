//! Protocol engine contract.
//!
//! The runtime does not speak the SSH wire protocol itself. Everything
//! network-facing (TCP connect, key exchange, authentication exchange,
//! channel I/O, SFTP packets) is performed by an external engine behind the
//! [`SshEngine`] trait. The session worker is the only caller: every method
//! takes `&mut self`, runs synchronously, and returns a result-or-error
//! pair, so engine implementations never need their own locking.
//!
//! Engine failures come in two shapes: [`EngineFailure`] for transport,
//! auth, and channel calls (classified with the platform [`ErrorKind`]
//! taxonomy plus the engine's own numeric code), and [`SftpFailure`] for
//! SFTP calls (the raw SSH_FX status, translated one-to-one by the SFTP
//! layer).

pub mod testing;

use std::fmt;
use std::sync::Once;
use std::time::Duration;

use base64::Engine as _;
use skiff_platform::{ErrorDomain, ErrorKind, SkiffError};

use crate::channel::ChannelSpec;
use crate::config::SessionConfig;
use crate::sftp::types::{FileAttributes, FileOpenFlags, SftpError, SftpStatus};

/// A connected socket handle owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketDescriptor(pub i32);

impl fmt::Display for SocketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Where the engine should connect to.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// Resolve and dial `host:port`.
    HostPort {
        /// Remote host name or address.
        host: String,
        /// Remote port.
        port: u16,
    },
    /// Adopt an already-connected socket supplied by the caller.
    Descriptor(SocketDescriptor),
}

/// Host key families the runtime understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyKind {
    /// Unrecognized key family.
    Unknown,
    /// ssh-dss
    Dss,
    /// ssh-rsa
    Rsa,
    /// Legacy SSH-1 RSA.
    Rsa1,
    /// ECDSA over a NIST curve.
    Ecdsa,
    /// ssh-ed25519
    Ed25519,
}

impl fmt::Display for HostKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostKeyKind::Unknown => "unknown",
            HostKeyKind::Dss => "ssh-dss",
            HostKeyKind::Rsa => "ssh-rsa",
            HostKeyKind::Rsa1 => "ssh-rsa1",
            HostKeyKind::Ecdsa => "ecdsa",
            HostKeyKind::Ed25519 => "ssh-ed25519",
        };
        f.write_str(name)
    }
}

/// The host key presented by the server during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Key family.
    pub kind: HostKeyKind,
    /// Raw public key blob as received from the server.
    pub blob: Vec<u8>,
}

impl HostKey {
    /// Formats the key fingerprint for display (SHA256, base64).
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.blob);
        let hash = hasher.finalize();
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD.encode(hash)
        )
    }

    /// Fingerprint as a plain hex string.
    pub fn fingerprint_hex(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.blob);
        hex::encode(hasher.finalize())
    }

    /// The key blob encoded as base64, the way known-hosts files carry it.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.blob)
    }
}

/// Software banners exchanged during the protocol greeting.
#[derive(Debug, Clone, Default)]
pub struct ServerBanner {
    /// The server's software version string.
    pub server_software: String,
    /// The version string this side announced.
    pub client_software: String,
    /// Negotiated protocol version (2 for everything current).
    pub protocol_version: u32,
}

/// Algorithms agreed during key exchange.
#[derive(Debug, Clone, Default)]
pub struct NegotiatedAlgorithms {
    /// Key exchange algorithm.
    pub kex: String,
    /// Symmetric cipher.
    pub cipher: String,
    /// Message authentication algorithm.
    pub hmac: String,
}

/// Everything the engine learned from the handshake.
#[derive(Debug, Clone)]
pub struct Negotiation {
    /// Greeting banners.
    pub banner: ServerBanner,
    /// Negotiated algorithm suite.
    pub algorithms: NegotiatedAlgorithms,
    /// The server's host key, pending trust verification.
    pub host_key: HostKey,
    /// Pre-authentication issue banner, when the server sent one.
    pub issue_banner: Option<String>,
}

/// Authentication methods a server may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// "none" (probe only).
    None,
    /// Password authentication.
    Password,
    /// Public key authentication.
    PublicKey,
    /// Host-based authentication.
    HostBased,
    /// Keyboard-interactive authentication.
    Interactive,
    /// GSSAPI with message integrity.
    GssapiWithMic,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::HostBased => "hostbased",
            AuthMethod::Interactive => "keyboard-interactive",
            AuthMethod::GssapiWithMic => "gssapi-with-mic",
        };
        f.write_str(name)
    }
}

/// Result of one authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The user is fully authenticated.
    Success,
    /// This method succeeded but the server wants more.
    Partial {
        /// Methods that may continue the exchange.
        methods: Vec<AuthMethod>,
    },
    /// The method was rejected.
    Denied {
        /// Methods the server would still accept.
        methods: Vec<AuthMethod>,
    },
}

/// One prompt within a keyboard-interactive round.
#[derive(Debug, Clone)]
pub struct InteractivePrompt {
    /// Prompt text shown to the user.
    pub text: String,
    /// Whether the response may be echoed.
    pub echo: bool,
}

/// A batch of keyboard-interactive prompts.
#[derive(Debug, Clone)]
pub struct InteractiveRound {
    /// Round name supplied by the server.
    pub name: String,
    /// Instruction text supplied by the server.
    pub instruction: String,
    /// The individual prompts, in order.
    pub prompts: Vec<InteractivePrompt>,
}

/// Next step of a keyboard-interactive exchange.
#[derive(Debug, Clone)]
pub enum InteractiveStep {
    /// The server wants answers to these prompts.
    Prompts(InteractiveRound),
    /// The exchange finished with this outcome.
    Outcome(AuthOutcome),
}

/// A private key pair handed to the engine for public key authentication.
///
/// The material is opaque to the runtime; the engine decides how to parse
/// it. Secret bytes are wiped when the value is dropped.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct KeyPair {
    /// Key algorithm name (e.g. "ssh-ed25519").
    pub algorithm: String,
    /// Encoded private key material.
    pub material: Vec<u8>,
    /// Passphrase protecting the material, if any.
    pub passphrase: Option<String>,
}

// Manual Debug so key material never reaches a log line.
impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("material", &format_args!("<{} bytes>", self.material.len()))
            .field("passphrase", &self.passphrase.is_some())
            .finish()
    }
}

/// Engine identifier for an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineChannelId(pub u64);

/// Engine identifier for an SFTP subsystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SftpHandle(pub u64);

/// Engine identifier for a pooled attribute structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributesHandle(pub u64);

/// Engine identifier for an open remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineFileId(pub u64);

/// A failure reported by the engine for a non-SFTP call.
#[derive(Debug, Clone)]
pub struct EngineFailure {
    /// Classification within the platform taxonomy.
    pub kind: ErrorKind,
    /// The engine's own numeric error code.
    pub code: i32,
    /// Human readable description.
    pub message: String,
}

impl EngineFailure {
    /// Creates a failure.
    pub fn new(kind: ErrorKind, code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Translate into a [`SkiffError`] attributed to `domain`.
    pub fn into_error(self, domain: ErrorDomain) -> SkiffError {
        SkiffError::new(domain, self.kind, self.message).with_engine_code(self.code)
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine failure ({}, code {}): {}", self.kind, self.code, self.message)
    }
}

impl std::error::Error for EngineFailure {}

/// Result type for non-SFTP engine calls.
pub type EngineResult<T> = Result<T, EngineFailure>;

/// A failure reported by the engine for an SFTP call.
#[derive(Debug, Clone)]
pub struct SftpFailure {
    /// Raw SSH_FX status.
    pub status: u32,
    /// Human readable description; empty means use the status table.
    pub message: String,
}

impl SftpFailure {
    /// Creates a failure from a raw status.
    pub fn new(status: u32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Translate into an [`SftpError`], preserving the raw status.
    pub fn into_error(self) -> SftpError {
        SftpError::remote(SftpStatus::from_raw(self.status), self.message)
    }
}

impl fmt::Display for SftpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sftp failure (status {}): {}", self.status, self.message)
    }
}

impl std::error::Error for SftpFailure {}

/// Result type for SFTP engine calls.
pub type EngineSftpResult<T> = Result<T, SftpFailure>;

/// Out-of-band happenings the engine reports between calls.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The server opened a forwarded channel towards us.
    ForwardChannelOpened {
        /// Engine identifier of the already-open channel.
        id: EngineChannelId,
        /// The listening port the connection arrived on.
        destination_port: u16,
        /// Originator address reported by the server.
        originator_host: String,
        /// Originator port reported by the server.
        originator_port: u16,
    },
    /// The peer closed a channel.
    ChannelClosed {
        /// Engine identifier of the closed channel.
        id: EngineChannelId,
    },
    /// A channel failed asynchronously.
    ChannelFault {
        /// Engine identifier of the faulted channel.
        id: EngineChannelId,
        /// What went wrong.
        failure: EngineFailure,
    },
    /// The transport died; the session is no longer usable.
    TransportLost {
        /// What went wrong.
        failure: EngineFailure,
    },
}

/// The external SSH protocol engine.
///
/// Implementations perform all wire I/O. Calls arrive exclusively from the
/// owning session's serial worker, one at a time, so `&mut self` is safe
/// without interior locking. Calls must not park the thread indefinitely;
/// the engine is expected to honor the timeouts it is given.
pub trait SshEngine: Send {
    /// Process-wide library initialization hook.
    ///
    /// Run exactly once per process, before the first engine call, guarded
    /// by the runtime. The default does nothing.
    fn library_init(&self) {}

    /// Establish the transport connection.
    ///
    /// `Duration::ZERO` means the engine's default connect timeout.
    fn connect(
        &mut self,
        target: &ConnectTarget,
        config: &SessionConfig,
        timeout: Duration,
    ) -> EngineResult<()>;

    /// Run the protocol greeting and key exchange.
    fn negotiate(&mut self) -> EngineResult<Negotiation>;

    /// The connected socket, once the transport is up.
    fn descriptor(&self) -> Option<SocketDescriptor>;

    /// Switch the transport between blocking and non-blocking mode.
    fn set_blocking(&mut self, blocking: bool);

    /// Probe which authentication methods the server accepts for `username`.
    fn auth_methods(&mut self, username: &str) -> EngineResult<Vec<AuthMethod>>;

    /// Run one password authentication exchange.
    fn auth_password(&mut self, username: &str, password: &str) -> EngineResult<AuthOutcome>;

    /// Run one public key authentication exchange.
    fn auth_key_pair(&mut self, username: &str, key_pair: &KeyPair) -> EngineResult<AuthOutcome>;

    /// Begin a keyboard-interactive exchange.
    fn auth_interactive_start(&mut self, username: &str) -> EngineResult<InteractiveStep>;

    /// Answer the current keyboard-interactive round.
    fn auth_interactive_respond(&mut self, answers: &[String]) -> EngineResult<InteractiveStep>;

    /// Open a channel described by `spec`.
    fn open_channel(&mut self, spec: &ChannelSpec) -> EngineResult<EngineChannelId>;

    /// Read up to `max_len` bytes from a channel.
    fn channel_read(&mut self, id: EngineChannelId, max_len: usize) -> EngineResult<Vec<u8>>;

    /// Write bytes to a channel, returning how many were accepted.
    fn channel_write(&mut self, id: EngineChannelId, data: &[u8]) -> EngineResult<usize>;

    /// Close a channel at the protocol level.
    fn close_channel(&mut self, id: EngineChannelId) -> EngineResult<()>;

    /// Open a session channel and complete the SFTP subsystem handshake.
    fn open_sftp(&mut self) -> EngineResult<(EngineChannelId, SftpHandle)>;

    /// Stat a path. The attribute structure stays pooled inside the engine
    /// until released with [`SshEngine::sftp_free_attributes`].
    fn sftp_stat(
        &mut self,
        sftp: SftpHandle,
        path: &str,
    ) -> EngineSftpResult<(AttributesHandle, FileAttributes)>;

    /// Resolve a path to its canonical absolute form.
    fn sftp_canonicalize(&mut self, sftp: SftpHandle, path: &str) -> EngineSftpResult<String>;

    /// Change permission bits on a path.
    fn sftp_setstat(&mut self, sftp: SftpHandle, path: &str, mode: u32) -> EngineSftpResult<()>;

    /// Rename a path.
    fn sftp_rename(&mut self, sftp: SftpHandle, old: &str, new: &str) -> EngineSftpResult<()>;

    /// Create a directory.
    fn sftp_mkdir(&mut self, sftp: SftpHandle, path: &str, mode: u32) -> EngineSftpResult<()>;

    /// Remove a directory.
    fn sftp_rmdir(&mut self, sftp: SftpHandle, path: &str) -> EngineSftpResult<()>;

    /// Remove a file.
    fn sftp_unlink(&mut self, sftp: SftpHandle, path: &str) -> EngineSftpResult<()>;

    /// Create a symbolic link at `destination` pointing to `target`.
    fn sftp_symlink(
        &mut self,
        sftp: SftpHandle,
        target: &str,
        destination: &str,
    ) -> EngineSftpResult<()>;

    /// Read the target of a symbolic link.
    fn sftp_readlink(&mut self, sftp: SftpHandle, path: &str) -> EngineSftpResult<String>;

    /// Open a remote file.
    fn sftp_open(
        &mut self,
        sftp: SftpHandle,
        path: &str,
        flags: FileOpenFlags,
        mode: u32,
    ) -> EngineSftpResult<EngineFileId>;

    /// Close a remote file.
    fn sftp_close(&mut self, sftp: SftpHandle, file: EngineFileId) -> EngineSftpResult<()>;

    /// Return a pooled attribute structure to the engine.
    fn sftp_free_attributes(&mut self, sftp: SftpHandle, attrs: AttributesHandle);

    /// Tear down the SFTP subsystem instance.
    fn sftp_shutdown(&mut self, sftp: SftpHandle);

    /// Collect events that arrived since the last call.
    fn drain_events(&mut self) -> Vec<EngineEvent>;

    /// Drop the transport. Must be safe to call in any state.
    fn disconnect(&mut self);
}

static LIBRARY_INIT: Once = Once::new();

/// Run the engine's process-wide initializer exactly once.
pub(crate) fn run_library_init(engine: &dyn SshEngine) {
    LIBRARY_INIT.call_once(|| {
        tracing::debug!("running engine library initialization");
        engine.library_init();
    });
}
