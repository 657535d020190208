//! Channels multiplexed over a session.
//!
//! A [`Channel`] value is a caller-side handle: the authoritative record
//! (engine identifier, stage, SFTP bookkeeping) lives inside the session
//! worker, and every operation here is marshalled onto the session's
//! serial context. Handles hold only a weak back-reference to the session,
//! so a channel can never keep a released session alive.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use skiff_platform::{ErrorKind, SkiffError, SkiffResult};
use tokio::sync::oneshot;

use crate::session::{SessionCommand, SessionShared};

/// Identifier of a channel within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// The flavor of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Locally initiated direct-tcpip tunnel.
    Direct,
    /// Server-initiated forwarded-tcpip channel.
    Forward,
    /// Remote command execution.
    Exec,
    /// Interactive shell.
    Shell,
    /// SCP transfer.
    Scp,
    /// The SFTP subsystem, opened through the dedicated SFTP path.
    Sftp,
    /// Generic subsystem. Unsupported; creation is rejected.
    Subsystem,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::Direct => "direct-tcpip",
            ChannelType::Forward => "forwarded-tcpip",
            ChannelType::Exec => "exec",
            ChannelType::Shell => "shell",
            ChannelType::Scp => "scp",
            ChannelType::Sftp => "sftp",
            ChannelType::Subsystem => "subsystem",
        };
        f.write_str(name)
    }
}

/// Lifecycle stage of a channel.
///
/// The forward path is strict — no stage is ever skipped — and `Closed`
/// is terminal. Teardown (`→ Closed`) is reachable from every live stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelStage {
    /// Not correctly initialized yet.
    Invalid = 0,
    /// Created locally, not yet opening.
    Created = 1,
    /// Open request in flight.
    Opening = 2,
    /// Open and usable for I/O.
    ReadWrite = 3,
    /// Closed. Terminal.
    Closed = 4,
}

impl ChannelStage {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: ChannelStage) -> bool {
        matches!(
            (self, next),
            (ChannelStage::Invalid, ChannelStage::Created)
                | (ChannelStage::Created, ChannelStage::Opening)
                | (ChannelStage::Opening, ChannelStage::ReadWrite)
        ) || (next == ChannelStage::Closed && self != ChannelStage::Closed)
    }

    /// True once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self == ChannelStage::Closed
    }

    pub(crate) fn from_u8(value: u8) -> ChannelStage {
        match value {
            1 => ChannelStage::Created,
            2 => ChannelStage::Opening,
            3 => ChannelStage::ReadWrite,
            4 => ChannelStage::Closed,
            _ => ChannelStage::Invalid,
        }
    }
}

impl fmt::Display for ChannelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelStage::Invalid => "invalid",
            ChannelStage::Created => "created",
            ChannelStage::Opening => "opening",
            ChannelStage::ReadWrite => "read-write",
            ChannelStage::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared stage cell: the worker writes, handles read.
#[derive(Debug)]
pub(crate) struct ChannelStageCell(AtomicU8);

impl ChannelStageCell {
    pub(crate) fn new(stage: ChannelStage) -> Self {
        Self(AtomicU8::new(stage as u8))
    }

    pub(crate) fn load(&self) -> ChannelStage {
        ChannelStage::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, stage: ChannelStage) {
        self.0.store(stage as u8, Ordering::SeqCst);
    }
}

/// Open parameters, per channel flavor. Interpreted by the engine.
#[derive(Debug, Clone)]
pub enum ChannelSpec {
    /// direct-tcpip tunnel to `target_host:target_port`.
    Direct {
        /// Remote host to connect to.
        target_host: String,
        /// Remote port to connect to.
        target_port: u16,
        /// Originator address announced to the server.
        originator_host: String,
        /// Originator port announced to the server.
        originator_port: u16,
    },
    /// Run a single remote command.
    Exec {
        /// Command line to execute.
        command: String,
    },
    /// Interactive shell with a requested PTY geometry.
    Shell {
        /// Terminal type (e.g. "xterm-256color").
        terminal: String,
        /// Width in columns.
        columns: u32,
        /// Height in rows.
        rows: u32,
    },
    /// SCP transfer rooted at `path`.
    Scp {
        /// Remote path the transfer operates on.
        path: String,
    },
    /// Generic subsystem by name. Rejected at creation.
    Subsystem {
        /// Subsystem name.
        name: String,
    },
}

impl ChannelSpec {
    /// The channel flavor this spec produces.
    pub fn channel_type(&self) -> ChannelType {
        match self {
            ChannelSpec::Direct { .. } => ChannelType::Direct,
            ChannelSpec::Exec { .. } => ChannelType::Exec,
            ChannelSpec::Shell { .. } => ChannelType::Shell,
            ChannelSpec::Scp { .. } => ChannelType::Scp,
            ChannelSpec::Subsystem { .. } => ChannelType::Subsystem,
        }
    }
}

/// Connection details of a server-initiated forwarded channel.
#[derive(Debug, Clone)]
pub struct ForwardedChannelInfo {
    /// The listening port the connection arrived on.
    pub destination_port: u16,
    /// Originator address reported by the server.
    pub originator_host: String,
    /// Originator port reported by the server.
    pub originator_port: u16,
}

/// Caller-side handle to a channel.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    channel_type: ChannelType,
    stage: Arc<ChannelStageCell>,
    session: Weak<SessionShared>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        channel_type: ChannelType,
        stage: Arc<ChannelStageCell>,
        session: Weak<SessionShared>,
    ) -> Self {
        Self {
            id,
            channel_type,
            stage,
            session,
        }
    }

    /// Identifier of this channel within its session.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The channel flavor.
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> ChannelStage {
        self.stage.load()
    }

    pub(crate) fn shared(&self) -> SkiffResult<Arc<SessionShared>> {
        self.session.upgrade().ok_or_else(|| {
            SkiffError::channel(ErrorKind::Fatal, "owning session has been released")
        })
    }

    /// Read up to `max_len` bytes.
    ///
    /// Fails with an invalid-state error unless the channel is in
    /// [`ChannelStage::ReadWrite`].
    pub async fn read(&self, max_len: usize) -> SkiffResult<Vec<u8>> {
        let shared = self.shared()?;
        let (tx, rx) = oneshot::channel();
        shared.send(SessionCommand::ChannelRead {
            id: self.id,
            max_len,
            reply: tx,
        })?;
        await_reply(rx).await
    }

    /// Write bytes, returning how many the engine accepted.
    ///
    /// Fails with an invalid-state error unless the channel is in
    /// [`ChannelStage::ReadWrite`].
    pub async fn write(&self, data: &[u8]) -> SkiffResult<usize> {
        let shared = self.shared()?;
        let (tx, rx) = oneshot::channel();
        shared.send(SessionCommand::ChannelWrite {
            id: self.id,
            data: data.to_vec(),
            reply: tx,
        })?;
        await_reply(rx).await
    }

    /// Close the channel. Idempotent from every stage.
    ///
    /// Channels that never reached [`ChannelStage::ReadWrite`] close
    /// immediately with no protocol teardown; a released session counts as
    /// already torn down.
    pub async fn close(&self) -> SkiffResult<()> {
        let shared = match self.session.upgrade() {
            Some(shared) => shared,
            None => {
                // Worker is gone; nothing left to tear down.
                self.stage.store(ChannelStage::Closed);
                return Ok(());
            }
        };
        let (tx, rx) = oneshot::channel();
        shared.send(SessionCommand::ChannelClose {
            id: self.id,
            reply: Some(tx),
        })?;
        await_reply(rx).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("type", &self.channel_type)
            .field("stage", &self.stage.load())
            .finish()
    }
}

pub(crate) async fn await_reply<T>(rx: oneshot::Receiver<SkiffResult<T>>) -> SkiffResult<T> {
    rx.await
        .map_err(|_| SkiffError::channel(ErrorKind::Fatal, "session worker terminated"))?
}
