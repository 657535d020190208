//! The SFTP channel: typed path operations over an open channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use skiff_platform::SkiffResult;
use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelId, ChannelStage};
use crate::engine::AttributesHandle;
use crate::session::{SessionCommand, SessionShared};
use crate::sftp::request::{
    RequestRegistry, RequestShared, SftpCallbacks, SftpOperation, SftpOutcome, SftpRequest,
};
use crate::sftp::types::{FileAttributes, FileExistence, FileMode, FileOpenFlags, SftpError};

/// Stat attributes paired with the engine-side allocation backing them.
///
/// Not clonable: the token represents ownership of that allocation, which
/// is released through [`SftpChannel::free_attributes`] or, as a
/// backstop, when the channel closes.
#[derive(Debug)]
pub struct RawAttributes {
    token: AttributesHandle,
    attributes: FileAttributes,
}

impl RawAttributes {
    pub(crate) fn new(token: AttributesHandle, attributes: FileAttributes) -> Self {
        Self { token, attributes }
    }

    /// The engine-side allocation token.
    pub fn token(&self) -> AttributesHandle {
        self.token
    }

    /// The decoded attributes.
    pub fn attributes(&self) -> &FileAttributes {
        &self.attributes
    }
}

/// An open remote file.
///
/// Stays usable until closed through [`SftpChannel::close_file`], or
/// force-invalidated when the owning channel closes; after either,
/// [`RemoteFile::is_valid`] reports false.
pub struct RemoteFile {
    id: u64,
    path: String,
    valid: Arc<AtomicBool>,
}

impl RemoteFile {
    /// The path the file was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// False once the handle was closed or force-invalidated.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A channel running the SFTP subsystem.
///
/// Obtained from
/// [`Session::open_sftp_channel`](crate::session::Session::open_sftp_channel).
/// Path operations come in two flavors: async methods that resolve with
/// the result, and [`SftpChannel::enqueue`], which returns an
/// [`SftpRequest`] driving the same operation through completion
/// callbacks.
pub struct SftpChannel {
    channel: Channel,
    requests: RequestRegistry,
}

impl SftpChannel {
    pub(crate) fn new(channel: Channel, requests: RequestRegistry) -> Self {
        Self { channel, requests }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Channel identifier.
    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Current channel stage.
    pub fn stage(&self) -> ChannelStage {
        self.channel.stage()
    }

    fn shared(&self) -> Result<Arc<SessionShared>, SftpError> {
        self.channel
            .shared()
            .map_err(|_| SftpError::invalid_state("owning session has been released"))
    }

    async fn execute(&self, operation: SftpOperation) -> Result<SftpOutcome, SftpError> {
        let shared = self.shared()?;
        let (tx, rx) = oneshot::channel();
        shared
            .send(SessionCommand::SftpExecute {
                channel: self.channel.id(),
                operation,
                reply: tx,
            })
            .map_err(|_| worker_gone())?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(worker_gone()),
        }
    }

    /// Check whether `path` exists on the server.
    ///
    /// Never fails: a missing file reports `NotExists`, and any error,
    /// including an unusable channel, collapses to `Unknown`.
    pub async fn file_exists(&self, path: &str) -> FileExistence {
        let operation = SftpOperation::Exists {
            path: path.to_string(),
        };
        match self.execute(operation).await {
            Ok(SftpOutcome::Existence(existence)) => existence,
            Ok(_) | Err(_) => FileExistence::Unknown,
        }
    }

    /// Fetch the attributes of `path`.
    ///
    /// The returned [`RawAttributes`] owns an engine-side allocation;
    /// hand it back with [`SftpChannel::free_attributes`] when done.
    pub async fn stat(&self, path: &str) -> Result<RawAttributes, SftpError> {
        let operation = SftpOperation::Stat {
            path: path.to_string(),
        };
        match self.execute(operation).await? {
            SftpOutcome::Attributes(attributes) => Ok(attributes),
            other => Err(mismatched(&other)),
        }
    }

    /// Release the engine-side allocation behind `attributes`.
    pub async fn free_attributes(&self, attributes: RawAttributes) -> Result<(), SftpError> {
        let shared = self.shared()?;
        let (tx, rx) = oneshot::channel();
        shared
            .send(SessionCommand::SftpFreeAttributes {
                channel: self.channel.id(),
                attributes: attributes.token(),
                reply: tx,
            })
            .map_err(|_| worker_gone())?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(worker_gone()),
        }
    }

    /// Resolve `path` to its canonical server-side form.
    pub async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        let operation = SftpOperation::Canonicalize {
            path: path.to_string(),
        };
        expect_path(self.execute(operation).await?)
    }

    /// Read the target of the symlink at `path`.
    pub async fn readlink(&self, path: &str) -> Result<String, SftpError> {
        let operation = SftpOperation::Readlink {
            path: path.to_string(),
        };
        expect_path(self.execute(operation).await?)
    }

    /// Change the permission bits of `path`.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let operation = SftpOperation::Chmod {
            path: path.to_string(),
            mode,
        };
        expect_unit(self.execute(operation).await?)
    }

    /// Rename `old_path` to `new_path`.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        let operation = SftpOperation::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        };
        expect_unit(self.execute(operation).await?)
    }

    /// Create the directory `path` with default permissions.
    pub async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.mkdir_with_mode(path, FileMode::DEFAULT_DIR).await
    }

    /// Create the directory `path` with explicit permission bits.
    pub async fn mkdir_with_mode(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let operation = SftpOperation::Mkdir {
            path: path.to_string(),
            mode,
        };
        expect_unit(self.execute(operation).await?)
    }

    /// Remove the directory `path`.
    pub async fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        let operation = SftpOperation::Rmdir {
            path: path.to_string(),
        };
        expect_unit(self.execute(operation).await?)
    }

    /// Remove the file `path`.
    pub async fn unlink(&self, path: &str) -> Result<(), SftpError> {
        let operation = SftpOperation::Unlink {
            path: path.to_string(),
        };
        expect_unit(self.execute(operation).await?)
    }

    /// Create a symlink at `destination` pointing to `target`.
    pub async fn symlink(&self, target: &str, destination: &str) -> Result<(), SftpError> {
        let operation = SftpOperation::Symlink {
            target: target.to_string(),
            destination: destination.to_string(),
        };
        expect_unit(self.execute(operation).await?)
    }

    /// Queue `operation` and return the request tracking it.
    ///
    /// The request starts on the session worker in enqueue order; its
    /// callbacks fire on the session's callback queue. Fails only when
    /// the owning session is gone.
    pub fn enqueue(
        &self,
        operation: SftpOperation,
        callbacks: SftpCallbacks,
    ) -> SkiffResult<SftpRequest> {
        let shared = self.channel.shared()?;
        let request = RequestShared::new(
            self.channel.id(),
            operation,
            callbacks,
            Arc::clone(shared.callback_queue()),
            shared.config().cancelled_failure_policy,
        );
        if let Ok(mut registry) = self.requests.lock() {
            registry.push(Arc::clone(&request));
        }
        if let Err(error) = shared.send(SessionCommand::SftpStart {
            request: Arc::clone(&request),
        }) {
            // The worker will never see the request; settle it here so it
            // does not sit in the registry as `Created` forever.
            request.cancel();
            if let Ok(mut registry) = self.requests.lock() {
                registry.retain(|queued| !Arc::ptr_eq(queued, &request));
            }
            return Err(error);
        }
        Ok(SftpRequest::new(request))
    }

    /// Open the remote file at `path`.
    pub async fn open_file(
        &self,
        path: &str,
        flags: FileOpenFlags,
        mode: u32,
    ) -> Result<RemoteFile, SftpError> {
        let shared = self.shared()?;
        let (tx, rx) = oneshot::channel();
        shared
            .send(SessionCommand::SftpOpenFile {
                channel: self.channel.id(),
                path: path.to_string(),
                flags,
                mode,
                reply: tx,
            })
            .map_err(|_| worker_gone())?;
        let (id, valid) = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(worker_gone()),
        };
        Ok(RemoteFile {
            id,
            path: path.to_string(),
            valid,
        })
    }

    /// Close `file`, releasing its server-side handle. Closing a file
    /// that was already invalidated is a no-op.
    pub async fn close_file(&self, file: &RemoteFile) -> Result<(), SftpError> {
        let shared = self.shared()?;
        let (tx, rx) = oneshot::channel();
        shared
            .send(SessionCommand::SftpCloseFile {
                channel: self.channel.id(),
                file: file.id(),
                reply: tx,
            })
            .map_err(|_| worker_gone())?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(worker_gone()),
        }
    }

    /// Close the channel. Outstanding requests are cancelled and every
    /// open remote file is invalidated first.
    pub async fn close(&self) -> SkiffResult<()> {
        self.channel.close().await
    }
}

impl fmt::Debug for SftpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpChannel")
            .field("id", &self.channel.id())
            .field("stage", &self.channel.stage())
            .finish()
    }
}

fn worker_gone() -> SftpError {
    SftpError::invalid_state("session worker terminated")
}

fn mismatched(outcome: &SftpOutcome) -> SftpError {
    SftpError::invalid_state(format!("mismatched outcome {outcome:?} for this operation"))
}

fn expect_unit(outcome: SftpOutcome) -> Result<(), SftpError> {
    match outcome {
        SftpOutcome::Unit => Ok(()),
        other => Err(mismatched(&other)),
    }
}

fn expect_path(outcome: SftpOutcome) -> Result<String, SftpError> {
    match outcome {
        SftpOutcome::Path(path) => Ok(path),
        other => Err(mismatched(&other)),
    }
}
