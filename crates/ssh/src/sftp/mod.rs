//! SFTP subsystem support.
//!
//! [`SftpChannel`] layers typed path operations over an open channel:
//! existence probes, stat, rename, directory and link management, and
//! remote file handles. Operations either resolve as futures or run as
//! queued [`SftpRequest`]s with completion callbacks and cancellation.
//!
//! Errors keep the server's view intact: every failure carries an
//! [`SftpErrorKind`], and remote failures preserve the raw protocol
//! status they were derived from.

pub mod channel;
pub mod request;
pub mod types;

pub use channel::{RawAttributes, RemoteFile, SftpChannel};
pub use request::{RequestState, SftpCallbacks, SftpOperation, SftpOutcome, SftpRequest};
pub use types::{
    FileAttributes, FileExistence, FileMode, FileOpenFlags, FileType, SftpError, SftpErrorKind,
    SftpStatus,
};
