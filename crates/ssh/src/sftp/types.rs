//! SFTP data types shared by the channel and request layers.

use skiff_platform::{ErrorKind, SkiffError};

/// SFTP status codes (SSH_FX_*) as reported by the protocol engine.
///
/// Statuses outside the classic 0..=8 range are preserved verbatim in
/// [`SftpStatus::Unknown`] so nothing the engine reports is ever lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SftpStatus {
    /// SSH_FX_OK - Success
    Ok,
    /// SSH_FX_EOF - End of file
    Eof,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied,
    /// SSH_FX_FAILURE - General failure
    Failure,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported,
    /// Any status outside the classic range, preserved as-is.
    Unknown(u32),
}

impl SftpStatus {
    /// Convert from the engine's raw numeric status.
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            other => Self::Unknown(other),
        }
    }

    /// The raw numeric status.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Eof => 1,
            Self::NoSuchFile => 2,
            Self::PermissionDenied => 3,
            Self::Failure => 4,
            Self::BadMessage => 5,
            Self::NoConnection => 6,
            Self::ConnectionLost => 7,
            Self::OpUnsupported => 8,
            Self::Unknown(v) => *v,
        }
    }

    /// Returns the descriptive message for this status.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
            Self::Unknown(_) => "Unknown status",
        }
    }

    /// True if the session behind the subsystem is gone.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::NoConnection | Self::ConnectionLost)
    }
}

impl std::fmt::Display for SftpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.raw())
    }
}

/// Classification of an SFTP failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SftpErrorKind {
    /// The channel was not in read-write stage when the operation was issued.
    InvalidState,

    /// The path was empty or malformed; rejected before any engine call.
    InvalidPath,

    /// The SFTP subsystem handle was invalidated by a channel close.
    SubsystemLost,

    /// A status reported by the engine, translated one-to-one.
    Remote(SftpStatus),
}

impl std::fmt::Display for SftpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SftpErrorKind::InvalidState => write!(f, "invalid-state"),
            SftpErrorKind::InvalidPath => write!(f, "invalid-path"),
            SftpErrorKind::SubsystemLost => write!(f, "subsystem-lost"),
            SftpErrorKind::Remote(status) => write!(f, "status {}", status.raw()),
        }
    }
}

/// SFTP error.
#[derive(Debug, Clone)]
pub struct SftpError {
    kind: SftpErrorKind,
    message: String,
}

impl SftpError {
    /// Creates an error with an explicit kind.
    pub fn new(kind: SftpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Channel not ready for SFTP traffic.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::InvalidState, message)
    }

    /// Empty or malformed path.
    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::InvalidPath, message)
    }

    /// Subsystem handle invalidated underneath the operation.
    pub fn subsystem_lost(message: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::SubsystemLost, message)
    }

    /// Translate an engine-reported status, preserving the raw code.
    pub fn remote(status: SftpStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            status.message().to_string()
        } else {
            message
        };
        Self::new(SftpErrorKind::Remote(status), message)
    }

    /// The classification of this error.
    pub fn kind(&self) -> SftpErrorKind {
        self.kind
    }

    /// Human readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The engine-reported status, if this error came from the engine.
    pub fn status(&self) -> Option<SftpStatus> {
        match self.kind {
            SftpErrorKind::Remote(status) => Some(status),
            _ => None,
        }
    }

    /// The raw numeric status, if this error came from the engine.
    pub fn raw_status(&self) -> Option<u32> {
        self.status().map(|s| s.raw())
    }
}

impl std::fmt::Display for SftpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SFTP error ({}): {}", self.kind, self.message)
    }
}

impl std::error::Error for SftpError {}

impl From<SftpError> for SkiffError {
    fn from(err: SftpError) -> Self {
        let kind = match err.kind {
            SftpErrorKind::SubsystemLost => ErrorKind::Fatal,
            SftpErrorKind::Remote(status) if status.is_connection_fault() => ErrorKind::Fatal,
            _ => ErrorKind::Generic,
        };
        let skiff = SkiffError::channel(kind, err.message.clone());
        match err.raw_status() {
            Some(raw) => skiff.with_engine_code(raw as i32),
            None => skiff,
        }
    }
}

/// Tri-state result of an existence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileExistence {
    /// The path exists.
    Exists,
    /// The path does not exist.
    NotExists,
    /// The probe itself failed; existence could not be determined.
    Unknown,
}

/// File type, derived from the permission bits when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Special file
    Special,
    /// Unknown type
    Unknown,
}

/// File open flags (SSH_FXF_*), passed through to the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOpenFlags(pub u32);

impl FileOpenFlags {
    /// SSH_FXF_READ - Open for reading
    pub const READ: u32 = 0x00000001;
    /// SSH_FXF_WRITE - Open for writing
    pub const WRITE: u32 = 0x00000002;
    /// SSH_FXF_APPEND - Force writes to append
    pub const APPEND: u32 = 0x00000004;
    /// SSH_FXF_CREAT - Create if doesn't exist
    pub const CREAT: u32 = 0x00000008;
    /// SSH_FXF_TRUNC - Truncate to 0 length
    pub const TRUNC: u32 = 0x00000010;
    /// SSH_FXF_EXCL - Fail if file exists
    pub const EXCL: u32 = 0x00000020;
}

/// File mode (permissions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Default file permissions (0644 = rw-r--r--)
    pub const DEFAULT_FILE: u32 = 0o644;
    /// Default directory permissions (0755 = rwxr-xr-x)
    pub const DEFAULT_DIR: u32 = 0o755;

    const TYPE_MASK: u32 = 0o170000;
    const TYPE_DIR: u32 = 0o040000;
    const TYPE_REGULAR: u32 = 0o100000;
    const TYPE_SYMLINK: u32 = 0o120000;

    /// Derive the file type from the type bits, if any are set.
    pub fn file_type(&self) -> FileType {
        match self.0 & Self::TYPE_MASK {
            0 => FileType::Unknown,
            Self::TYPE_DIR => FileType::Directory,
            Self::TYPE_REGULAR => FileType::Regular,
            Self::TYPE_SYMLINK => FileType::Symlink,
            _ => FileType::Special,
        }
    }
}

/// File attributes as decoded by the engine.
///
/// Fields the server did not send are `None`. The engine keeps its own
/// pooled copy of the raw structure; see `RawAttributes` for the ownership
/// rules around freeing it.
#[derive(Debug, Clone, Default)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// User ID
    pub uid: Option<u32>,
    /// Group ID
    pub gid: Option<u32>,
    /// Permissions
    pub permissions: Option<FileMode>,
    /// Access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Modification time (Unix timestamp)
    pub mtime: Option<u32>,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// The file type carried in the permission bits, if present.
    pub fn file_type(&self) -> FileType {
        self.permissions
            .map(|mode| mode.file_type())
            .unwrap_or(FileType::Unknown)
    }
}
