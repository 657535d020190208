//! Error types for the skiff runtime

use std::fmt;

/// Layer of the runtime an error is attributed to.
///
/// Errors surface from three places: the external protocol engine (raw
/// transport and SFTP failures), the session lifecycle itself, and
/// individual channels. The domain is carried alongside the kind so a
/// caller can tell a failed handshake from a failed channel write without
/// parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// The external SSH protocol engine.
    Engine,

    /// Session lifecycle (connect, host-key verification, authentication).
    Session,

    /// A single channel or the SFTP subsystem on top of it.
    Channel,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Engine => write!(f, "engine"),
            ErrorDomain::Session => write!(f, "session"),
            ErrorDomain::Channel => write!(f, "channel"),
        }
    }
}

/// Classification of a failure, independent of the domain it arose in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation did not complete within its deadline.
    Timeout,

    /// Failure with no more specific classification.
    Generic,

    /// The negotiated host key was rejected or did not match.
    HostKey,

    /// Credentials were rejected or all methods were exhausted.
    Auth,

    /// Transient condition; the same operation is safe to retry.
    Retry,

    /// The session is no longer usable and must disconnect.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Generic => write!(f, "generic"),
            ErrorKind::HostKey => write!(f, "host-key"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::Retry => write!(f, "retry"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Unified error type for all skiff operations.
///
/// Every failure carries a [`ErrorDomain`], an [`ErrorKind`], a human
/// readable message, and, when the failure originated inside the protocol
/// engine, the engine's own numeric code.
#[derive(Debug, Clone)]
pub struct SkiffError {
    domain: ErrorDomain,
    kind: ErrorKind,
    message: String,
    engine_code: Option<i32>,
}

impl SkiffError {
    /// Create an error with an explicit domain and kind.
    pub fn new(domain: ErrorDomain, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            domain,
            kind,
            message: message.into(),
            engine_code: None,
        }
    }

    /// Create a session-domain error.
    pub fn session(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Session, kind, message)
    }

    /// Create a channel-domain error.
    pub fn channel(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Channel, kind, message)
    }

    /// Create an engine-domain error.
    pub fn engine(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Engine, kind, message)
    }

    /// Attach the underlying engine error code.
    pub fn with_engine_code(mut self, code: i32) -> Self {
        self.engine_code = Some(code);
        self
    }

    /// The domain this error is attributed to.
    pub fn domain(&self) -> ErrorDomain {
        self.domain
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The engine's own numeric code, when the engine reported one.
    pub fn engine_code(&self) -> Option<i32> {
        self.engine_code
    }

    /// True if the session cannot be used after this error.
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    /// True if the same operation is safe to retry.
    pub fn should_retry(&self) -> bool {
        self.kind == ErrorKind::Retry
    }
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error ({}): {}", self.domain, self.kind, self.message)?;
        if let Some(code) = self.engine_code {
            write!(f, " [engine code {}]", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for SkiffError {}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            std::io::ErrorKind::Interrupted => ErrorKind::Retry,
            _ => ErrorKind::Generic,
        };
        SkiffError::engine(kind, err.to_string())
    }
}

/// Result type for skiff operations.
pub type SkiffResult<T> = Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkiffError::session(ErrorKind::Auth, "all methods exhausted");
        assert_eq!(err.to_string(), "session error (auth): all methods exhausted");
    }

    #[test]
    fn test_engine_code_display() {
        let err = SkiffError::engine(ErrorKind::Fatal, "connection reset").with_engine_code(-5);
        assert_eq!(
            err.to_string(),
            "engine error (fatal): connection reset [engine code -5]"
        );
        assert_eq!(err.engine_code(), Some(-5));
    }

    #[test]
    fn test_predicates() {
        assert!(SkiffError::session(ErrorKind::Fatal, "gone").is_fatal());
        assert!(!SkiffError::session(ErrorKind::Auth, "nope").is_fatal());
        assert!(SkiffError::channel(ErrorKind::Retry, "eagain").should_retry());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
        let err: SkiffError = io_err.into();
        assert_eq!(err.domain(), ErrorDomain::Engine);
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_result_type() {
        fn example() -> SkiffResult<u16> {
            Ok(22)
        }

        assert_eq!(example().unwrap(), 22);
    }
}
