//! # Skiff SSH
//!
//! An asynchronous SSH client session runtime. The crate manages session
//! lifecycle, authentication, channels and SFTP on top of a pluggable
//! protocol engine; it contains no wire-protocol code of its own.
//!
//! # Architecture
//!
//! - Every [`Session`] owns one serial worker task. All engine access and
//!   all mutable state live on that worker; public handles communicate
//!   with it over a command channel, so no call ever blocks on a lock.
//! - The caller observes the session through a [`SessionDelegate`], whose
//!   methods run on a [`CallbackQueue`] of the caller's choosing.
//! - Wire I/O is behind the [`SshEngine`](engine::SshEngine) trait. The
//!   [`engine::testing::ScriptedEngine`] implementation answers from a
//!   script, which keeps the whole runtime testable without a server.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use skiff_ssh::engine::testing::ScriptedEngine;
//! use skiff_ssh::engine::HostKey;
//! use skiff_ssh::{Session, SessionConfig, SessionDelegate, TokioCallbackQueue};
//!
//! struct Trusting;
//!
//! impl SessionDelegate for Trusting {
//!     fn should_trust_host_key(&self, _key: &HostKey) -> bool {
//!         true
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let delegate = Arc::new(Trusting);
//! let session = Session::new(
//!     ScriptedEngine::new(),
//!     "test.invalid",
//!     22,
//!     "deploy",
//!     SessionConfig::new(),
//!     &delegate,
//!     Arc::new(TokioCallbackQueue),
//! )?;
//!
//! // Lifecycle calls return immediately; the worker runs them in order.
//! session.connect(Duration::from_secs(10))?;
//! session.authenticate_with_password(Box::new(|| Some("secret".to_string())))?;
//!
//! let sftp = session.open_sftp_channel().await?;
//! sftp.mkdir("/upload").await?;
//! sftp.close().await?;
//! session.disconnect()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod delegate;
pub mod engine;
pub mod session;
pub mod sftp;

pub use channel::{Channel, ChannelId, ChannelSpec, ChannelStage, ChannelType, ForwardedChannelInfo};
pub use config::{CancelledFailurePolicy, OptionValue, ProxyType, SessionConfig};
pub use delegate::SessionDelegate;
pub use engine::{
    AuthMethod, HostKey, HostKeyKind, InteractivePrompt, InteractiveRound, KeyPair,
    NegotiatedAlgorithms, ServerBanner, SocketDescriptor, SshEngine,
};
pub use session::{DescriptorSupplier, InteractivePrompter, PasswordPrompt, Session, SessionStage};
pub use sftp::{
    FileAttributes, FileExistence, FileMode, FileOpenFlags, RawAttributes, RemoteFile,
    RequestState, SftpCallbacks, SftpChannel, SftpError, SftpErrorKind, SftpOperation,
    SftpOutcome, SftpRequest, SftpStatus,
};

pub use skiff_platform::{
    CallbackQueue, ErrorDomain, ErrorKind, InlineCallbackQueue, SkiffError, SkiffResult,
    TokioCallbackQueue,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
