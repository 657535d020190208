//! # Skiff Platform
//!
//! Shared foundation types for the skiff SSH runtime.
//!
//! This crate provides:
//! - The unified error taxonomy (`SkiffError`, `SkiffResult`, domains and kinds)
//! - Callback execution contexts (`CallbackQueue` and its implementations)
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{ErrorKind, SkiffError, SkiffResult};
//!
//! fn check_port(port: u16) -> SkiffResult<u16> {
//!     if port == 0 {
//!         return Err(SkiffError::session(ErrorKind::Generic, "port cannot be zero"));
//!     }
//!     Ok(port)
//! }
//!
//! # fn main() -> SkiffResult<()> {
//! assert_eq!(check_port(22)?, 22);
//! assert!(check_port(0).is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dispatch;
pub mod error;

pub use dispatch::{CallbackJob, CallbackQueue, InlineCallbackQueue, TokioCallbackQueue};
pub use error::{ErrorDomain, ErrorKind, SkiffError, SkiffResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
