//! Session configuration.
//!
//! A [`SessionConfig`] is assembled by the caller, validated once at
//! session construction, and then threaded through to the protocol engine
//! on connect. The runtime itself interprets only the scheduling knobs
//! (event poll interval, cancelled-failure policy); everything else —
//! proxy settings, algorithm preferences, the extra option map — is engine
//! territory.

use std::collections::HashMap;
use std::time::Duration;

use skiff_platform::{ErrorKind, SkiffError, SkiffResult};

/// Proxy used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProxyType {
    /// No proxy; connect directly.
    #[default]
    Direct,
    /// SOCKS4 proxy.
    Socks4,
    /// SOCKS4A proxy (hostname resolution on the proxy).
    Socks4a,
    /// SOCKS5 proxy.
    Socks5,
    /// HTTPS CONNECT proxy.
    Https,
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProxyType::Direct => "direct",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks4a => "socks4a",
            ProxyType::Socks5 => "socks5",
            ProxyType::Https => "https",
        };
        f.write_str(name)
    }
}

/// A value in the extra option map passed through to the engine.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OptionValue {
    /// Boolean option.
    Bool(bool),
    /// Integer option.
    Int(i64),
    /// String option.
    Str(String),
}

/// What to do when a cancelled SFTP request's engine call fails afterwards.
///
/// The failure never reaches a callback either way; this only controls
/// whether it leaves a trace in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CancelledFailurePolicy {
    /// Discard the failure without a trace.
    Silent,
    /// Record the suppressed failure at warn level.
    #[default]
    Log,
}

/// Options for a session, fixed at construction.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Proxy type.
    pub proxy: ProxyType,

    /// Proxy host; required unless `proxy` is [`ProxyType::Direct`].
    pub proxy_host: Option<String>,

    /// Proxy port; required unless `proxy` is [`ProxyType::Direct`].
    pub proxy_port: Option<u16>,

    /// Host key algorithms in preference order; empty means engine default.
    pub host_key_algorithms: Vec<String>,

    /// Ask the engine to negotiate transport compression.
    pub compression: bool,

    /// How often the worker drains engine events while connected.
    /// `None` disables the event pump entirely.
    pub event_poll_interval: Option<Duration>,

    /// Handling of failures that arrive after a request was cancelled.
    pub cancelled_failure_policy: CancelledFailurePolicy,

    /// Additional options the engine may recognize, passed uninterpreted.
    pub extra_options: HashMap<String, OptionValue>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyType::Direct,
            proxy_host: None,
            proxy_port: None,
            host_key_algorithms: Vec::new(),
            compression: false,
            event_poll_interval: Some(Duration::from_millis(250)),
            cancelled_failure_policy: CancelledFailurePolicy::default(),
            extra_options: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the proxy type.
    pub fn with_proxy(mut self, proxy: ProxyType) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets the proxy endpoint.
    pub fn with_proxy_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_host = Some(host.into());
        self.proxy_port = Some(port);
        self
    }

    /// Sets the host key algorithm preference list.
    pub fn with_host_key_algorithms<I, S>(mut self, algorithms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.host_key_algorithms = algorithms.into_iter().map(Into::into).collect();
        self
    }

    /// Enables or disables transport compression.
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the event pump interval (`None` disables the pump).
    pub fn with_event_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.event_poll_interval = interval;
        self
    }

    /// Sets the cancelled-failure policy.
    pub fn with_cancelled_failure_policy(mut self, policy: CancelledFailurePolicy) -> Self {
        self.cancelled_failure_policy = policy;
        self
    }

    /// Adds one extra engine option.
    pub fn with_option(mut self, key: impl Into<String>, value: OptionValue) -> Self {
        self.extra_options.insert(key.into(), value);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SkiffResult<()> {
        if self.proxy != ProxyType::Direct {
            if self.proxy_host.as_deref().map_or(true, str::is_empty) {
                return Err(SkiffError::session(
                    ErrorKind::Generic,
                    format!("{} proxy requires a proxy host", self.proxy),
                ));
            }
            if self.proxy_port.is_none() {
                return Err(SkiffError::session(
                    ErrorKind::Generic,
                    format!("{} proxy requires a proxy port", self.proxy),
                ));
            }
        }
        if let Some(interval) = self.event_poll_interval {
            if interval.is_zero() {
                return Err(SkiffError::session(
                    ErrorKind::Generic,
                    "event poll interval cannot be zero",
                ));
            }
        }
        Ok(())
    }
}
