//! Error types for circuit-sidecar.
//!
//! This module defines the [`enum@Error`] enum representing every failure the
//! sidecar core can surface. The variants follow the failure taxonomy of the
//! control channel, the caches and the rebuild orchestrator.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io              ◄── File I/O failures (cookie, cache file)
//!   ├── Config          ◄── Invalid configuration
//!   ├── Control         ◄── Structured client errors (from stem-rs)
//!   ├── Connection      ◄── Socket-level failure, channel reset
//!   ├── Authentication  ◄── Explicit rejection of the credential
//!   ├── Timeout         ◄── Per-command or handshake deadline expired
//!   ├── Protocol        ◄── Reply stream corruption / unsolicited replies
//!   ├── NotReady        ◄── Rebuild prerequisites missing
//!   ├── Engine          ◄── Circuit engine collaborator failure
//!   └── Cache           ◄── Country cache file encoding problems
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Retry | Recommended Action |
//! |-------|-------------|-------|-------------------|
//! | [`Io`](Error::Io) | Sometimes | Yes | Check paths and permissions |
//! | [`Config`](Error::Config) | No | No | Fix configuration |
//! | [`Control`](Error::Control) | Sometimes | Yes | Reconnect |
//! | [`Connection`](Error::Connection) | Yes | Yes | Next call reconnects |
//! | [`Authentication`](Error::Authentication) | No | No | Check cookie path |
//! | [`Timeout`](Error::Timeout) | Yes | Yes | Retry the command |
//! | [`Protocol`](Error::Protocol) | Yes | Yes | Next call reconnects |
//! | [`NotReady`](Error::NotReady) | Yes | Manually | Wait for bootstrap |
//! | [`Engine`](Error::Engine) | Sometimes | Yes | Trigger a rebuild |
//! | [`Cache`](Error::Cache) | Sometimes | No | Delete the cache file |
//!
//! Parse misses are deliberately not errors: the parser yields empty or
//! unknown values instead.
//!
//! # Example
//!
//! ```rust
//! use circuit_sidecar::Error;
//!
//! fn describe(err: &Error) -> &'static str {
//!     if err.is_retryable() {
//!         "transient"
//!     } else {
//!         "fatal"
//!     }
//! }
//!
//! assert_eq!(describe(&Error::Timeout("GETINFO version".into())), "transient");
//! assert_eq!(describe(&Error::Authentication("515 Bad auth".into())), "fatal");
//! ```

use thiserror::Error;

/// Errors that can occur during circuit-sidecar operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file operations.
    ///
    /// Raised when reading the cookie credential or reading/writing the
    /// country cache file fails.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// The configuration file, CLI arguments or environment carried an
    /// invalid value. Not recoverable without user intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error reported by the structured stem-rs client.
    #[error("control client error: {0}")]
    Control(#[from] stem_rs::Error),

    /// Socket-level failure on the control connection.
    ///
    /// The channel has already dropped its session; the next call opens a
    /// new connection. Every request that was pending on the failed
    /// connection receives this error.
    #[error("control connection error: {0}")]
    Connection(String),

    /// The control port explicitly rejected the credential.
    ///
    /// Fatal for that connection attempt. The channel does not retry.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A command or handshake did not complete before its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The reply stream deviated from strict one-reply-per-command order.
    ///
    /// Raised for unsolicited asynchronous replies, replies with no pending
    /// request, and malformed reply lines. The session is torn down.
    #[error("protocol corruption: {0}")]
    Protocol(String),

    /// Rebuild prerequisites are not met yet.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The circuit engine collaborator failed.
    #[error("circuit engine error: {0}")]
    Engine(String),

    /// The country cache file could not be encoded or decoded.
    #[error("country cache error: {0}")]
    Cache(String),
}

impl Error {
    /// Returns `true` if retrying the failed operation may succeed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use circuit_sidecar::Error;
    ///
    /// assert!(Error::Connection("reset by peer".into()).is_retryable());
    /// assert!(!Error::Config("bad hop count".into()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Control(_)
                | Error::Connection(_)
                | Error::Timeout(_)
                | Error::Protocol(_)
                | Error::NotReady(_)
                | Error::Engine(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Cache(e.to_string())
    }
}

/// Result type alias for circuit-sidecar operations.
pub type Result<T> = std::result::Result<T, Error>;
