//! Common error types for lodestone-pool.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use std::net::IpAddr;

use thiserror::Error;

/// Main error type for lodestone-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON received on a stratum connection
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or certificate errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol violations (oversized frames, bad framing, bad fields)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Proxy-protocol header received from an untrusted peer
    #[error("spoofed proxy-protocol header from {0}")]
    SpoofedProxyHeader(IpAddr),

    /// The outgoing message queue backed up past its timeout
    #[error("send queue stalled")]
    SendQueueStalled,

    /// Upstream daemon communication errors
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Fatal startup precondition failures that abort the pool
    #[error("Pool startup aborted: {0}")]
    StartupAborted(String),
}

impl Error {
    /// Whether this error is ordinary connection churn (peer reset, abort,
    /// timeout). Churn is logged at low severity and never triggers a ban.
    pub fn is_expected_churn(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether this error represents junk received from the peer (invalid
    /// JSON, failed TLS handshake, spoofed proxy header). Junk may trigger
    /// a short ban depending on configuration.
    pub fn is_junk(&self) -> bool {
        matches!(
            self,
            Error::Json(_) | Error::Tls(_) | Error::SpoofedProxyHeader(_) | Error::Protocol(_)
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
