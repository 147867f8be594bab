//! Error types for the proxy, the transaction store and replay

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Errors raised while accepting, intercepting or forwarding traffic
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error on a client or origin socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Origin could not be reached
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Origin did not answer within the dial timeout
    #[error("dial {0} timed out")]
    DialTimeout(String),

    /// Writing the request to the origin failed
    #[error("send failed: {0}")]
    Send(#[source] hyper::Error),

    /// Reading the response from the origin failed
    #[error("receive failed: {0}")]
    Receive(#[source] hyper::Error),

    /// Serving the client connection failed
    #[error("relay failed: {0}")]
    Relay(#[source] hyper::Error),

    /// Malformed HTTP framing
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key material could not be loaded or parsed
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Host is not usable as a certificate name
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// The certificate issuer failed
    #[error("certificate issuance failed: {0}")]
    Issue(String),

    /// Shutdown grace period elapsed with connections still in flight
    #[error("proxy server shutdown timed out with {0} connection(s) in flight")]
    ShutdownTimeout(usize),
}

/// Errors raised by a transaction store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("transaction not found: {0}")]
    NotFound(String),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Errors raised while rebuilding or executing a stored request
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The stored request cannot be turned into a live request
    #[error("invalid request: {0}")]
    Build(String),

    /// The origin could not be reached or answered badly
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<url::ParseError> for ReplayError {
    fn from(e: url::ParseError) -> Self {
        ReplayError::Build(format!("url: {}", e))
    }
}
