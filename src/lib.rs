//! https-proxy - An intercepting HTTP/HTTPS proxy
//!
//! Provides:
//! - Plain HTTP forwarding and TLS interception of `CONNECT` tunnels
//! - Per-host certificates issued on demand and cached on disk
//! - Capture of every exchange into a transaction store
//! - Replay and command-injection scanning of captured requests
//! - An administrative HTTP API over the capture history

pub mod api;
pub mod capture;
pub mod certificate;
pub mod database;
pub mod error;
pub mod model;
pub mod proxy;
pub mod replay;
pub mod scanner;
pub mod server;
mod stream;

pub use api::{ApiServer, ApiState};
pub use capture::Capture;
pub use certificate::{CacheConfig, CertificateIssuer, CertificateManager, RcgenIssuer, ScriptIssuer};
pub use database::{MemoryStore, SqliteStore, TransactionStore};
pub use error::{ProxyError, ReplayError, StoreError};
pub use model::Transaction;
pub use proxy::{Proxy, ProxyConfig};
pub use server::ProxyServer;
