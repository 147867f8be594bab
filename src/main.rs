//! https-proxy - Main entry point
//!
//! An intercepting HTTP/HTTPS proxy with a capture history API

use anyhow::{Context, Result};
use clap::Parser;
use https_proxy::capture::{self, Capture};
use https_proxy::proxy::upstream_roots;
use https_proxy::{
    replay, ApiServer, ApiState, CacheConfig, CertificateIssuer, CertificateManager, Proxy,
    ProxyConfig, ProxyServer, RcgenIssuer, ScriptIssuer, SqliteStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// https-proxy - An intercepting HTTP/HTTPS proxy
#[derive(Parser, Debug)]
#[command(name = "https-proxy")]
#[command(author = "https-proxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "An intercepting HTTP/HTTPS proxy that captures, replays and scans traffic")]
struct Args {
    /// Address the proxy listens on
    #[arg(long, env = "PROXY_ADDR", default_value = "0.0.0.0:8080")]
    proxy_addr: SocketAddr,

    /// Address the administrative API listens on
    #[arg(long, env = "API_ADDR", default_value = "127.0.0.1:8000")]
    api_addr: SocketAddr,

    /// Private key shared by every intercepted host's certificate
    #[arg(long, env = "TLS_KEY_PATH", default_value = "./certs/cert.key")]
    tls_key_path: PathBuf,

    /// Directory holding issued certificates (<host>.crt)
    #[arg(long, env = "CERT_PATH", default_value = "./certs")]
    cert_path: PathBuf,

    /// Script run as `<script> <host> <serial>` to issue a certificate
    #[arg(long, env = "ISSUER_SCRIPT", default_value = "./scripts/gen_cert.sh")]
    issuer_script: PathBuf,

    /// CA key for issuing certificates in-process instead of via the script
    #[arg(long, env = "CA_KEY_PATH")]
    ca_key_path: Option<PathBuf>,

    /// Extra CA certificate (PEM) trusted for origin connections
    #[arg(long, env = "UPSTREAM_CA")]
    upstream_ca: Option<PathBuf>,

    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/transactions.db")]
    db_path: PathBuf,

    /// Origin dial timeout in seconds
    #[arg(long, env = "DIAL_TIMEOUT_SECS", default_value = "5")]
    dial_timeout_secs: u64,

    /// Maximum concurrently handled client connections
    #[arg(long, env = "MAX_CONNECTIONS", default_value = "1024")]
    max_connections: usize,

    /// Transactions buffered for the store before new ones are dropped
    #[arg(long, env = "CAPTURE_QUEUE", default_value_t = capture::DEFAULT_QUEUE_CAPACITY)]
    capture_queue: usize,

    /// Certificates kept in memory
    #[arg(long, env = "CERT_CACHE_CAPACITY", default_value = "1024")]
    cert_cache_capacity: usize,

    /// Seconds a cached certificate stays valid (0 disables expiry)
    #[arg(long, env = "CERT_CACHE_TTL_SECS", default_value = "86400")]
    cert_cache_ttl_secs: u64,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "10")]
    shutdown_grace_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting https-proxy v1.0.0");

    // Transaction store and capture worker
    let store = Arc::new(
        SqliteStore::new(&args.db_path)
            .with_context(|| format!("open database {}", args.db_path.display()))?,
    );
    info!("Database initialized at: {}", store.db_path());
    let (capture, capture_worker) = Capture::spawn(store.clone(), args.capture_queue);

    // Certificate issuance
    let issuer: Arc<dyn CertificateIssuer> = match &args.ca_key_path {
        Some(ca_key_path) => {
            let ca_key = std::fs::read_to_string(ca_key_path)
                .with_context(|| format!("read CA key {}", ca_key_path.display()))?;
            let leaf_key = std::fs::read_to_string(&args.tls_key_path)
                .with_context(|| format!("read TLS key {}", args.tls_key_path.display()))?;
            let issuer = RcgenIssuer::new(&ca_key, &leaf_key)?;

            std::fs::create_dir_all(&args.cert_path)?;
            let ca_cert_path = args.cert_path.join("ca.pem");
            std::fs::write(&ca_cert_path, issuer.ca_cert_pem()?)?;
            info!("Issuing certificates in-process, CA certificate at {}", ca_cert_path.display());

            Arc::new(issuer)
        }
        None => {
            info!("Issuing certificates with {}", args.issuer_script.display());
            Arc::new(ScriptIssuer::new(&args.issuer_script, &args.cert_path))
        }
    };

    let cache = CacheConfig {
        capacity: args.cert_cache_capacity,
        ttl: (args.cert_cache_ttl_secs > 0).then(|| Duration::from_secs(args.cert_cache_ttl_secs)),
    };
    let certs = Arc::new(CertificateManager::new(
        &args.cert_path,
        &args.tls_key_path,
        issuer,
        cache,
    )?);

    // Proxy
    let config = ProxyConfig {
        dial_timeout: Duration::from_secs(args.dial_timeout_secs),
        max_connections: args.max_connections,
    };
    let roots = upstream_roots(args.upstream_ca.as_deref())?;
    let proxy = Arc::new(Proxy::new(config.clone(), certs, capture, roots));
    let server = Arc::new(ProxyServer::bind(args.proxy_addr, proxy).await?);

    // Administrative API
    let client = replay::client(args.upstream_ca.as_deref(), config.dial_timeout * 2)?;
    let api = ApiServer::bind(args.api_addr, ApiState::new(store, client)).await?;
    let (api_stop, api_stopped) = oneshot::channel::<()>();
    let api_task = tokio::spawn(api.serve(async move {
        let _ = api_stopped.await;
    }));

    let serving = server.clone();
    let proxy_task = tokio::spawn(async move { serving.serve().await });

    info!("https-proxy started successfully");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let grace = Duration::from_secs(args.shutdown_grace_secs);
    if let Err(e) = server.shutdown(grace).await {
        warn!("{}", e);
    }
    let _ = api_stop.send(());

    if let Err(e) = proxy_task.await? {
        error!("Proxy server error: {}", e);
    }
    if let Err(e) = api_task.await? {
        error!("API server error: {}", e);
    }

    // Connections still running hold capture handles; give the queue the same grace
    drop(server);
    if tokio::time::timeout(grace, capture_worker).await.is_err() {
        warn!("Capture queue not drained before exit");
    }

    info!("https-proxy stopped");
    Ok(())
}
