//! Certificate manager for TLS interception
//!
//! Leaf certificates are resolved per host from a bounded in-memory cache,
//! then the certificate directory, and finally a [`CertificateIssuer`].
//! Every leaf shares the single private key loaded at startup.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Produces a PEM encoded leaf certificate for a host
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, host: &str, serial: u64) -> Result<Vec<u8>>;
}

/// Issues certificates by running an external provisioning script
///
/// The script is invoked as `<script> <host> <serial>` with `CERT_DIR` set
/// to the certificate directory, and must print the PEM certificate on
/// stdout.
pub struct ScriptIssuer {
    script: PathBuf,
    cert_dir: PathBuf,
}

impl ScriptIssuer {
    pub fn new<P: AsRef<Path>, D: AsRef<Path>>(script: P, cert_dir: D) -> Self {
        Self {
            script: script.as_ref().to_path_buf(),
            cert_dir: cert_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CertificateIssuer for ScriptIssuer {
    async fn issue(&self, host: &str, serial: u64) -> Result<Vec<u8>> {
        let output = Command::new(&self.script)
            .arg(host)
            .arg(serial.to_string())
            .env("CERT_DIR", &self.cert_dir)
            .output()
            .await
            .map_err(|e| ProxyError::Issue(format!("{}: {}", self.script.display(), e)))?;

        if !output.status.success() {
            return Err(ProxyError::Issue(format!(
                "{} exited with {}, stderr: {}",
                self.script.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if output.stdout.is_empty() {
            return Err(ProxyError::Issue(format!(
                "{} produced no certificate",
                self.script.display()
            )));
        }

        Ok(output.stdout)
    }
}

/// Issues certificates in-process, signed by a local CA key
///
/// The leaf key must be the proxy's shared key so the issued certificate
/// matches it. Keys are expected to be ECDSA P-256.
pub struct RcgenIssuer {
    ca: Certificate,
    leaf_key_pem: String,
}

impl RcgenIssuer {
    /// Rebuild the CA certificate from its key and prepare to sign leaves
    pub fn new(ca_key_pem: &str, leaf_key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| ProxyError::Certificate(format!("CA key: {}", e)))?;
        // Validate the leaf key up front, it is parsed again per issuance
        KeyPair::from_pem(leaf_key_pem)
            .map_err(|e| ProxyError::Certificate(format!("leaf key: {}", e)))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "https-proxy CA");
        dn.push(DnType::OrganizationName, "https-proxy");
        params.distinguished_name = dn;
        params.key_pair = Some(ca_key);

        let ca = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("CA certificate: {}", e)))?;

        Ok(Self {
            ca,
            leaf_key_pem: leaf_key_pem.to_string(),
        })
    }

    /// CA certificate for clients to trust
    pub fn ca_cert_pem(&self) -> Result<String> {
        self.ca
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("CA certificate: {}", e)))
    }
}

#[async_trait]
impl CertificateIssuer for RcgenIssuer {
    async fn issue(&self, host: &str, serial: u64) -> Result<Vec<u8>> {
        let key = KeyPair::from_pem(&self.leaf_key_pem)
            .map_err(|e| ProxyError::Issue(format!("leaf key: {}", e)))?;

        let mut params = CertificateParams::new(vec![host.to_string()]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.serial_number = Some(serial.into());
        params.key_pair = Some(key);

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Issue(format!("{}: {}", host, e)))?;
        let pem = cert
            .serialize_pem_with_signer(&self.ca)
            .map_err(|e| ProxyError::Issue(format!("{}: {}", host, e)))?;

        Ok(pem.into_bytes())
    }
}

/// Cache bounds
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

struct CachedCert {
    pem: Bytes,
    inserted_at: Instant,
}

/// Host -> PEM cache with a TTL and oldest-first eviction at capacity
pub struct CertCache {
    entries: DashMap<String, CachedCert>,
    config: CacheConfig,
}

impl CertCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn get(&self, host: &str) -> Option<Bytes> {
        if let Some(ttl) = self.config.ttl {
            self.entries
                .remove_if(host, |_, cached| cached.inserted_at.elapsed() >= ttl);
        }
        self.entries.get(host).map(|cached| cached.pem.clone())
    }

    /// Insert or overwrite the entry for `host`
    pub fn insert(&self, host: &str, pem: Bytes) {
        if !self.entries.contains_key(host) && self.entries.len() >= self.config.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            host.to_string(),
            CachedCert {
                pem,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());

        if let Some(host) = oldest {
            debug!("Evicting cached certificate for {}", host);
            self.entries.remove(&host);
        }
    }
}

/// Certificate manager for intercepted hosts
pub struct CertificateManager {
    cert_dir: PathBuf,
    key_pem: Arc<[u8]>,
    cache: CertCache,
    issuer: Arc<dyn CertificateIssuer>,
}

impl CertificateManager {
    /// Create a manager, loading the shared key from `key_path`.
    ///
    /// Fails if the key cannot be read or parsed; the proxy cannot serve
    /// TLS without it.
    pub fn new<P: AsRef<Path>, K: AsRef<Path>>(
        cert_dir: P,
        key_path: K,
        issuer: Arc<dyn CertificateIssuer>,
        cache: CacheConfig,
    ) -> Result<Self> {
        let key_path = key_path.as_ref();
        let key_pem = std::fs::read(key_path).map_err(|e| {
            ProxyError::Certificate(format!("read TLS key {}: {}", key_path.display(), e))
        })?;
        Self::from_key_pem(cert_dir, key_pem, issuer, cache)
    }

    /// Create a manager from PEM key bytes already in memory
    pub fn from_key_pem<P: AsRef<Path>>(
        cert_dir: P,
        key_pem: Vec<u8>,
        issuer: Arc<dyn CertificateIssuer>,
        cache: CacheConfig,
    ) -> Result<Self> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&cert_dir)?;

        parse_private_key(&key_pem)?;

        info!("Certificate manager using {}", cert_dir.display());

        Ok(Self {
            cert_dir,
            key_pem: Arc::from(key_pem),
            cache: CertCache::new(cache),
            issuer,
        })
    }

    /// TLS server configuration impersonating `host`
    pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let pem = self.certificate_pem(host).await?;
        self.build_server_config(&pem)
    }

    /// Resolve the PEM certificate for `host` from cache, disk or the issuer.
    ///
    /// Only PEM that parses is cached or written to disk.
    pub async fn certificate_pem(&self, host: &str) -> Result<Bytes> {
        if let Some(pem) = self.cache.get(host) {
            return Ok(pem);
        }

        let cert_path = self.cert_path(host)?;
        let pem = match tokio::fs::read(&cert_path).await {
            Ok(pem) => {
                parse_certificates(&pem).map_err(|e| {
                    ProxyError::Certificate(format!("{}: {}", cert_path.display(), e))
                })?;
                pem
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Certificate not found for host '{}', issuing", host);
                let pem = self.issuer.issue(host, fresh_serial()).await?;
                parse_certificates(&pem)
                    .map_err(|e| ProxyError::Issue(format!("{}: {}", host, e)))?;
                self.save(&cert_path, &pem).await?;
                info!("Issued certificate for {}", host);
                pem
            }
            Err(e) => {
                return Err(ProxyError::Certificate(format!(
                    "read {}: {}",
                    cert_path.display(),
                    e
                )))
            }
        };

        let pem = Bytes::from(pem);
        self.cache.insert(host, pem.clone());
        Ok(pem)
    }

    /// Write through a temporary file so readers never see a partial certificate
    async fn save(&self, cert_path: &Path, pem: &[u8]) -> Result<()> {
        let tmp_path = self
            .cert_dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4()));

        let result = match tokio::fs::write(&tmp_path, pem).await {
            Ok(()) => tokio::fs::rename(&tmp_path, cert_path).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ProxyError::Certificate(format!(
                "save {}: {}",
                cert_path.display(),
                e
            )));
        }
        Ok(())
    }

    fn build_server_config(&self, cert_pem: &[u8]) -> Result<Arc<ServerConfig>> {
        let certs = parse_certificates(cert_pem).map_err(ProxyError::Certificate)?;

        let key = parse_private_key(&self.key_pem)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        // No HTTP/2 interception
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    fn cert_path(&self, host: &str) -> Result<PathBuf> {
        Ok(self.cert_dir.join(format!("{}.crt", sanitize_host(host)?)))
    }

    /// Get certs directory path
    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Number of cached hosts
    pub fn cached_hosts(&self) -> usize {
        self.cache.len()
    }
}

/// Reject hosts that cannot be used as a single file name
fn sanitize_host(host: &str) -> Result<String> {
    let invalid = host.is_empty()
        || host.starts_with('.')
        || host.contains(['/', '\\', '\0'])
        || host.chars().any(char::is_whitespace);

    if invalid {
        return Err(ProxyError::InvalidHost(host.to_string()));
    }

    Ok(host.replace('*', "wildcard"))
}

fn parse_certificates(pem: &[u8]) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("parse certificate: {}", e))?;
    if certs.is_empty() {
        return Err("no certificate in PEM".to_string());
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| ProxyError::Certificate(format!("parse TLS key: {}", e)))?
        .ok_or_else(|| ProxyError::Certificate("no private key in PEM".to_string()))
}

fn fresh_serial() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n as u64)
        .unwrap_or_else(|| uuid::Uuid::new_v4().as_u128() as u64)
}
