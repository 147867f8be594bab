//! Intercepting proxy engine
//!
//! Plain requests are forwarded to the origin named in their absolute-form
//! target. `CONNECT` requests are acknowledged, TLS is terminated with a
//! certificate impersonating the requested host, and every decrypted request
//! is forwarded over a fresh TLS connection to the origin. Each exchange is
//! captured for storage.

use crate::capture::Capture;
use crate::certificate::CertificateManager;
use crate::error::{ProxyError, Result};
use crate::model::{self, Transaction};
use bytes::Bytes;
use http::header::{HeaderValue, HOST, TRANSFER_ENCODING};
use http::uri::Authority;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::stream::Prefixed;

/// Literal tunnel acknowledgement sent before the TLS handshake
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Headers meant for the proxy that must not reach the origin
const PROXY_HEADERS: &[&str] = &["proxy-authenticate", "proxy-authorization", "proxy-connection"];

const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Proxy configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Timeout for dialing (and TLS handshaking with) an origin
    pub dial_timeout: Duration,
    /// Upper bound on concurrently handled client connections
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            max_connections: 1024,
        }
    }
}

/// Leading request line of a client connection
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    /// Every byte consumed while reading the head
    raw: Vec<u8>,
}

/// Intercepting proxy
pub struct Proxy {
    config: ProxyConfig,
    certs: Arc<CertificateManager>,
    capture: Capture,
    upstream: TlsConnector,
}

impl Proxy {
    /// Create a proxy. `upstream_roots` verifies origin certificates.
    pub fn new(
        config: ProxyConfig,
        certs: Arc<CertificateManager>,
        capture: Capture,
        upstream_roots: RootCertStore,
    ) -> Self {
        let client_config = ClientConfig::builder()
            .with_root_certificates(upstream_roots)
            .with_no_client_auth();

        Self {
            config,
            certs,
            capture,
            upstream: TlsConnector::from(Arc::new(client_config)),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Handle one accepted client connection until it is done
    pub async fn handle<S>(self: Arc<Self>, stream: S, remote_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(stream);
        let head = read_head(&mut reader).await?;

        debug!("{} {} from {}", head.method, head.target, remote_addr);

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.https_strategy(reader, &head.target).await
        } else {
            self.http_strategy(Prefixed::new(head.raw, reader)).await
        }
    }

    /// Terminate TLS for a `CONNECT` tunnel and relay decrypted requests
    async fn https_strategy<S>(self: Arc<Self>, mut client: S, target: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (host, port) = connect_target(target)?;

        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;

        let tls_config = self.certs.server_config(&host).await?;
        let tls_client = TlsAcceptor::from(tls_config).accept(client).await?;
        debug!("TLS established with client for {}:{}", host, port);

        let proxy = self;
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            let host = host.clone();
            async move {
                let origin = proxy.dial_tls(&host, port).await?;
                proxy.forward(origin, req, true).await
            }
        });

        // Requests are served one at a time until the client closes the tunnel
        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(tls_client), service)
            .await
            .map_err(ProxyError::Relay)
    }

    /// Forward a single plain HTTP request, then close
    async fn http_strategy<S>(self: Arc<Self>, client: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy = self;
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            async move {
                let (host, port, tls) = origin_addr(&req)?;
                if tls {
                    let origin = proxy.dial_tls(&host, port).await?;
                    proxy.forward(origin, req, true).await
                } else {
                    let origin = proxy.dial_tcp(&host, port).await?;
                    proxy.forward(origin, req, false).await
                }
            }
        });

        http1::Builder::new()
            .keep_alive(false)
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(client), service)
            .await
            .map_err(ProxyError::Relay)
    }

    /// Forward `req` over the `target` connection and return the buffered
    /// response for the client. The exchange is queued for capture before
    /// returning.
    pub async fn forward<T, B>(
        &self,
        target: T,
        req: Request<B>,
        tls: bool,
    ) -> Result<Response<Full<Bytes>>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (mut parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| {
                let e: Box<dyn std::error::Error + Send + Sync> = e.into();
                ProxyError::Protocol(format!("read request body: {}", e))
            })?
            .to_bytes();

        hide_proxy(&mut parts)?;

        let request_model = model::Request::from_parts(&parts, &body, tls);
        let outbound = Request::from_parts(parts, Full::new(body));

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(target))
            .await
            .map_err(ProxyError::Send)?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Origin connection error: {}", e);
            }
        });

        let response = sender.send_request(outbound).await.map_err(|e| {
            if e.is_parse() || e.is_incomplete_message() {
                ProxyError::Receive(e)
            } else {
                ProxyError::Send(e)
            }
        })?;

        let (mut resp_parts, resp_body) = response.into_parts();
        let resp_body = resp_body
            .collect()
            .await
            .map_err(ProxyError::Receive)?
            .to_bytes();

        // One request per origin connection
        drop(sender);

        // The body is re-framed with a content length
        resp_parts.headers.remove(TRANSFER_ENCODING);

        let response_model = model::Response::from_parts(&resp_parts, &resp_body);
        debug!(
            "{} {}{} -> {}",
            request_model.method, request_model.host, request_model.path, response_model.status
        );
        self.capture
            .submit(Transaction::new(request_model, response_model));

        Ok(Response::from_parts(resp_parts, Full::new(resp_body)))
    }

    async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        match timeout(self.config.dial_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::Dial { addr, source }),
            Err(_) => Err(ProxyError::DialTimeout(addr)),
        }
    }

    async fn dial_tls(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.trim_matches(&['[', ']'][..]).to_string())
            .map_err(|_| ProxyError::InvalidHost(host.to_string()))?;

        let tcp = self.dial_tcp(host, port).await?;
        let addr = format!("{}:{}", host, port);
        match timeout(self.config.dial_timeout, self.upstream.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::Dial { addr, source }),
            Err(_) => Err(ProxyError::DialTimeout(addr)),
        }
    }
}

/// Trust roots for origin connections: the webpki roots plus an optional
/// extra PEM bundle
pub fn upstream_roots(extra_ca: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = extra_ca {
        let pem = std::fs::read(path)?;
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut StdBufReader::new(pem.as_slice())) {
            roots.add(cert?)?;
            added += 1;
        }
        info!("Trusting {} extra upstream CA certificate(s) from {}", added, path.display());
    }

    Ok(roots)
}

/// Read the request head (request line and headers) from the client
async fn read_head<R>(reader: &mut R) -> Result<RequestHead>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut raw = Vec::new();
    let mut request_line = None;

    loop {
        let start = raw.len();
        let n = reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(ProxyError::Protocol(
                "connection closed before end of request head".to_string(),
            ));
        }
        if raw.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::Protocol("request head too large".to_string()));
        }

        let line = &raw[start..];
        if request_line.is_none() {
            request_line = Some(String::from_utf8_lossy(line).trim().to_string());
        } else if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let request_line = request_line.unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) if version.starts_with("HTTP/") => {
            Ok(RequestHead {
                method: method.to_string(),
                target: target.to_string(),
                raw,
            })
        }
        _ => Err(ProxyError::Protocol(format!(
            "invalid request line: {:?}",
            request_line
        ))),
    }
}

/// Host and port from a `CONNECT host:port` target
fn connect_target(target: &str) -> Result<(String, u16)> {
    let authority: Authority = target
        .parse()
        .map_err(|_| ProxyError::Protocol(format!("invalid CONNECT target: {}", target)))?;
    Ok((
        authority.host().to_string(),
        authority.port_u16().unwrap_or(443),
    ))
}

/// Origin host, port and whether to use TLS for a plain proxy request
fn origin_addr<B>(req: &Request<B>) -> Result<(String, u16, bool)> {
    let tls = req.uri().scheme_str() == Some("https");

    let authority = match req.uri().authority() {
        Some(authority) => authority.clone(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Authority>().ok())
            .ok_or_else(|| ProxyError::Protocol("request has no target host".to_string()))?,
    };

    let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok((authority.host().to_string(), port, tls))
}

/// Make a proxy request valid as a direct request to the origin
fn hide_proxy(parts: &mut http::request::Parts) -> Result<()> {
    for name in PROXY_HEADERS {
        parts.headers.remove(*name);
    }

    if let Some(authority) = parts.uri.authority() {
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|_| ProxyError::Protocol(format!("invalid host: {}", authority)))?;
        parts.headers.insert(HOST, host);
    }

    let origin_form = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = origin_form
        .parse()
        .map_err(|_| ProxyError::Protocol(format!("invalid request target: {}", origin_form)))?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::certificate::{CacheConfig, RcgenIssuer};
    use crate::database::{MemoryStore, TransactionStore};
    use std::convert::Infallible;

    pub(crate) fn test_proxy(store: Arc<MemoryStore>) -> (Arc<Proxy>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let leaf_key = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .unwrap()
            .serialize_pem();
        let ca_key = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .unwrap()
            .serialize_pem();
        let issuer = Arc::new(RcgenIssuer::new(&ca_key, &leaf_key).unwrap());
        let certs = CertificateManager::from_key_pem(
            dir.path(),
            leaf_key.into_bytes(),
            issuer,
            CacheConfig::default(),
        )
        .unwrap();
        let (capture, _worker) = Capture::spawn(store, 16);
        let proxy = Proxy::new(
            ProxyConfig::default(),
            Arc::new(certs),
            capture,
            RootCertStore::empty(),
        );
        (Arc::new(proxy), dir)
    }

    async fn wait_for_transactions(store: &MemoryStore, count: usize) {
        for _ in 0..100 {
            if store.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} captured transaction(s), found {}", count, store.len());
    }

    #[test]
    fn test_hide_proxy() {
        let (mut parts, _) = Request::builder()
            .uri("http://example.com:8080/x?y=1")
            .header("Proxy-Authorization", "Basic Zm9vOmJhcg==")
            .header("Proxy-Connection", "keep-alive")
            .header("Accept", "*/*")
            .body(())
            .unwrap()
            .into_parts();

        hide_proxy(&mut parts).unwrap();

        assert_eq!(parts.uri.to_string(), "/x?y=1");
        assert_eq!(parts.headers.get(HOST).unwrap(), "example.com:8080");
        assert!(parts.headers.get("proxy-authorization").is_none());
        assert!(parts.headers.get("proxy-connection").is_none());
        assert_eq!(parts.headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_origin_addr() {
        let req = Request::get("http://example.com/x?y=1").body(()).unwrap();
        assert_eq!(origin_addr(&req).unwrap(), ("example.com".to_string(), 80, false));

        let req = Request::get("http://example.com:8080/").body(()).unwrap();
        assert_eq!(origin_addr(&req).unwrap().1, 8080);

        let req = Request::get("https://example.com/").body(()).unwrap();
        assert_eq!(origin_addr(&req).unwrap(), ("example.com".to_string(), 443, true));

        let req = Request::get("/relative")
            .header("Host", "fallback.example.com:81")
            .body(())
            .unwrap();
        assert_eq!(
            origin_addr(&req).unwrap(),
            ("fallback.example.com".to_string(), 81, false)
        );

        let req = Request::get("/relative").body(()).unwrap();
        assert!(matches!(origin_addr(&req), Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_connect_target() {
        assert_eq!(
            connect_target("secure.example.com:443").unwrap(),
            ("secure.example.com".to_string(), 443)
        );
        assert_eq!(
            connect_target("secure.example.com:8443").unwrap(),
            ("secure.example.com".to_string(), 8443)
        );
        assert_eq!(connect_target("bare.example.com").unwrap().1, 443);
        assert!(connect_target("not a target").is_err());
    }

    #[tokio::test]
    async fn test_read_head() {
        let raw = b"CONNECT secure.example.com:443 HTTP/1.1\r\nHost: secure.example.com:443\r\n\r\nleftover";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_head(&mut reader).await.unwrap();

        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "secure.example.com:443");
        assert!(head.raw.ends_with(b"\r\n\r\n"));
        assert!(!head.raw.ends_with(b"leftover"));
    }

    #[tokio::test]
    async fn test_read_head_rejects_garbage() {
        let mut reader = BufReader::new(&b"hello\r\n\r\n"[..]);
        assert!(matches!(read_head(&mut reader).await, Err(ProxyError::Protocol(_))));

        let mut reader = BufReader::new(&b"GET http://example.com/ HTTP/1.1\r\nHost: x"[..]);
        assert!(matches!(read_head(&mut reader).await, Err(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_forward_sanitizes_and_captures() {
        let store = Arc::new(MemoryStore::new());
        let (proxy, _dir) = test_proxy(store.clone());

        let (proxy_side, origin_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let service = service_fn(|req: Request<Incoming>| async move {
                let seen = format!(
                    "{} {} host={} proxy_auth={}",
                    req.method(),
                    req.uri(),
                    req.headers()
                        .get(HOST)
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("none"),
                    req.headers().contains_key("proxy-authorization"),
                );
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(201)
                        .header("X-Origin", "yes")
                        .body(Full::new(Bytes::from(seen)))
                        .unwrap(),
                )
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(origin_side), service)
                .await;
        });

        let req = Request::builder()
            .method("GET")
            .uri("http://example.com/x?y=1")
            .header("Proxy-Authorization", "Basic abc")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = proxy.forward(proxy_side, req, false).await.unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers().get("x-origin").unwrap(), "yes");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"GET /x?y=1 host=example.com proxy_auth=false");

        wait_for_transactions(&store, 1).await;
        let captured = store.list().unwrap().remove(0);
        assert_eq!(captured.request.method, "GET");
        assert_eq!(captured.request.path, "/x");
        assert_eq!(captured.request.host, "example.com");
        assert_eq!(
            captured.request.query_params.get("y").map(String::as_str),
            Some("1")
        );
        assert_eq!(captured.response.status, 201);
        assert_eq!(captured.response.body, body.to_vec());
    }

    #[tokio::test]
    async fn test_forward_reports_receive_failure() {
        let store = Arc::new(MemoryStore::new());
        let (proxy, _dir) = test_proxy(store.clone());

        let (proxy_side, mut origin_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut origin_side, &mut buf).await;
            let _ = origin_side.write_all(b"this is not http\r\n\r\n").await;
        });

        let req = Request::get("http://example.com/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = proxy.forward(proxy_side, req, false).await.unwrap_err();
        assert!(matches!(err, ProxyError::Receive(_)), "{}", err);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());
    }
}
