//! Administrative HTTP API over captured transactions
//!
//! Routes:
//! - `GET /ping`
//! - `GET /requests`
//! - `GET /request/{id}`
//! - `POST /repeat/{id}`
//! - `POST /scan/{id}`

use crate::database::TransactionStore;
use crate::error::{Result, StoreError};
use crate::model::Transaction;
use crate::replay;
use crate::scanner::{self, IndicatorProbe, VulnerabilityScanner};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Response headers not copied from a replayed response
const HOP_HEADERS: &[&str] = &["connection", "content-length", "transfer-encoding"];

/// Shared state behind the API routes
pub struct ApiState {
    store: Arc<dyn TransactionStore>,
    client: reqwest::Client,
    scanners: Vec<Box<dyn VulnerabilityScanner>>,
    indicator: String,
}

impl ApiState {
    pub fn new(store: Arc<dyn TransactionStore>, client: reqwest::Client) -> Self {
        Self {
            store,
            client,
            scanners: scanner::default_scanners(),
            indicator: scanner::DEFAULT_INDICATOR.to_string(),
        }
    }

    pub fn with_scanners(mut self, scanners: Vec<Box<dyn VulnerabilityScanner>>) -> Self {
        self.scanners = scanners;
        self
    }
}

/// API listener
pub struct ApiServer {
    listener: TcpListener,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub async fn bind(addr: SocketAddr, state: ApiState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("API listening on {}", self.listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept API connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let state = self.state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| route(state.clone(), req));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("API connection from {} failed: {}", remote_addr, e);
                }
            });
        }

        info!("API stopped");
        Ok(())
    }
}

async fn route<B>(
    state: Arc<ApiState>,
    req: Request<B>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    debug!("API {} {}", method, path);

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["ping"]) => text(StatusCode::OK, "pong"),
        (&Method::GET, ["requests"]) => list_requests(&state).await,
        (&Method::GET, ["request", id]) => get_request(&state, id).await,
        (&Method::POST, ["repeat", id]) => repeat_request(&state, id).await,
        (&Method::POST, ["scan", id]) => scan_request(&state, id).await,
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Run a store call on the blocking pool
async fn with_store<T, F>(state: &ApiState, f: F) -> std::result::Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn TransactionStore) -> std::result::Result<T, StoreError> + Send + 'static,
{
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

async fn list_requests(state: &ApiState) -> Response<Full<Bytes>> {
    match with_store(state, |store| store.list()).await {
        Ok(transactions) if transactions.is_empty() => {
            json_error(StatusCode::NOT_FOUND, "requests not found")
        }
        Ok(transactions) => json_response(StatusCode::OK, &transactions),
        Err(e) => {
            error!("Failed to list transactions: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn get_request(state: &ApiState, id: &str) -> Response<Full<Bytes>> {
    match load(state, id).await {
        Ok(transaction) => json_response(StatusCode::OK, &transaction),
        Err(response) => response,
    }
}

async fn repeat_request(state: &ApiState, id: &str) -> Response<Full<Bytes>> {
    let transaction = match load(state, id).await {
        Ok(transaction) => transaction,
        Err(response) => return response,
    };

    let replayed = match replay::replay(&state.client, &transaction.request).await {
        Ok(replayed) => replayed,
        Err(e) => {
            warn!("Replay of {} failed: {}", id, e);
            return json_error(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    let status = StatusCode::from_u16(replayed.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in replayed.headers() {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    match replayed.bytes().await {
        Ok(body) => builder
            .body(Full::new(body))
            .unwrap_or_else(|_| json_error(StatusCode::BAD_GATEWAY, "invalid replayed response")),
        Err(e) => {
            warn!("Replay of {} failed reading body: {}", id, e);
            json_error(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

async fn scan_request(state: &ApiState, id: &str) -> Response<Full<Bytes>> {
    let transaction = match load(state, id).await {
        Ok(transaction) => transaction,
        Err(response) => return response,
    };

    let probe = IndicatorProbe::new(state.client.clone(), state.indicator.clone());
    let results = scanner::scan_all(&state.scanners, &transaction.request, &probe).await;

    if results.is_empty() {
        json_response(StatusCode::OK, &json!({ "result": "no vulnerabilities found" }))
    } else {
        info!("Scan of {} found vulnerabilities: {:?}", id, results);
        json_response(
            StatusCode::OK,
            &json!({ "result": "vulnerabilities found", "vulnerabilities": results }),
        )
    }
}

/// Fetch a transaction or the error response to send instead
async fn load(
    state: &ApiState,
    id: &str,
) -> std::result::Result<Transaction, Response<Full<Bytes>>> {
    let key = id.to_string();
    match with_store(state, move |store| store.get_by_id(&key)).await {
        Ok(Some(transaction)) => Ok(transaction),
        Ok(None) => Err(json_error(StatusCode::NOT_FOUND, "request not found")),
        Err(e) => {
            error!("Failed to load transaction {}: {}", id, e);
            Err(json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        }
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::model::{Request as StoredRequest, Response as StoredResponse};
    use http_body_util::BodyExt;

    fn state_with(store: Arc<MemoryStore>) -> Arc<ApiState> {
        Arc::new(ApiState::new(store, reqwest::Client::new()))
    }

    fn unreachable_transaction() -> Transaction {
        Transaction::new(
            StoredRequest {
                method: "GET".to_string(),
                host: "127.0.0.1:1".to_string(),
                path: "/search".to_string(),
                scheme: "http".to_string(),
                query_params: [("q".to_string(), "search".to_string())].into(),
                ..Default::default()
            },
            StoredResponse {
                status: 200,
                ..Default::default()
            },
        )
    }

    async fn call(
        state: &Arc<ApiState>,
        method: Method,
        path: &str,
    ) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = route(state.clone(), req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&body).into_owned()));
        (status, value)
    }

    #[tokio::test]
    async fn test_ping() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let (status, body) = call(&state, Method::GET, "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn test_requests_empty_is_not_found() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let (status, body) = call(&state, Method::GET, "/requests").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "requests not found");
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let store = Arc::new(MemoryStore::new());
        let stored = store.create(unreachable_transaction()).unwrap();
        let id = stored.id.unwrap();
        let state = state_with(store);

        let (status, body) = call(&state, Method::GET, "/requests").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], id.as_str());

        let (status, body) = call(&state, Method::GET, &format!("/request/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request"]["path"], "/search");
        assert_eq!(body["request"]["protocol"], "http");

        let (status, _) = call(&state, Method::GET, "/request/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_repeat_unreachable_origin_is_bad_gateway() {
        let store = Arc::new(MemoryStore::new());
        let id = store.create(unreachable_transaction()).unwrap().id.unwrap();
        let state = state_with(store);

        let (status, body) = call(&state, Method::POST, &format!("/repeat/{}", id)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].is_string());

        let (status, _) = call(&state, Method::POST, "/repeat/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_scan_unreachable_origin_finds_nothing() {
        let store = Arc::new(MemoryStore::new());
        let id = store.create(unreachable_transaction()).unwrap().id.unwrap();
        let state = state_with(store);

        let (status, body) = call(&state, Method::POST, &format!("/scan/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "no vulnerabilities found");
    }

    struct BrokenStore;

    impl TransactionStore for BrokenStore {
        fn create(&self, _transaction: Transaction) -> std::result::Result<Transaction, StoreError> {
            Err(StoreError::Task("read only".to_string()))
        }

        fn get_by_id(&self, id: &str) -> std::result::Result<Option<Transaction>, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }

        fn list(&self) -> std::result::Result<Vec<Transaction>, StoreError> {
            Err(StoreError::Task("disk gone".to_string()))
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_errors_are_server_errors() {
        let state = Arc::new(ApiState::new(Arc::new(BrokenStore), reqwest::Client::new()));

        let (status, body) = call(&state, Method::GET, "/requests").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("disk gone"));

        let (status, _) = call(&state, Method::GET, "/request/abc").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Flags every request's `q` parameter
    struct AlwaysVulnerable;

    #[async_trait::async_trait]
    impl VulnerabilityScanner for AlwaysVulnerable {
        fn name(&self) -> &str {
            "always"
        }

        async fn scan(&self, _original: &StoredRequest, _probe: &dyn scanner::Probe) -> Vec<String> {
            vec!["query: q".to_string()]
        }
    }

    #[tokio::test]
    async fn test_scan_reports_findings_per_scanner() {
        let store = Arc::new(MemoryStore::new());
        let id = store.create(unreachable_transaction()).unwrap().id.unwrap();
        let state = Arc::new(
            ApiState::new(store, reqwest::Client::new())
                .with_scanners(vec![Box::new(AlwaysVulnerable) as Box<dyn VulnerabilityScanner>]),
        );

        let (status, body) = call(&state, Method::POST, &format!("/scan/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "result": "vulnerabilities found",
                "vulnerabilities": { "always": ["query: q"] }
            })
        );

        let (status, _) = call(&state, Method::POST, "/scan/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let (status, body) = call(&state, Method::DELETE, "/requests").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }
}
