//! Rebuild stored requests as live requests and send them again

use crate::error::ReplayError;
use crate::model::Request;
use reqwest::header::{HeaderName, HeaderValue, COOKIE};
use reqwest::redirect::Policy;
use reqwest::Method;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Headers recomputed by the client or rebuilt from other fields
const REBUILT_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "content-encoding",
    "cookie",
    "connection",
];

/// Whether a stored header is dropped when rebuilding the request
pub fn is_rebuilt_header(name: &str) -> bool {
    REBUILT_HEADERS
        .iter()
        .any(|rebuilt| rebuilt.eq_ignore_ascii_case(name))
}

/// HTTP client for replays and probes. Redirects are never followed so the
/// first-hop response is what the caller sees.
pub fn client(upstream_ca: Option<&Path>, timeout: Duration) -> Result<reqwest::Client, ReplayError> {
    let mut builder = reqwest::Client::builder()
        .redirect(Policy::none())
        .timeout(timeout);

    if let Some(path) = upstream_ca {
        let pem = std::fs::read(path)
            .map_err(|e| ReplayError::Build(format!("read {}: {}", path.display(), e)))?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}

/// Build a live request from a stored one: method, URL, headers, cookies
/// and body
pub fn build_request(request: &Request) -> Result<reqwest::Request, ReplayError> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| ReplayError::Build(format!("method: {:?}", request.method)))?;
    let mut live = reqwest::Request::new(method, request.build_url()?);

    let headers = live.headers_mut();
    for (name, value) in &request.headers {
        if is_rebuilt_header(name) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ReplayError::Build(format!("header name: {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ReplayError::Build(format!("header value for {}", name)))?;
        headers.insert(name, value);
    }

    if !request.cookies.is_empty() {
        let cookie = request
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        let cookie = HeaderValue::from_str(&cookie)
            .map_err(|_| ReplayError::Build("cookie header".to_string()))?;
        headers.insert(COOKIE, cookie);
    }

    if !request.body.is_empty() {
        *live.body_mut() = Some(request.body.clone().into());
    }

    Ok(live)
}

/// Send a stored request again and return the first-hop response
pub async fn replay(client: &reqwest::Client, request: &Request) -> Result<reqwest::Response, ReplayError> {
    let live = build_request(request)?;
    debug!("Replaying {} {}", live.method(), live.url());
    Ok(client.execute(live).await?)
}
