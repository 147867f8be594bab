//! Canonical representation of a captured HTTP exchange
//!
//! Requests and responses are flattened into string maps so they can be
//! stored, listed through the API, replayed and mutated by scanners.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, COOKIE, HOST};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use tracing::debug;
use url::{form_urlencoded, Url};

/// Ordered name -> value map used for headers, cookies and parameters
pub type FieldMap = BTreeMap<String, String>;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// One captured request/response pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Assigned by the store on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub request: Request,
    pub response: Response,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Create an unsaved transaction stamped with the current time
    pub fn new(request: Request, response: Response) -> Self {
        Self {
            id: None,
            request,
            response,
            created_at: Utc::now(),
        }
    }
}

/// Captured request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub version: String,
    pub host: String,
    pub path: String,
    /// `http` or `https`, depending on whether the exchange was intercepted over TLS
    #[serde(rename = "protocol")]
    pub scheme: String,
    pub headers: FieldMap,
    pub cookies: FieldMap,
    pub query_params: FieldMap,
    pub form_params: FieldMap,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Captured response. The body is kept for storage but left out of JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: FieldMap,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl Request {
    /// Build the model from request parts and an already buffered body.
    ///
    /// The body is only borrowed, so the caller can still forward the
    /// original bytes after extraction.
    pub fn from_parts(parts: &http::request::Parts, body: &[u8], tls: bool) -> Self {
        let body = decode_body(&parts.headers, body);

        let host = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(|h| h.to_string())
            })
            .unwrap_or_default();

        let query_params = parts
            .uri
            .query()
            .map(|q| parse_pairs(q.as_bytes()))
            .unwrap_or_default();

        let form_params = if has_form_body(&parts.method, &parts.headers) {
            parse_pairs(&body)
        } else {
            FieldMap::new()
        };

        Self {
            method: parts.method.as_str().to_string(),
            version: format!("{:?}", parts.version),
            host,
            path: parts.uri.path().to_string(),
            scheme: if tls { "https" } else { "http" }.to_string(),
            headers: join_headers(&parts.headers),
            cookies: parse_cookies(&parts.headers),
            query_params,
            form_params,
            body,
        }
    }

    /// Absolute URL built from scheme, host, path and query parameters
    pub fn build_url(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.scheme.is_empty() { "http" } else { &self.scheme };
        let mut url = Url::parse(&format!("{}://{}{}", scheme, self.host, self.path))?;

        if !self.query_params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                query.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

impl Response {
    pub fn from_parts(parts: &http::response::Parts, body: &[u8]) -> Self {
        Self {
            status: parts.status.as_u16(),
            headers: join_headers(&parts.headers),
            body: body.to_vec(),
        }
    }
}

/// Encode form parameters as an `application/x-www-form-urlencoded` body
pub fn build_form_body(form: &FieldMap) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(form.iter())
        .finish()
}

/// Join multi-valued headers with ", "
fn join_headers(headers: &HeaderMap) -> FieldMap {
    let mut joined = FieldMap::new();
    for name in headers.keys() {
        let value = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        joined.insert(name.as_str().to_string(), value);
    }
    joined
}

fn parse_cookies(headers: &HeaderMap) -> FieldMap {
    let mut cookies = FieldMap::new();
    for value in headers.get_all(COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for cookie in cookie::Cookie::split_parse(value).flatten() {
            cookies.insert(cookie.name().to_string(), cookie.value().to_string());
        }
    }
    cookies
}

/// Parse `a=1&b=2` pairs, joining repeated keys with ", "
fn parse_pairs(input: &[u8]) -> FieldMap {
    let mut pairs = FieldMap::new();
    for (key, value) in form_urlencoded::parse(input) {
        pairs
            .entry(key.into_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    pairs
}

fn has_form_body(method: &Method, headers: &HeaderMap) -> bool {
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        return false;
    }
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase().starts_with(FORM_URLENCODED))
        .unwrap_or(false)
}

fn decode_body(headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    if !gzip || body.is_empty() {
        return body.to_vec();
    }

    let mut decoded = Vec::new();
    match GzDecoder::new(body).read_to_end(&mut decoded) {
        Ok(_) => decoded,
        Err(e) => {
            debug!("keeping raw request body, gzip decode failed: {}", e);
            body.to_vec()
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
