//! Transport capability: one HTTP GET with a browser fingerprint.
//!
//! Plain HTTP requests, no browser. Retries, rate limiting and challenge
//! handling live in the orchestrator; a transport performs exactly one request.

use crate::error::TransportError;
use crate::fingerprint::FingerprintProfile;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Mutex;
use std::time::Duration;

/// Response from an HTTP GET request.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// Final URL after redirects.
    pub final_url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers (selected subset, lowercase names).
    pub headers: Vec<(String, String)>,
    /// Response body as text.
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            final_url: String::new(),
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// First header value with the given (lowercase) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Retry-After` in whole seconds, when the server sent the delta form.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Performs a single HTTP request presenting a browser fingerprint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one GET request.
    async fn send(
        &self,
        url: &str,
        profile: &FingerprintProfile,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;

    /// Release pooled connections. Later sends may reopen them.
    async fn close(&self) {}
}

/// `reqwest`-backed transport with a persistent cookie jar.
///
/// The client is built on first use and dropped by [`Transport::close`].
pub struct HttpTransport {
    client: Mutex<Option<reqwest::Client>>,
    max_redirects: usize,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Mutex::new(None),
            max_redirects: 10,
        }
    }

    fn client(&self) -> Result<reqwest::Client, TransportError> {
        let mut slot = self.client.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects))
            .cookie_store(true)
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {e}")))?;
        *slot = Some(client.clone());
        Ok(client)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn profile_headers(profile: &FingerprintProfile) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in profile.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            map.insert(HeaderName::from_static(name), value);
        }
    }
    map
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        profile: &FingerprintProfile,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.client()?;
        let resp = client
            .get(url)
            .headers(profile_headers(profile))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| match TransportError::from(e) {
                TransportError::Timeout(_) => TransportError::Timeout(timeout.as_millis() as u64),
                other => other,
            })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .filter(|(k, _)| {
                matches!(
                    k.as_str(),
                    "content-type" | "content-language" | "retry-after" | "server" | "location"
                )
            })
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = resp.text().await.map_err(TransportError::from)?;

        Ok(TransportResponse {
            final_url,
            status,
            headers,
            body,
        })
    }

    async fn close(&self) {
        let dropped = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if dropped.is_some() {
            tracing::debug!("HTTP transport closed");
        }
    }
}
