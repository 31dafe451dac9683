//! Outbound HTTP Client
//!
//! One pooled client shared by module fetching and by the `axios`/`fetch`
//! capabilities handed to provider scripts.
//!
//! Features:
//! - HTTP/2 when negotiated, keep-alive pooling
//! - TLS 1.3 via rustls
//! - Brotli, Zstd, Gzip compression (auto-negotiated)
//! - Cookie store (scrapers often depend on session cookies)
//! - Browser-like default headers

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::fingerprint::{random_profile, BrowserProfile};

/// A fully buffered response, detached from the connection.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedResponse {
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// The response declares a JSON body; scripts parse `body` when set.
    pub json: bool,
}

fn declares_json(headers: &BTreeMap<String, String>) -> bool {
    headers
        .get("content-type")
        .is_some_and(|ct| ct.contains("json"))
}

/// HTTP client with browser fingerprint and compression
#[derive(Clone)]
pub struct ScrapeClient {
    client: Client,
}

impl ScrapeClient {
    /// Create a client with a random browser profile and the given request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_profile(random_profile(), timeout)
    }

    /// Create client with specific browser profile
    pub fn with_profile(profile: BrowserProfile, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .http2_adaptive_window(true)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .brotli(true)
            .zstd(true)
            .gzip(true)
            .deflate(true)
            .default_headers(profile.to_headers())
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_store(true)
            .build()?;

        Ok(Self { client })
    }

    /// Fetch a URL with a plain GET
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<Response> {
        debug!("GET");
        let response = self.client.get(url).send().await?;
        debug!(status = %response.status(), version = ?response.version(), "Response received");
        Ok(response)
    }

    /// Send a request and buffer the body as text.
    ///
    /// Non-success statuses are returned, not raised; callers decide.
    #[instrument(skip(self, headers, body), fields(method = %method, url = %url))]
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
    ) -> Result<CapturedResponse> {
        let mut request = self.client.request(method, url).headers(to_header_map(headers));
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.text().await?;
        debug!(status, bytes = body.len(), "Response buffered");

        Ok(CapturedResponse {
            url: final_url,
            status,
            json: declares_json(&headers),
            headers,
            body,
        })
    }
}

/// Convert loosely typed script headers, skipping names or values reqwest rejects.
fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = %name, "Skipping invalid header");
            continue;
        };
        map.insert(name, value);
    }
    map
}
