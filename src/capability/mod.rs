//! Host capabilities available to provider scripts.
//!
//! [`CapabilityContext`] is the only channel between sandboxed code and the
//! outside world. It is built once per process, shared by `Arc`, and holds
//! no per-request state: HTTP calls are independent, parsing and crypto are
//! pure functions, and the base URL cache is internally synchronized.
//!
//! | script name | Rust side |
//! |-------------|-----------|
//! | `axios`, `fetch` | [`CapabilityContext::http_request`] |
//! | `cheerio.load` | [`html::select`] |
//! | `Crypto` | [`crypto`] |
//! | `getBaseUrl` | [`BaseUrlResolver`] |
//! | `commonHeaders` | [`CapabilityContext::common_headers`] |
//! | `extractors` | [`extract`] |

pub mod baseurl;
pub mod crypto;
pub mod extract;
pub mod html;

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use thiserror::Error;

pub use baseurl::BaseUrlResolver;

use crate::config::CapabilityConfig;
use crate::fingerprint::chrome_profile;
use crate::http_client::{CapturedResponse, ScrapeClient};

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("no base URL known for provider '{0}'")]
    UnknownProvider(String),

    #[error("invalid selector {0}")]
    Selector(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("decrypt error: {0}")]
    Decrypt(String),
}

pub type Result<T> = std::result::Result<T, CapabilityError>;

pub struct CapabilityContext {
    client: ScrapeClient,
    base_urls: BaseUrlResolver,
    common_headers: BTreeMap<String, String>,
}

impl CapabilityContext {
    pub fn new(config: &CapabilityConfig) -> anyhow::Result<Self> {
        let profile = chrome_profile();
        let client = ScrapeClient::with_profile(
            profile.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let base_urls = BaseUrlResolver::new(
            client.clone(),
            config.base_url_manifest.clone(),
            Duration::from_secs(config.base_url_ttl_secs),
        );
        let common_headers = profile
            .header_pairs()
            .into_iter()
            .filter(|(name, _)| *name != "Accept-Encoding")
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        Ok(Self {
            client,
            base_urls,
            common_headers,
        })
    }

    /// Browser-like headers scripts attach to their own requests.
    /// `Accept-Encoding` is left to the client, which negotiates it.
    pub fn common_headers(&self) -> &BTreeMap<String, String> {
        &self.common_headers
    }

    /// Perform one outbound request on behalf of a script.
    ///
    /// Only absolute http(s) URLs are accepted. Header values that are not
    /// strings are stringified the way JavaScript would.
    pub async fn http_request(
        &self,
        method: &str,
        url: &str,
        headers: &serde_json::Map<String, serde_json::Value>,
        body: Option<String>,
    ) -> Result<CapturedResponse> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CapabilityError::InvalidRequest(format!("bad method '{method}'")))?;

        let parsed = url::Url::parse(url)
            .map_err(|e| CapabilityError::InvalidRequest(format!("bad url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CapabilityError::InvalidRequest(format!(
                "scheme '{}' is not allowed",
                parsed.scheme()
            )));
        }

        let headers: BTreeMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| {
                let value = match value {
                    serde_json::Value::Null => return None,
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((name.clone(), value))
            })
            .collect();

        self.client
            .request(method, parsed.as_str(), &headers, body)
            .await
            .map_err(|e| CapabilityError::Http(format!("{e:#}")))
    }

    /// Current site base URL for a provider name.
    pub async fn base_url(&self, provider: &str) -> Result<String> {
        self.base_urls.resolve(provider).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CapabilityContext {
        CapabilityContext::new(&CapabilityConfig::default()).unwrap()
    }

    #[test]
    fn common_headers_look_like_a_browser() {
        let ctx = context();
        let headers = ctx.common_headers();
        assert!(headers["User-Agent"].starts_with("Mozilla/5.0"));
        assert!(headers.contains_key("Accept"));
        assert!(!headers.contains_key("Accept-Encoding"));
    }

    #[tokio::test]
    async fn non_http_schemes_are_refused() {
        let ctx = context();
        let headers = serde_json::Map::new();
        for url in ["file:///etc/passwd", "ftp://example.com/x", "not a url"] {
            let err = ctx.http_request("GET", url, &headers, None).await.unwrap_err();
            assert!(matches!(err, CapabilityError::InvalidRequest(_)), "{url}");
        }
    }

    #[tokio::test]
    async fn bad_method_is_refused() {
        let ctx = context();
        let err = ctx
            .http_request("GE T", "https://example.com", &serde_json::Map::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidRequest(_)));
    }
}
