//! Provider site base URLs.
//!
//! Provider domains move often, so scripts ask for the current one instead
//! of hardcoding it. The answer comes from a remote JSON manifest of the
//! form `{"Name": {"name": "...", "url": "https://..."}}`, cached for a TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CapabilityError, Result};
use crate::http_client::ScrapeClient;

pub struct BaseUrlResolver {
    client: ScrapeClient,
    manifest_url: String,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<HashMap<String, String>>)>>,
}

impl BaseUrlResolver {
    pub fn new(client: ScrapeClient, manifest_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            manifest_url: manifest_url.into(),
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Current base URL for `provider` (manifest key, case-insensitive).
    pub async fn resolve(&self, provider: &str) -> Result<String> {
        let manifest = self.manifest().await?;
        lookup(&manifest, provider).ok_or_else(|| CapabilityError::UnknownProvider(provider.to_string()))
    }

    async fn manifest(&self) -> Result<Arc<HashMap<String, String>>> {
        if let Some((fetched_at, manifest)) = self.cached.read().await.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(manifest));
            }
        }

        debug!(url = %self.manifest_url, "Refreshing base URL manifest");
        let body = self
            .client
            .fetch(&self.manifest_url)
            .await
            .and_then(|r| Ok(r.error_for_status()?))
            .map_err(|e| CapabilityError::Http(format!("{e:#}")))?
            .text()
            .await
            .map_err(|e| CapabilityError::Http(e.to_string()))?;

        let manifest = Arc::new(parse_manifest(&body)?);
        *self.cached.write().await = Some((Instant::now(), Arc::clone(&manifest)));
        Ok(manifest)
    }
}

/// Flatten the manifest into `name -> url`. Entries without a string `url`
/// are skipped with a warning.
pub(crate) fn parse_manifest(body: &str) -> Result<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| CapabilityError::Decode(format!("base URL manifest: {e}")))?;
    let entries = value
        .as_object()
        .ok_or_else(|| CapabilityError::Decode("base URL manifest is not an object".to_string()))?;

    let mut urls = HashMap::with_capacity(entries.len());
    for (name, entry) in entries {
        match entry.get("url").and_then(serde_json::Value::as_str) {
            Some(url) => {
                urls.insert(name.clone(), url.trim_end_matches('/').to_string());
            }
            None => warn!(provider = %name, "Manifest entry has no url"),
        }
    }
    Ok(urls)
}

fn lookup(manifest: &HashMap<String, String>, provider: &str) -> Option<String> {
    manifest.get(provider).cloned().or_else(|| {
        manifest
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(provider))
            .map(|(_, url)| url.clone())
    })
}
