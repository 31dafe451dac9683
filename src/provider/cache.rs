//! TTL cache of provider module sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{ModuleSet, ProviderKey, Role};
use crate::config::ModulesConfig;
use crate::http_client::ScrapeClient;

/// Where module sources come from.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Source text of one role. Any error means the role is absent.
    async fn fetch(&self, key: &ProviderKey, role: Role) -> Result<String>;
}

/// `{base}/{key}/{role}.js` over HTTP.
pub struct HttpModuleSource {
    client: ScrapeClient,
    base_url: String,
}

impl HttpModuleSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: ScrapeClient::new(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, key: &ProviderKey, role: Role) -> String {
        format!("{}/{}/{}.js", self.base_url, key, role)
    }
}

#[async_trait]
impl ModuleSource for HttpModuleSource {
    async fn fetch(&self, key: &ProviderKey, role: Role) -> Result<String> {
        let url = self.url_for(key, role);
        let response = self
            .client
            .fetch(&url)
            .await?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        Ok(response.text().await?)
    }
}

struct CacheEntry {
    modules: Arc<ModuleSet>,
    fetched_at: Instant,
}

/// Provider modules keyed by normalized provider, refreshed after `ttl`.
///
/// Entries are swapped whole, so a reader sees either the old set or the
/// new one. Concurrent refreshes of one key may both fetch; the last write
/// wins.
pub struct ModuleCache {
    source: Arc<dyn ModuleSource>,
    ttl: Duration,
    entries: RwLock<HashMap<ProviderKey, CacheEntry>>,
}

impl ModuleCache {
    pub fn new(source: Arc<dyn ModuleSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// HTTP-backed cache from configuration.
    pub fn from_config(config: &ModulesConfig) -> Result<Self> {
        let source = HttpModuleSource::new(
            config.base_url.clone(),
            Duration::from_secs(config.fetch_timeout_secs),
        )?;
        Ok(Self::new(Arc::new(source), config.ttl()))
    }

    /// Modules for `provider`, from cache when fresh.
    #[instrument(skip(self))]
    pub async fn get_modules(&self, provider: &str) -> Arc<ModuleSet> {
        let key = ProviderKey::normalize(provider);

        if let Some(entry) = self.entries.read().await.get(&key) {
            if entry.fetched_at.elapsed() < self.ttl {
                debug!(%key, "Module cache hit");
                return Arc::clone(&entry.modules);
            }
        }

        let modules = Arc::new(self.fetch_all(&key).await);
        info!(%key, roles = modules.len(), "Fetched provider modules");

        self.entries.write().await.insert(
            key,
            CacheEntry {
                modules: Arc::clone(&modules),
                fetched_at: Instant::now(),
            },
        );
        modules
    }

    async fn fetch_all(&self, key: &ProviderKey) -> ModuleSet {
        let fetches = Role::ALL.into_iter().map(|role| async move {
            match self.source.fetch(key, role).await {
                Ok(source) => Some((role, source)),
                Err(e) => {
                    warn!(%key, %role, error = %format!("{e:#}"), "Module missing");
                    None
                }
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }

    /// Drop one provider's entry. Returns whether one was cached.
    pub async fn invalidate(&self, provider: &str) -> bool {
        let key = ProviderKey::normalize(provider);
        self.entries.write().await.remove(&key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory source counting every fetch.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub modules: Mutex<HashMap<(String, Role), String>>,
        pub fetches: AtomicUsize,
    }

    impl FakeSource {
        pub(crate) fn with(entries: &[(&str, Role, &str)]) -> Self {
            let source = Self::default();
            {
                let mut modules = source.modules.lock().unwrap();
                for (key, role, text) in entries {
                    modules.insert(((*key).to_string(), *role), (*text).to_string());
                }
            }
            source
        }

        pub(crate) fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModuleSource for FakeSource {
        async fn fetch(&self, key: &ProviderKey, role: Role) -> Result<String> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.modules
                .lock()
                .unwrap()
                .get(&(key.as_str().to_string(), role))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404 for {key}/{role}"))
        }
    }

    fn cache(source: &Arc<FakeSource>) -> ModuleCache {
        ModuleCache::new(Arc::clone(source) as Arc<dyn ModuleSource>, Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn hits_within_ttl_do_not_refetch() {
        let source = Arc::new(FakeSource::with(&[("vega", Role::Stream, "exports.a = 1;")]));
        let cache = cache(&source);

        let first = cache.get_modules("vega").await;
        assert_eq!(source.fetches(), Role::ALL.len());
        tokio::time::advance(Duration::from_secs(599)).await;
        let second = cache.get_modules("vega").await;
        assert_eq!(source.fetches(), Role::ALL.len());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_refetched() {
        let source = Arc::new(FakeSource::with(&[("vega", Role::Stream, "exports.a = 1;")]));
        let cache = cache(&source);

        let first = cache.get_modules("vega").await;
        tokio::time::advance(Duration::from_secs(601)).await;
        let second = cache.get_modules("vega").await;
        assert_eq!(source.fetches(), 2 * Role::ALL.len());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn alias_and_canonical_share_one_entry() {
        let source = Arc::new(FakeSource::with(&[("mod", Role::Stream, "exports.a = 1;")]));
        let cache = cache(&source);

        let via_alias = cache.get_modules("modflix").await;
        let canonical = cache.get_modules("mod").await;
        assert!(Arc::ptr_eq(&via_alias, &canonical));
        assert_eq!(source.fetches(), Role::ALL.len());
        assert_eq!(canonical.get(Role::Stream), Some("exports.a = 1;"));
    }

    #[tokio::test]
    async fn failed_roles_are_absent() {
        let source = Arc::new(FakeSource::with(&[
            ("vega", Role::Posts, "exports.getPosts = 1;"),
            ("vega", Role::Meta, "exports.getMeta = 1;"),
        ]));
        let cache = cache(&source);

        let modules = cache.get_modules("vega").await;
        assert_eq!(modules.roles().collect::<Vec<_>>(), vec![Role::Posts, Role::Meta]);
        assert!(modules.get(Role::Stream).is_none());
    }

    #[tokio::test]
    async fn invalidate_and_clear() {
        let source = Arc::new(FakeSource::with(&[("vega", Role::Stream, "x")]));
        let cache = cache(&source);

        cache.get_modules("vega").await;
        assert!(cache.invalidate("VEGA").await);
        assert!(!cache.invalidate("vega").await);
        cache.get_modules("vega").await;
        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(source.fetches(), 2 * Role::ALL.len());
    }

    #[test]
    fn http_source_builds_role_urls() {
        let source = HttpModuleSource::new("https://modules.example/dist/", Duration::from_secs(15)).unwrap();
        let key = ProviderKey::normalize("Modflix");
        assert_eq!(
            source.url_for(&key, Role::Stream),
            "https://modules.example/dist/mod/stream.js"
        );
    }
}
