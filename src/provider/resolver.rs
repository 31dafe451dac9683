//! Runs provider scripts for streams and the other roles.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{ModuleCache, ProviderError, ProviderKey, Result, Role, StreamDescriptor};
use crate::sandbox::{ExportSurface, SandboxError, SandboxExecutor};

/// One way a module may expose a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportLookup {
    /// `exports.<name>`
    Direct(&'static str),
    /// `exports.default.<name>`, as emitted for `export default { ... }`
    DefaultWrapped(&'static str),
}

impl ExportLookup {
    pub fn path(self) -> String {
        match self {
            ExportLookup::Direct(name) => name.to_string(),
            ExportLookup::DefaultWrapped(name) => format!("default.{name}"),
        }
    }

    /// Direct then default-wrapped, for each name in order.
    pub fn conventional(names: &[&'static str]) -> Vec<ExportLookup> {
        names
            .iter()
            .flat_map(|&name| [ExportLookup::Direct(name), ExportLookup::DefaultWrapped(name)])
            .collect()
    }
}

/// Stream function lookup order. First match wins.
pub const STREAM_EXPORTS: [ExportLookup; 4] = [
    ExportLookup::Direct("getStream"),
    ExportLookup::DefaultWrapped("getStream"),
    ExportLookup::Direct("stream"),
    ExportLookup::DefaultWrapped("stream"),
];

/// First lookup that names a function on `surface`.
pub async fn find_export(
    surface: &ExportSurface,
    lookups: &[ExportLookup],
) -> Result<Option<ExportLookup>> {
    for lookup in lookups {
        if surface.is_function(&lookup.path()).await? {
            return Ok(Some(*lookup));
        }
    }
    Ok(None)
}

/// One home-page row: a catalog entry and the posts its filter yields.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSection {
    pub title: String,
    pub filter: String,
    pub posts: Value,
}

/// Diagnostics for one provider's stream module.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReport {
    pub provider: String,
    pub key: ProviderKey,
    pub modules: Vec<Role>,
    pub stream_module: StreamModuleReport,
    pub get_stream: ExportReport,
    pub environment: EnvironmentReport,
}

/// Where the relay itself is running.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub platform: &'static str,
    pub arch: &'static str,
}

impl EnvironmentReport {
    pub fn current() -> Self {
        Self {
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamModuleReport {
    pub available: bool,
    pub size: usize,
    pub executed: bool,
    pub error: Option<String>,
    pub exports: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    pub available: bool,
    pub path: Option<String>,
}

pub struct StreamResolver {
    modules: Arc<ModuleCache>,
    sandbox: Arc<SandboxExecutor>,
}

impl StreamResolver {
    pub fn new(modules: Arc<ModuleCache>, sandbox: Arc<SandboxExecutor>) -> Self {
        Self { modules, sandbox }
    }

    pub fn modules(&self) -> &Arc<ModuleCache> {
        &self.modules
    }

    pub fn sandbox(&self) -> &Arc<SandboxExecutor> {
        &self.sandbox
    }

    /// Resolve playable streams for `link` through the provider's stream
    /// module.
    ///
    /// A missing stream role fails before anything is executed. A missing
    /// or null result is an empty list; a thrown error comes back verbatim.
    #[instrument(skip_all, fields(provider = %provider))]
    pub async fn resolve_stream(
        &self,
        provider: &str,
        link: &str,
        kind: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamDescriptor>> {
        let modules = self.modules.get_modules(provider).await;
        let source = modules
            .get(Role::Stream)
            .ok_or_else(|| ProviderError::NoStreamModule(provider.to_string()))?;

        let surface = self.sandbox.execute(source, provider).await?;
        let export = find_export(&surface, &STREAM_EXPORTS)
            .await?
            .ok_or_else(|| ProviderError::NoStreamFunction(provider.to_string()))?;
        debug!(export = %export.path(), "Stream export found");

        let result = surface
            .invoke(&export.path(), &json!({ "link": link, "type": kind }), cancel)
            .await?;
        streams_from(result)
    }

    /// Run the first conventional export of `role` with `args`.
    #[instrument(skip_all, fields(provider = %provider, role = %role))]
    pub async fn invoke_role(
        &self,
        provider: &str,
        role: Role,
        names: &[&'static str],
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let surface = self.load_role(provider, role).await?;
        let lookups = ExportLookup::conventional(names);
        let export = find_export(&surface, &lookups)
            .await?
            .ok_or_else(|| ProviderError::NoExport {
                provider: provider.to_string(),
                role,
                expected: names.join(", "),
            })?;
        Ok(surface.invoke(&export.path(), &args, cancel).await?)
    }

    async fn load_role(&self, provider: &str, role: Role) -> Result<ExportSurface> {
        let modules = self.modules.get_modules(provider).await;
        let source = modules.get(role).ok_or_else(|| ProviderError::NoModule {
            provider: provider.to_string(),
            role,
        })?;
        Ok(self.sandbox.execute(source, provider).await?)
    }

    /// `getMeta({ link, provider })`
    pub async fn meta(&self, provider: &str, link: &str, cancel: &CancellationToken) -> Result<Value> {
        self.invoke_role(
            provider,
            Role::Meta,
            &["getMeta"],
            json!({ "link": link, "provider": provider }),
            cancel,
        )
        .await
    }

    /// `getEpisodes({ url })`, null treated as no episodes.
    pub async fn episodes(&self, provider: &str, url: &str, cancel: &CancellationToken) -> Result<Value> {
        let result = self
            .invoke_role(provider, Role::Episodes, &["getEpisodes"], json!({ "url": url }), cancel)
            .await?;
        Ok(if result.is_null() { json!([]) } else { result })
    }

    /// `getPosts({ filter, page, providerValue })`
    pub async fn posts(
        &self,
        provider: &str,
        filter: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.invoke_role(
            provider,
            Role::Posts,
            &["getPosts"],
            json!({ "filter": filter, "page": page, "providerValue": provider }),
            cancel,
        )
        .await
    }

    /// Catalog entries with their first page of posts.
    ///
    /// A row whose posts fail is kept with an empty list.
    #[instrument(skip_all, fields(provider = %provider))]
    pub async fn home(&self, provider: &str, cancel: &CancellationToken) -> Result<Vec<CatalogSection>> {
        let surface = self.load_role(provider, Role::Catalog).await?;
        let catalog = match surface.get_json("catalog").await? {
            Some(catalog) => catalog,
            None => surface
                .get_json("default.catalog")
                .await?
                .unwrap_or_else(|| json!([])),
        };
        drop(surface);

        let entries = catalog.as_array().ok_or_else(|| ProviderError::InvalidResult {
            role: Role::Catalog,
            message: "catalog is not an array".to_string(),
        })?;

        let mut sections = Vec::with_capacity(entries.len());
        for entry in entries {
            let title = entry["title"].as_str().unwrap_or_default().to_string();
            let filter = entry["filter"].as_str().unwrap_or_default().to_string();
            let posts = match self.posts(provider, &filter, 1, cancel).await {
                Ok(posts) if !posts.is_null() => posts,
                Ok(_) => json!([]),
                Err(e @ ProviderError::Sandbox(SandboxError::Cancelled)) => return Err(e),
                Err(e) => {
                    warn!(%title, error = %e, "Catalog row failed");
                    json!([])
                }
            };
            sections.push(CatalogSection { title, filter, posts });
        }
        Ok(sections)
    }

    /// Fetch and load the stream module without invoking it.
    pub async fn inspect(&self, provider: &str) -> ProviderReport {
        let key = ProviderKey::normalize(provider);
        let modules = self.modules.get_modules(provider).await;
        let mut stream_module = StreamModuleReport::default();
        let mut get_stream = ExportReport::default();

        if let Some(source) = modules.get(Role::Stream) {
            stream_module.available = true;
            stream_module.size = source.len();
            match self.sandbox.execute(source, provider).await {
                Ok(surface) => {
                    stream_module.executed = true;
                    stream_module.exports = surface.keys().await.ok();
                    if let Ok(Some(export)) = find_export(&surface, &STREAM_EXPORTS).await {
                        get_stream.available = true;
                        get_stream.path = Some(export.path());
                    }
                }
                Err(e) => stream_module.error = Some(e.to_string()),
            }
        }

        ProviderReport {
            provider: provider.to_string(),
            key,
            modules: modules.roles().collect(),
            stream_module,
            get_stream,
            environment: EnvironmentReport::current(),
        }
    }
}

/// Normalize a stream function's result. Null is no streams; any entry that
/// is not a descriptor fails the whole result.
fn streams_from(result: Value) -> Result<Vec<StreamDescriptor>> {
    let items = match result {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => {
            return Err(ProviderError::InvalidResult {
                role: Role::Stream,
                message: format!("expected an array, got {other}"),
            })
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<StreamDescriptor>(item)
                .map(StreamDescriptor::named)
                .map_err(|e| ProviderError::InvalidResult {
                    role: Role::Stream,
                    message: format!("entry {index}: {e}"),
                })
        })
        .collect()
}
