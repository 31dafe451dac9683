//! Provider modules: naming, caching and resolution.
//!
//! A provider is a third-party site whose scraping logic ships as one
//! script per [`Role`]. [`ModuleCache`] fetches those scripts,
//! [`StreamResolver`] runs them in the sandbox.

pub mod cache;
pub mod resolver;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::sandbox::SandboxError;

pub use cache::{HttpModuleSource, ModuleCache, ModuleSource};
pub use resolver::{CatalogSection, EnvironmentReport, ExportLookup, ProviderReport, StreamResolver};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider '{0}' has no stream module")]
    NoStreamModule(String),

    #[error("provider '{0}' exports no stream function")]
    NoStreamFunction(String),

    #[error("provider '{provider}' has no {role} module")]
    NoModule { provider: String, role: Role },

    #[error("provider '{provider}' {role} module exports none of {expected}")]
    NoExport {
        provider: String,
        role: Role,
        expected: String,
    },

    #[error("unexpected {role} result: {message}")]
    InvalidResult { role: Role, message: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Alternate spellings that share one module set.
const ALIASES: &[(&str, &str)] = &[
    ("modflix", "mod"),
    ("moviesmod", "mod"),
    ("multimovie", "multi"),
    ("multimovies", "multi"),
    ("world4ufree", "world4u"),
    ("hdhub", "hdhub4u"),
];

/// Normalized provider identifier: trimmed, lowercase, aliases resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProviderKey(String);

impl ProviderKey {
    pub fn normalize(raw: &str) -> Self {
        let key = raw.trim().to_lowercase();
        let canonical = ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map_or(key, |(_, target)| (*target).to_string());
        Self(canonical)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Functional category of a provider script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Posts,
    Meta,
    Stream,
    Catalog,
    Episodes,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Posts,
        Role::Meta,
        Role::Stream,
        Role::Catalog,
        Role::Episodes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Posts => "posts",
            Role::Meta => "meta",
            Role::Stream => "stream",
            Role::Catalog => "catalog",
            Role::Episodes => "episodes",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown role '{s}'"))
    }
}

/// Script source per role for one provider. Absent roles are simply missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSet {
    sources: BTreeMap<Role, String>,
}

impl ModuleSet {
    pub fn get(&self, role: Role) -> Option<&str> {
        self.sources.get(&role).map(String::as_str)
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.sources.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl FromIterator<(Role, String)> for ModuleSet {
    fn from_iter<I: IntoIterator<Item = (Role, String)>>(iter: I) -> Self {
        Self {
            sources: iter.into_iter().collect(),
        }
    }
}

/// One playable media reference produced by a provider's stream script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    #[serde(default, deserialize_with = "lenient_name")]
    pub server: String,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub label: Option<String>,
    pub link: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_name")]
    pub kind: String,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub quality: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<serde_json::Value>,
    /// Provider-specific keys, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StreamDescriptor {
    /// Fill an empty `server` from `title`, then `label`.
    #[must_use]
    pub fn named(mut self) -> Self {
        if self.server.is_empty() {
            if let Some(name) = self.title.as_ref().or(self.label.as_ref()) {
                self.server = name.clone();
            }
        }
        self
    }
}

fn lenient_name<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

/// Scripts send quality as `720` or `"720"`; keep it a string.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliases_canonicalize() {
        assert_eq!(ProviderKey::normalize("modflix").as_str(), "mod");
        assert_eq!(ProviderKey::normalize("  MoviesMod ").as_str(), "mod");
        assert_eq!(ProviderKey::normalize("multimovies").as_str(), "multi");
        assert_eq!(ProviderKey::normalize("hdhub").as_str(), "hdhub4u");
        assert_eq!(ProviderKey::normalize("Vega").as_str(), "vega");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["modflix", "world4ufree", "HDHUB", "vega", "mod"] {
            let once = ProviderKey::normalize(raw);
            assert_eq!(ProviderKey::normalize(once.as_str()), once);
        }
    }

    #[test]
    fn roles_parse_and_print() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert_eq!("Stream".parse::<Role>().unwrap(), Role::Stream);
        assert!("search".parse::<Role>().is_err());
    }

    #[test]
    fn descriptor_accepts_numeric_quality_and_title() {
        let descriptor: StreamDescriptor = serde_json::from_value(json!({
            "title": "Server 1",
            "link": "https://cdn.example/v.m3u8",
            "type": "m3u8",
            "quality": 1080,
            "headers": { "Referer": "https://site.example/" },
        }))
        .unwrap();
        let descriptor = descriptor.named();
        assert_eq!(descriptor.server, "Server 1");
        assert_eq!(descriptor.quality.as_deref(), Some("1080"));
        assert_eq!(descriptor.kind, "m3u8");
        assert!(descriptor.subtitles.is_none());

        let back = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(back["server"], "Server 1");
        assert_eq!(back["title"], "Server 1");
        assert_eq!(back["type"], "m3u8");
        assert!(back.get("size").is_none());
    }

    #[test]
    fn descriptor_keeps_server_title_and_label_side_by_side() {
        let descriptor: StreamDescriptor = serde_json::from_value(json!({
            "server": "S1",
            "title": "1080p WEB",
            "label": "HD",
            "link": "https://cdn.example/a.mkv",
            "type": "mkv",
        }))
        .unwrap();
        let descriptor = descriptor.named();
        assert_eq!(descriptor.server, "S1");
        assert_eq!(descriptor.title.as_deref(), Some("1080p WEB"));
        assert_eq!(descriptor.label.as_deref(), Some("HD"));

        let named: StreamDescriptor = serde_json::from_value(json!({ "label": "Alt", "link": "x" })).unwrap();
        assert_eq!(named.named().server, "Alt");
    }

    #[test]
    fn descriptor_passes_unknown_keys_through() {
        let descriptor: StreamDescriptor = serde_json::from_value(json!({
            "server": "S1",
            "link": "https://cdn.example/a.m3u8",
            "type": "m3u8",
            "requiresExtraction": true,
            "subtitles": [{ "lang": "en", "uri": "https://cdn.example/en.vtt" }],
            "headers": null,
        }))
        .unwrap();
        assert_eq!(descriptor.extra["requiresExtraction"], true);
        assert!(descriptor.headers.is_none());

        let back = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(back["requiresExtraction"], true);
        assert_eq!(back["subtitles"][0]["lang"], "en");
    }

    #[test]
    fn descriptor_requires_link() {
        let parsed = serde_json::from_value::<StreamDescriptor>(json!({ "server": "x" }));
        assert!(parsed.is_err());
    }
}
