//! Configuration loaded from `~/.config/vega-relay/config.toml`.
//!
//! Every field has a default, so the file is optional and may be partial:
//!
//! ```toml
//! [modules]
//! base_url = "https://example.com/providers/dist"
//! ttl_secs = 300
//!
//! [transcode]
//! ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
//! ```
//!
//! `FFMPEG_PATH` in the environment overrides `transcode.ffmpeg_path`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable naming an explicit transcoder executable.
pub const FFMPEG_PATH_ENV: &str = "FFMPEG_PATH";

/// Default location of compiled provider modules.
pub const DEFAULT_MODULE_BASE_URL: &str =
    "https://raw.githubusercontent.com/Zenda-Cross/vega-providers/refs/heads/main/dist";

/// Default manifest mapping provider names to their current site URL.
pub const DEFAULT_BASE_URL_MANIFEST: &str = "https://himanshu8443.github.io/providers/modflix.json";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub modules: ModulesConfig,
    pub sandbox: SandboxConfig,
    pub capabilities: CapabilityConfig,
    pub transcode: TranscodeConfig,
    pub server: ServerConfig,
}

/// Where provider modules come from and how long they stay cached.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub base_url: String,
    pub ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODULE_BASE_URL.to_string(),
            ttl_secs: 10 * 60,
            fetch_timeout_secs: 15,
        }
    }
}

impl ModulesConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Resource limits for each sandboxed execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// QuickJS heap limit in MiB
    pub memory_limit_mb: usize,
    /// QuickJS stack limit in KiB
    pub max_stack_kb: usize,
    /// Wall-clock budget for synchronous script execution
    pub cpu_timeout_secs: u64,
    /// Overall budget for one exported function call, including awaited I/O
    pub invoke_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 32,
            max_stack_kb: 1024,
            cpu_timeout_secs: 10,
            invoke_timeout_secs: 60,
        }
    }
}

/// Settings for the capabilities scripts can call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub request_timeout_secs: u64,
    pub base_url_manifest: String,
    pub base_url_ttl_secs: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            base_url_manifest: DEFAULT_BASE_URL_MANIFEST.to_string(),
            base_url_ttl_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Explicit transcoder executable; wins over every other lookup
    pub ffmpeg_path: Option<PathBuf>,
    /// How many trailing stderr lines each session keeps for diagnostics
    pub stderr_lines: usize,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            stderr_lines: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    ///
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&config_path())?;
        config.apply_env(std::env::var_os(FFMPEG_PATH_ENV).map(PathBuf::from));
        Ok(config)
    }

    /// Load from an explicit path without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))
    }

    /// An explicit transcoder path from the environment beats the file.
    pub fn apply_env(&mut self, ffmpeg_path: Option<PathBuf>) {
        if let Some(path) = ffmpeg_path.filter(|p| !p.as_os_str().is_empty()) {
            self.transcode.ffmpeg_path = Some(path);
        }
    }
}

/// Return the path to the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vega-relay")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.modules.base_url, DEFAULT_MODULE_BASE_URL);
        assert_eq!(config.modules.ttl(), Duration::from_secs(600));
        assert!(config.transcode.ffmpeg_path.is_none());
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[modules]
ttl_secs = 30

[transcode]
ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.modules.ttl_secs, 30);
        assert_eq!(config.modules.fetch_timeout_secs, 15);
        assert_eq!(
            config.transcode.ffmpeg_path,
            Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"))
        );
        assert_eq!(config.transcode.stderr_lines, 64);
    }

    #[test]
    fn env_override_wins_unless_empty() {
        let mut config: Config = toml::from_str("[transcode]\nffmpeg_path = \"/a\"").unwrap();
        config.apply_env(Some(PathBuf::new()));
        assert_eq!(config.transcode.ffmpeg_path, Some(PathBuf::from("/a")));

        config.apply_env(Some(PathBuf::from("/b")));
        assert_eq!(config.transcode.ffmpeg_path, Some(PathBuf::from("/b")));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3000");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[modules\nbroken").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
