//! Live transcode proxy: remote media in, browser-playable MP4 out.
//!
//! Each [`TranscodeProxy::open`] spawns one ffmpeg process that pulls the
//! upstream URL itself and writes fragmented MP4 to stdout. The returned
//! [`TranscodeStream`] owns the process; dropping the stream kills it.

pub mod command;
pub mod locate;
pub mod session;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::config::TranscodeConfig;
use crate::fingerprint::chrome_profile;

pub use locate::{Located, LocatedBy};
pub use session::{EndReason, SessionHandle, SessionState, TranscodeStream};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("ffmpeg not found (set FFMPEG_PATH or install ffmpeg)")]
    TranscoderUnavailable,

    #[error("failed to start {}: {source}", path.display())]
    TranscoderSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg probe failed: {0}")]
    Probe(String),
}

pub type Result<T> = std::result::Result<T, TranscodeError>;

/// Result of checking that the transcoder can run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub available: bool,
    pub path: PathBuf,
    pub located_by: LocatedBy,
    pub version: String,
    pub codec: &'static str,
    pub audio: &'static str,
}

pub struct TranscodeProxy {
    ffmpeg_path: Option<PathBuf>,
    user_agent: String,
    stderr_lines: usize,
    spawned: AtomicU64,
}

impl TranscodeProxy {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            user_agent: chrome_profile().user_agent,
            stderr_lines: config.stderr_lines,
            spawned: AtomicU64::new(0),
        }
    }

    /// Processes started so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn locate(&self) -> Option<Located> {
        locate::locate(self.ffmpeg_path.as_deref())
    }

    /// Start transcoding `upstream_url`. Input is validated before anything
    /// is spawned.
    #[instrument(skip_all, fields(url = %upstream_url))]
    pub fn open(&self, upstream_url: &str, referer: Option<&str>) -> Result<TranscodeStream> {
        let upstream = validate_url(upstream_url)?;
        let referer = validate_referer(referer)?;
        let ffmpeg = self.locate().ok_or(TranscodeError::TranscoderUnavailable)?;

        let headers = command::header_block(&self.user_agent, referer.as_deref());
        let child = Command::new(&ffmpeg.path)
            .args(command::build_args(&upstream, &headers))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| spawn_error(&ffmpeg.path, source))?;

        let id = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            session = id,
            ffmpeg = %ffmpeg.path.display(),
            has_referer = referer.is_some(),
            "Transcode session started"
        );

        TranscodeStream::start(id, upstream, referer, child, self.stderr_lines)
            .map_err(|source| spawn_error(&ffmpeg.path, source))
    }

    /// Run `ffmpeg -version` and report the first line.
    pub async fn probe(&self) -> Result<ProbeReport> {
        let ffmpeg = self.locate().ok_or(TranscodeError::TranscoderUnavailable)?;

        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(&ffmpeg.path)
                .arg("-version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TranscodeError::Probe("timed out".to_string()))?
        .map_err(|source| spawn_error(&ffmpeg.path, source))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Probe(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        Ok(ProbeReport {
            available: true,
            path: ffmpeg.path,
            located_by: ffmpeg.via,
            version,
            codec: "libx264",
            audio: "aac",
        })
    }
}

fn spawn_error(path: &Path, source: std::io::Error) -> TranscodeError {
    TranscodeError::TranscoderSpawn {
        path: path.to_path_buf(),
        source,
    }
}

fn validate_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let url = url::Url::parse(raw)
        .map_err(|e| TranscodeError::InvalidInput(format!("url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(TranscodeError::InvalidInput(format!(
            "url '{raw}' must be absolute http(s)"
        )));
    }
    Ok(url.to_string())
}

fn validate_referer(referer: Option<&str>) -> Result<Option<String>> {
    match referer.map(str::trim) {
        None | Some("") => Ok(None),
        Some(r) if r.contains(['\r', '\n']) => Err(TranscodeError::InvalidInput(
            "referer must be a single line".to_string(),
        )),
        Some(r) => Ok(Some(r.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(path: &str) -> TranscodeProxy {
        TranscodeProxy::new(&TranscodeConfig {
            ffmpeg_path: Some(PathBuf::from(path)),
            stderr_lines: 16,
        })
    }

    #[tokio::test]
    async fn bad_url_never_spawns() {
        let proxy = proxy("/nonexistent/ffmpeg");
        for bad in ["not-a-url", "ftp://host/file", "/relative/path", "", "file:///etc/passwd"] {
            let err = proxy.open(bad, None).unwrap_err();
            assert!(matches!(err, TranscodeError::InvalidInput(_)), "{bad}: {err}");
        }
        assert_eq!(proxy.spawned(), 0);
    }

    #[tokio::test]
    async fn multiline_referer_rejected() {
        let proxy = proxy("/nonexistent/ffmpeg");
        let err = proxy
            .open("https://cdn.example/v.mp4", Some("https://a.example\r\nX-Evil: 1"))
            .unwrap_err();
        assert!(matches!(err, TranscodeError::InvalidInput(_)));
        assert_eq!(proxy.spawned(), 0);
    }

    #[tokio::test]
    async fn missing_override_is_spawn_error() {
        let proxy = proxy("/nonexistent/ffmpeg");
        let err = proxy.open("https://cdn.example/v.mp4", None).unwrap_err();
        assert!(matches!(err, TranscodeError::TranscoderSpawn { .. }), "{err}");
        assert_eq!(proxy.spawned(), 0);
    }

    #[test]
    fn referer_blank_is_none() {
        assert_eq!(validate_referer(Some("  ")).unwrap(), None);
        assert_eq!(
            validate_referer(Some("https://site.example/")).unwrap().as_deref(),
            Some("https://site.example/")
        );
    }

    #[test]
    fn url_is_normalized() {
        assert_eq!(
            validate_url(" https://cdn.example/a b.mp4 ").unwrap(),
            "https://cdn.example/a%20b.mp4"
        );
    }
}
