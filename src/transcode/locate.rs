//! Finding the ffmpeg executable.
//!
//! Order: explicit override (config or `FFMPEG_PATH`), an installed helper
//! copy, then `ffmpeg` on `PATH`. The override is taken as given; a bad
//! override surfaces as a spawn failure rather than silently falling back.

use std::path::{Path, PathBuf};

use serde::Serialize;

#[cfg(windows)]
const BINARY: &str = "ffmpeg.exe";
#[cfg(not(windows))]
const BINARY: &str = "ffmpeg";

/// Which step of the lookup produced the executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocatedBy {
    Override,
    Installed,
    SearchPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Located {
    pub path: PathBuf,
    pub via: LocatedBy,
}

/// Helper install locations, most specific first:
/// `<data dir>/vega-relay/bin/ffmpeg`, then `bin/ffmpeg` beside the
/// running executable.
pub fn installed_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(data) = dirs::data_dir() {
        candidates.push(data.join("vega-relay").join("bin").join(BINARY));
    }
    if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        candidates.push(dir.join("bin").join(BINARY));
    }
    candidates
}

pub fn locate(explicit: Option<&Path>) -> Option<Located> {
    locate_with(explicit, &installed_candidates(), || which::which(BINARY).ok())
}

pub(crate) fn locate_with(
    explicit: Option<&Path>,
    installed: &[PathBuf],
    search_path: impl FnOnce() -> Option<PathBuf>,
) -> Option<Located> {
    if let Some(path) = explicit {
        return Some(Located {
            path: path.to_path_buf(),
            via: LocatedBy::Override,
        });
    }

    if let Some(path) = installed.iter().find(|p| p.is_file()) {
        return Some(Located {
            path: path.clone(),
            via: LocatedBy::Installed,
        });
    }

    search_path().map(|path| Located {
        path,
        via: LocatedBy::SearchPath,
    })
}
