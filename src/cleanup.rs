//! Removal of temporary capture artifacts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, warn};

use crate::capture::{read_summary, Summary, PIPE_PREFIX, SUMMARY_SUFFIX};

pub const DEFAULT_TTL_MINUTES: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupConfig {
    pub keep_capture: bool,
    pub ttl_minutes: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { keep_capture: false, ttl_minutes: DEFAULT_TTL_MINUTES }
    }
}

/// Deletes a capture and its summary on drop, but only when the summary marks them as
/// temporary, `keep_capture` is off, and both live under `root`.
#[derive(Debug)]
pub struct TempArtifacts {
    capture: PathBuf,
    summary_path: Option<PathBuf>,
    root: PathBuf,
    armed: bool,
}

impl TempArtifacts {
    pub fn new(
        capture: &Path,
        summary_path: Option<&Path>,
        summary: Option<&Summary>,
        root: &Path,
        keep_capture: bool,
    ) -> Self {
        let inside = |path: &Path| path != root && path.starts_with(root);
        let armed = !keep_capture
            && summary.is_some_and(|summary| summary.temp)
            && inside(capture)
            && summary_path.map_or(true, inside);
        Self {
            capture: capture.to_path_buf(),
            summary_path: summary_path.map(Path::to_path_buf),
            root: root.to_path_buf(),
            armed,
        }
    }

    pub fn will_remove(&self) -> bool {
        self.armed
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(path = %self.capture.display(), root = %self.root.display(), "removing temp capture");
        remove_quietly(&self.capture);
        if let Some(path) = &self.summary_path {
            remove_quietly(path);
        }
    }
}

/// Removes a capture and its summary unconditionally, ignoring missing files.
pub fn remove_artifacts(capture: &Path, summary_path: &Path) {
    remove_quietly(capture);
    remove_quietly(summary_path);
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(?err, path = %path.display(), "failed to remove capture artifact"),
    }
}

/// Removes temp captures left behind by viewers that never ran or crashed: every
/// `ot-*.meta.json` in `dir` older than `ttl_minutes` whose summary says `temp`, plus the
/// capture it points at when that capture is inside `dir`. Returns the number of summaries
/// removed. A TTL of zero disables the sweep.
pub fn sweep_orphans(dir: &Path, ttl_minutes: u64) -> usize {
    if ttl_minutes == 0 {
        return 0;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(?err, dir = %dir.display(), "skipping orphan sweep");
            return 0;
        }
    };
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(ttl_minutes.saturating_mul(60)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(PIPE_PREFIX) || !name.ends_with(SUMMARY_SUFFIX) {
            continue;
        }
        let modified = entry.metadata().and_then(|meta| meta.modified());
        match modified {
            Ok(at) if at <= cutoff => {}
            _ => continue,
        }
        let path = entry.path();
        let Ok(summary) = read_summary(&path) else {
            continue;
        };
        if !summary.temp {
            continue;
        }
        remove_quietly(&path);
        let capture = &summary.capture_path;
        if capture != dir && capture.starts_with(dir) {
            remove_quietly(capture);
        }
        removed += 1;
    }
    if removed > 0 {
        debug!(removed, dir = %dir.display(), "swept orphaned captures");
    }
    removed
}
