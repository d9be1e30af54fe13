//! Download directory watching.
//!
//! The export control drops a file into a fixed directory; we snapshot the
//! directory before the trigger, wait for a new entry, then wait for its
//! size to hold still. Markup artifacts must carry their closing tag or the
//! download counts as incomplete.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::PipelineError;
use crate::retry::Sleeper;

/// Window for a new file to appear after the export trigger.
pub const APPEAR_WINDOW: Duration = Duration::from_secs(10);

/// Overall cap on waiting for the file size to stabilize.
pub const STABILIZE_WINDOW: Duration = Duration::from_secs(30);

/// Consecutive unchanged size polls required to call the file complete.
pub const STABLE_POLLS: u32 = 3;

const POLL: Duration = Duration::from_secs(1);

/// Files present in the directory right now.
pub fn snapshot(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        files.insert(entry?.path());
    }
    Ok(files)
}

/// Poll for a file that was not in `before`, within `APPEAR_WINDOW`.
pub async fn wait_for_new_file(
    dir: &Path,
    before: &HashSet<PathBuf>,
    sleeper: &dyn Sleeper,
) -> Result<PathBuf, PipelineError> {
    let polls = APPEAR_WINDOW.as_secs().max(1);
    for _ in 0..polls {
        sleeper.sleep(POLL).await;
        let after = snapshot(dir).map_err(|e| PipelineError::DownloadDir {
            dir: dir.display().to_string(),
            source: e,
        })?;
        if let Some(path) = after.difference(before).next() {
            tracing::info!(file = %path.display(), "download started");
            return Ok(path.clone());
        }
    }
    Err(PipelineError::DownloadMissing {
        dir: dir.display().to_string(),
        window: APPEAR_WINDOW,
    })
}

/// Wait until the file's size is unchanged across `STABLE_POLLS` polls, or
/// the stabilize window runs out. Metadata errors (e.g. the browser renaming
/// its temp file) reset the stability count rather than failing the stage.
pub async fn wait_for_stable_size(path: &Path, sleeper: &dyn Sleeper) -> Result<u64, PipelineError> {
    let mut last_size: Option<u64> = None;
    let mut stable = 0u32;

    for _ in 0..STABILIZE_WINDOW.as_secs().max(1) {
        sleeper.sleep(POLL).await;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let size = meta.len();
                if Some(size) == last_size {
                    stable += 1;
                    if stable >= STABLE_POLLS {
                        tracing::info!(file = %path.display(), size, "download size stable");
                        return Ok(size);
                    }
                } else {
                    stable = 0;
                    last_size = Some(size);
                    tracing::debug!(file = %path.display(), size, "download in progress");
                }
            }
            Err(e) => {
                tracing::debug!(file = %path.display(), error = %e, "size poll failed, retrying");
                stable = 0;
                last_size = None;
            }
        }
    }

    // Window elapsed; take whatever size we last saw rather than discarding
    // the artifact. Completeness is verified separately.
    match last_size {
        Some(size) => Ok(size),
        None => Err(PipelineError::DownloadMissing {
            dir: path.display().to_string(),
            window: STABILIZE_WINDOW,
        }),
    }
}

/// For textual/markup artifacts, require the closing marker. A truncated
/// export must never reach the sink.
pub fn verify_markup_complete(path: &Path) -> Result<(), PipelineError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            // Binary exports (e.g. real xlsx) are not verifiable here.
            tracing::warn!(file = %path.display(), error = %e, "completeness check skipped");
            return Ok(());
        }
    };

    let head = content.trim_start().to_ascii_lowercase();
    if head.starts_with("<html") || head.starts_with("<!doctype") {
        if !content.trim_end().to_ascii_lowercase().ends_with("</html>") {
            return Err(PipelineError::DownloadIncomplete {
                path: path.display().to_string(),
            });
        }
        tracing::debug!(file = %path.display(), "markup artifact complete");
    }
    Ok(())
}
