//! Workspace scanning.
//!
//! A one-shot tree walk feeds every file and directory under the root
//! into the tracker store. Hidden entries and gitignore rules are
//! respected, and the store never tracks its own data directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

use crate::Result;
use crate::tracker::TrackerStore;

/// Names skipped regardless of ignore files.
const ALWAYS_SKIPPED: [&str; 2] = [".git", ".filetrail"];

/// Outcome of one full scan.
#[derive(Debug, Default, Clone)]
pub struct ScanSummary {
    pub tracked: usize,
    /// Walk-level failures: unreadable directories, broken links.
    pub skipped: usize,
    /// Entries the store could not track.
    pub failed: usize,
    pub elapsed: Duration,
}

/// Walk `root` and track everything the filters let through. Individual
/// failures are logged and counted, never fatal. Directory hashes are
/// settled before the summary is returned.
pub async fn run_scan(store: &TrackerStore, root: &Path) -> Result<ScanSummary> {
    let started = Instant::now();
    let mut summary = ScanSummary::default();

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .git_global(false)
        .follow_links(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !ALWAYS_SKIPPED.contains(&name.as_ref())
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("scan skipping entry: {e}");
                summary.skipped += 1;
                continue;
            }
        };
        match store.add_or_update(entry.path()).await {
            Ok(_) => summary.tracked += 1,
            Err(e) => {
                warn!("scan failed to track {}: {e}", entry.path().display());
                summary.failed += 1;
            }
        }
    }

    store.recompute_dir_hashes_now().await?;
    summary.elapsed = started.elapsed();
    debug!(
        tracked = summary.tracked,
        skipped = summary.skipped,
        failed = summary.failed,
        "scan complete"
    );
    Ok(summary)
}

/// Path filter for watcher events, mirroring what the walk skips:
/// `.gitignore` and `.ignore` rules plus hidden entries and the store's
/// own directories.
pub struct IgnoreFilter {
    root: PathBuf,
    inner: Gitignore,
}

impl IgnoreFilter {
    pub fn new(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        builder.add(root.join(".gitignore"));
        builder.add(root.join(".ignore"));
        for pattern in [".*", ".git/", ".filetrail/"] {
            // Static patterns, all valid.
            builder.add_line(None, pattern).ok();
        }
        Self {
            root: root.to_path_buf(),
            inner: builder.build().unwrap_or_else(|_| Gitignore::empty()),
        }
    }

    /// Whether an event on `path` should be dropped. Paths outside the
    /// root are always ignored.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if path == self.root {
            return false;
        }
        if !path.starts_with(&self.root) {
            return true;
        }
        self.inner
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }
}
