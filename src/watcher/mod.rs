//! Filesystem watch loop.
//!
//! Streams `notify` events into the tracker store: creates and modifies
//! upsert, removes untrack, rename pairs re-point the tracked identifier.
//! Paths the scan would skip are skipped here with the same filter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Error;
use crate::scan::IgnoreFilter;
use crate::tracker::TrackerStore;

pub struct TrackerWatcher {
    root: PathBuf,
    store: Arc<TrackerStore>,
    filter: IgnoreFilter,
}

impl TrackerWatcher {
    pub fn new(root: PathBuf, store: Arc<TrackerStore>) -> Self {
        let filter = IgnoreFilter::new(&root);
        Self { root, store, filter }
    }

    /// Watch the root recursively until the event stream closes.
    pub async fn run(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        info!("watching {}", self.root.display());

        while let Some(res) = rx.recv().await {
            match res {
                Ok(event) => self.handle_event(event).await,
                Err(e) => warn!("watch error: {e}"),
            }
        }
        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = event.paths.as_slice() {
                    if self.filter.is_ignored(to, to.is_dir()) {
                        // Moved somewhere the scan would not look; drop it.
                        self.untrack(from).await;
                        return;
                    }
                    match self.store.rename(from, to).await {
                        Ok(Some(_)) => debug!("renamed {} -> {}", from.display(), to.display()),
                        // The source was never tracked; treat it as an add.
                        Ok(None) => self.track(to).await,
                        Err(e) => warn!("rename to {} failed: {e}", to.display()),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.untrack(path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.track(path).await;
                }
            }
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    self.track(path).await;
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.untrack(path).await;
                }
            }
            _ => {}
        }
    }

    async fn track(&self, path: &Path) {
        if self.filter.is_ignored(path, path.is_dir()) {
            return;
        }
        match self.store.add_or_update(path).await {
            Ok(_) => debug!("tracked {}", path.display()),
            // The path raced away between the event and the stat.
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to track {}: {e}", path.display()),
        }
    }

    async fn untrack(&self, path: &Path) {
        if self.filter.is_ignored(path, false) {
            return;
        }
        match self.store.remove(path).await {
            Ok(true) => debug!("untracked {}", path.display()),
            Ok(false) => {}
            Err(e) => warn!("failed to untrack {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sharded::{ShardedJsonBackend, ShardedTimings};
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;
    use std::time::Duration;

    fn watcher_on(root: &Path) -> TrackerWatcher {
        let backend = Arc::new(ShardedJsonBackend::with_options(
            root.join(".filetrail/fsdb"),
            true,
            ShardedTimings {
                flush_debounce: Duration::from_millis(40),
                deferred_delay: Duration::from_millis(40),
            },
            Box::new(crate::storage::NoViewer),
        ));
        let store = Arc::new(TrackerStore::with_hash_debounce(
            root.to_path_buf(),
            backend,
            Duration::from_millis(30),
        ));
        TrackerWatcher::new(root.to_path_buf(), store)
    }

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(path.to_path_buf());
        }
        event
    }

    #[tokio::test]
    async fn test_event_dispatch_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher_on(dir.path());
        watcher.store.initialize(false).await.unwrap();

        let a = dir.path().join("a.md");
        fs::write(&a, b"alpha").unwrap();
        watcher
            .handle_event(event(EventKind::Create(CreateKind::File), &[&a]))
            .await;
        let id = watcher.store.id_by_path(&a).await.unwrap().unwrap();

        fs::write(&a, b"alpha beta").unwrap();
        watcher
            .handle_event(event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &[&a],
            ))
            .await;
        let record = watcher.store.record(id).await.unwrap().unwrap();
        assert_eq!(record.size, 10);

        let b = dir.path().join("b.md");
        fs::rename(&a, &b).unwrap();
        watcher
            .handle_event(event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &[&a, &b],
            ))
            .await;
        assert_eq!(watcher.store.id_by_path(&b).await.unwrap(), Some(id));
        assert_eq!(watcher.store.id_by_path(&a).await.unwrap(), None);

        fs::remove_file(&b).unwrap();
        watcher
            .handle_event(event(EventKind::Remove(RemoveKind::File), &[&b]))
            .await;
        assert_eq!(watcher.store.id_by_path(&b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ignored_paths_never_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), b"*.log\n").unwrap();
        let watcher = watcher_on(dir.path());
        watcher.store.initialize(false).await.unwrap();

        let log = dir.path().join("build.log");
        fs::write(&log, b"noise").unwrap();
        watcher
            .handle_event(event(EventKind::Create(CreateKind::File), &[&log]))
            .await;
        assert_eq!(watcher.store.id_by_path(&log).await.unwrap(), None);

        let hidden = dir.path().join(".cache");
        fs::create_dir(&hidden).unwrap();
        watcher
            .handle_event(event(EventKind::Create(CreateKind::Folder), &[&hidden]))
            .await;
        assert_eq!(watcher.store.id_by_path(&hidden).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rename_into_ignored_territory_untracks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), b"archive/\n").unwrap();
        fs::create_dir(dir.path().join("archive")).unwrap();
        let watcher = watcher_on(dir.path());
        watcher.store.initialize(false).await.unwrap();

        let a = dir.path().join("a.md");
        fs::write(&a, b"alpha").unwrap();
        watcher
            .handle_event(event(EventKind::Create(CreateKind::File), &[&a]))
            .await;
        assert!(watcher.store.id_by_path(&a).await.unwrap().is_some());

        let hidden = dir.path().join("archive/a.md");
        fs::rename(&a, &hidden).unwrap();
        watcher
            .handle_event(event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &[&a, &hidden],
            ))
            .await;
        assert_eq!(watcher.store.id_by_path(&a).await.unwrap(), None);
        assert_eq!(watcher.store.id_by_path(&hidden).await.unwrap(), None);
    }
}
