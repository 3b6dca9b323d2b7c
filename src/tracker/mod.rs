//! Tracker store: the single mutation path over a storage backend.
//!
//! [`TrackerStore`] owns the in-memory [`TrackingIndex`] and keeps it
//! consistent with whichever backend it wraps. All writes funnel through
//! it, which is what lets identifiers survive renames: the caller reports
//! filesystem events against paths, the store resolves them to identifiers
//! and decides what actually changed.
//!
//! Directory hashes are maintained lazily. Every content-relevant change
//! marks the ancestor chain dirty and arms a short debounce; when it fires,
//! dirty directories are recomputed deepest-first so parents fold in fresh
//! child hashes within the same pass.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::hash::{self, tracked_directory_hash};
use crate::index::TrackingIndex;
use crate::record::{TrackedRecord, now_ms, parent_key, rel_key};
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Default settle delay before dirty directory hashes are recomputed.
const HASH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Running totals for one store session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackerCounters {
    pub records_added: u64,
    pub records_updated: u64,
    /// Updates skipped because hash, size and mtime all matched.
    pub unchanged_skips: u64,
    pub records_removed: u64,
    pub renames: u64,
    pub payload_writes: u64,
    /// Payload writes skipped because the value was already stored.
    pub payload_skips: u64,
    pub dir_hash_recomputes: u64,
}

/// Aggregate view over everything tracked, for reporting.
#[derive(Debug, Default, Clone)]
pub struct TrackerSummary {
    pub total_entries: usize,
    pub file_count: usize,
    pub directory_count: usize,
    pub total_bytes: u64,
    /// File counts keyed by lower-cased extension; extensionless files
    /// land under `"(none)"`.
    pub by_extension: BTreeMap<String, usize>,
}

/// Path-addressed metadata store over a pluggable backend.
pub struct TrackerStore {
    shared: Arc<StoreShared>,
}

struct StoreShared {
    root: PathBuf,
    backend: Arc<dyn StorageBackend>,
    hash_debounce: Duration,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    initialized: bool,
    index: TrackingIndex,
    /// Directory keys whose structural hash is stale.
    dirty_dirs: BTreeSet<String>,
    /// Bumped on every (re)schedule; a woken recompute task with a stale
    /// generation does nothing.
    hash_gen: u64,
    counters: TrackerCounters,
}

fn ensure_init(state: &StoreState) -> Result<()> {
    if !state.initialized {
        return Err(Error::NotInitialized("tracker store"));
    }
    Ok(())
}

fn system_time_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Mark every ancestor of `key` (up to and including the root key) dirty.
fn mark_ancestors(state: &mut StoreState, key: &str) {
    let mut parent = parent_key(key);
    while let Some(p) = parent {
        parent = parent_key(&p);
        state.dirty_dirs.insert(p);
    }
}

impl TrackerStore {
    pub fn new(root: PathBuf, backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_hash_debounce(root, backend, HASH_DEBOUNCE)
    }

    pub fn with_hash_debounce(
        root: PathBuf,
        backend: Arc<dyn StorageBackend>,
        hash_debounce: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                root,
                backend,
                hash_debounce,
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.shared.backend)
    }

    // ========== Lifecycle ==========

    /// Bring up the backend and seed the index. Path mappings are always
    /// loaded in full; with `preload` the records come along too,
    /// otherwise they are pulled in as paths get touched.
    pub async fn initialize(&self, preload: bool) -> Result<()> {
        self.shared.backend.initialize().await?;

        let mut index = TrackingIndex::new();
        if let Some(snapshot) = self.shared.backend.load_index().await? {
            index.apply_snapshot(&snapshot);
        }
        for (path, id) in self.shared.backend.all_path_mappings().await? {
            let is_dir = index.is_directory_id(&id);
            index.insert_mapping(path, id, is_dir);
        }
        if preload {
            let ids = index.ids();
            for (_, record) in self.shared.backend.load_batch(&ids).await? {
                index.insert(record);
            }
        }

        let mut state = self.shared.state.lock().await;
        state.index = index;
        state.dirty_dirs.clear();
        state.counters = TrackerCounters::default();
        state.initialized = true;
        debug!(
            mapped = state.index.len(),
            loaded = state.index.loaded_len(),
            "tracker store initialized"
        );
        Ok(())
    }

    /// Drain pending directory hashes, persist the index snapshot and shut
    /// the backend down. The store is unusable afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !state.initialized {
            return Ok(());
        }
        // Invalidate any armed recompute timer; this drain supersedes it.
        state.hash_gen = state.hash_gen.wrapping_add(1);
        recompute_dirty(&self.shared, &mut state).await?;
        let snapshot = state.index.snapshot();
        self.shared.backend.save_index(&snapshot).await?;
        self.shared.backend.close().await?;
        *state = StoreState::default();
        Ok(())
    }

    // ========== Mutations ==========

    /// Track `path`, creating a record on first sight and updating the
    /// stored one otherwise. Files whose hash, size and mtime all match
    /// the stored record are skipped without touching the backend.
    pub async fn add_or_update(&self, path: &Path) -> Result<Uuid> {
        let key = rel_key(&self.shared.root, path)?;
        let abs = self.absolute(&key);
        let meta = tokio::fs::metadata(&abs).await?;
        let is_dir = meta.is_dir();
        let size = if is_dir { 0 } else { meta.len() };
        let modified_at = meta.modified().map(system_time_ms).unwrap_or(0);
        let content_hash = if is_dir {
            String::new()
        } else {
            hash::hash_file(&abs).await?
        };

        let existing_id = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            state.index.id_by_path(&key)
        };
        let existing = match existing_id {
            Some(id) => self.loaded_record(id).await?.map(|r| (id, r)),
            None => None,
        };

        let now = now_ms();
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;

        if let Some((id, record)) = existing {
            if !is_dir && record.is_unchanged(&content_hash, size, modified_at) {
                state.counters.unchanged_skips += 1;
                return Ok(id);
            }
            let hash_changed = !is_dir && record.hash != content_hash;
            let mut updated = record;
            if !is_dir {
                updated.hash = content_hash;
            }
            updated.size = size;
            updated.modified_at = modified_at;
            updated.is_temporary = false;
            updated.touch(now);
            state.index.insert(updated.clone());
            state.counters.records_updated += 1;
            self.shared.backend.save(id, &updated).await?;
            if hash_changed {
                mark_ancestors(&mut state, &key);
                schedule_recompute(&self.shared, &mut state);
            }
            return Ok(id);
        }

        let mut record = TrackedRecord::new(&key, is_dir);
        if let Some(id) = existing_id {
            // The mapping survived but the record did not (lost or corrupt
            // shard). Keep the identifier, rebuild the rest.
            warn!(path = %key, "record missing for mapped path, rebuilding");
            record.id = id;
        }
        record.size = size;
        record.modified_at = modified_at;
        if !is_dir {
            record.hash = content_hash;
        }
        let id = record.id;
        if let Some(displaced) = state.index.insert(record.clone()) {
            self.shared.backend.delete(displaced.id).await?;
        }
        state.counters.records_added += 1;
        self.shared.backend.save(id, &record).await?;
        self.shared.backend.save_path_mapping(&key, id).await?;
        if is_dir {
            state.dirty_dirs.insert(key.clone());
        }
        mark_ancestors(&mut state, &key);
        schedule_recompute(&self.shared, &mut state);
        Ok(id)
    }

    /// Stop tracking `path`. Returns whether anything was tracked there.
    /// Removing a directory leaves its descendants tracked; they fall to
    /// their own removal events or to [`cleanup_missing`](Self::cleanup_missing).
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        let key = rel_key(&self.shared.root, path)?;
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        let Some((id, _)) = state.index.remove_by_path(&key) else {
            return Ok(false);
        };
        state.counters.records_removed += 1;
        self.shared.backend.delete(id).await?;
        self.shared.backend.delete_path_mapping(&key).await?;
        mark_ancestors(&mut state, &key);
        schedule_recompute(&self.shared, &mut state);
        Ok(true)
    }

    /// Re-point the record at `old` to `new`, preserving its identifier.
    /// Renaming a directory cascades to every tracked descendant. Returns
    /// the identifier, or `None` when nothing was tracked at `old`.
    pub async fn rename(&self, old: &Path, new: &Path) -> Result<Option<Uuid>> {
        let old_key = rel_key(&self.shared.root, old)?;
        let new_key = rel_key(&self.shared.root, new)?;

        let (id, is_dir, child_ids) = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            let Some(id) = state.index.id_by_path(&old_key) else {
                return Ok(None);
            };
            if old_key == new_key {
                return Ok(Some(id));
            }
            let is_dir = state.index.is_directory_id(&id);
            let child_ids: Vec<Uuid> = if is_dir {
                state.index.descendants_of(&old_key).map(|(_, id)| *id).collect()
            } else {
                Vec::new()
            };
            (id, is_dir, child_ids)
        };

        // Pull the affected records into memory so the rename rewrites
        // their path fields, not just the mappings.
        let _ = self.loaded_record(id).await?;
        if !child_ids.is_empty() {
            let found = self.shared.backend.load_batch(&child_ids).await?;
            let mut state = self.shared.state.lock().await;
            for (_, record) in found {
                if state.index.get(&record.id).is_none() {
                    state.index.insert(record);
                }
            }
        }

        let now = now_ms();
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        if state.index.rekey(&old_key, &new_key).is_none() {
            return Ok(None);
        }

        let mut saves: Vec<(Uuid, TrackedRecord)> = Vec::new();
        let mut new_mappings: Vec<(String, Uuid)> = vec![(new_key.clone(), id)];
        let mut stale_keys: Vec<String> = vec![old_key.clone()];
        if let Some(record) = state.index.get_mut(&id) {
            record.touch(now);
            saves.push((id, record.clone()));
        }

        if is_dir {
            let children: Vec<(String, Uuid)> = state
                .index
                .descendants_of(&old_key)
                .map(|(key, id)| (key.clone(), *id))
                .collect();
            for (child_key, child_id) in children {
                let tail = &child_key[old_key.len() + 1..];
                let child_new = format!("{new_key}/{tail}");
                state.index.rekey(&child_key, &child_new);
                if let Some(record) = state.index.get_mut(&child_id) {
                    record.touch(now);
                    saves.push((child_id, record.clone()));
                }
                new_mappings.push((child_new, child_id));
                stale_keys.push(child_key);
            }
        }

        state.counters.renames += 1;
        self.shared.backend.save_batch(&saves).await?;
        self.shared.backend.save_path_mapping_batch(&new_mappings).await?;
        for key in &stale_keys {
            self.shared.backend.delete_path_mapping(key).await?;
        }
        mark_ancestors(&mut state, &old_key);
        mark_ancestors(&mut state, &new_key);
        schedule_recompute(&self.shared, &mut state);
        debug!(from = %old_key, to = %new_key, cascaded = stale_keys.len() - 1, "rename");
        Ok(Some(id))
    }

    // ========== Payloads ==========

    /// Attach `value` under the `ns` namespace. Writing a value equal to
    /// the stored one changes nothing and skips the backend entirely.
    pub async fn set_payload(
        &self,
        path: &Path,
        ns: &str,
        value: serde_json::Value,
    ) -> Result<bool> {
        let changed = self
            .mutate_record(path, |record| record.set_payload(ns, value))
            .await?;
        self.count_payload(changed).await;
        Ok(changed.unwrap_or(false))
    }

    pub async fn payload(&self, path: &Path, ns: &str) -> Result<Option<serde_json::Value>> {
        let record = self.record_by_path(path).await?;
        Ok(record.and_then(|r| r.payloads.get(ns).cloned()))
    }

    pub async fn remove_payload(&self, path: &Path, ns: &str) -> Result<bool> {
        let changed = self
            .mutate_record(path, |record| record.remove_payload(ns))
            .await?;
        self.count_payload(changed).await;
        Ok(changed.unwrap_or(false))
    }

    async fn count_payload(&self, changed: Option<bool>) {
        let mut state = self.shared.state.lock().await;
        match changed {
            Some(true) => state.counters.payload_writes += 1,
            Some(false) => state.counters.payload_skips += 1,
            None => {}
        }
    }

    // ========== Temporary entries ==========

    /// Track `path` before it exists on disk. The record carries no hash
    /// and is flagged temporary until the first real update clears it.
    pub async fn create_temporary(&self, path: &Path) -> Result<Uuid> {
        let key = rel_key(&self.shared.root, path)?;
        let existing = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            state.index.id_by_path(&key)
        };
        if let Some(id) = existing {
            self.mark_temporary(path).await?;
            return Ok(id);
        }

        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        let mut record = TrackedRecord::new(&key, false);
        record.is_temporary = true;
        let id = record.id;
        state.index.insert(record.clone());
        state.counters.records_added += 1;
        self.shared.backend.save(id, &record).await?;
        self.shared.backend.save_path_mapping(&key, id).await?;
        Ok(id)
    }

    pub async fn mark_temporary(&self, path: &Path) -> Result<bool> {
        self.set_temporary_flag(path, true).await
    }

    pub async fn mark_saved(&self, path: &Path) -> Result<bool> {
        self.set_temporary_flag(path, false).await
    }

    async fn set_temporary_flag(&self, path: &Path, flag: bool) -> Result<bool> {
        let changed = self
            .mutate_record(path, |record| {
                if record.is_temporary == flag {
                    return false;
                }
                record.is_temporary = flag;
                true
            })
            .await?;
        Ok(changed.unwrap_or(false))
    }

    // ========== Reads ==========

    pub async fn id_by_path(&self, path: &Path) -> Result<Option<Uuid>> {
        let key = rel_key(&self.shared.root, path)?;
        let state = self.shared.state.lock().await;
        ensure_init(&state)?;
        Ok(state.index.id_by_path(&key))
    }

    pub async fn record_by_path(&self, path: &Path) -> Result<Option<TrackedRecord>> {
        let key = rel_key(&self.shared.root, path)?;
        let id = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            state.index.id_by_path(&key)
        };
        match id {
            Some(id) => self.loaded_record(id).await,
            None => Ok(None),
        }
    }

    pub async fn record(&self, id: Uuid) -> Result<Option<TrackedRecord>> {
        {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
        }
        self.loaded_record(id).await
    }

    /// Every tracked record, loading missing ones from the backend.
    pub async fn all_records(&self) -> Result<Vec<TrackedRecord>> {
        self.load_all().await?;
        let state = self.shared.state.lock().await;
        ensure_init(&state)?;
        Ok(state.index.records().cloned().collect())
    }

    pub async fn summary(&self) -> Result<TrackerSummary> {
        self.load_all().await?;
        let state = self.shared.state.lock().await;
        ensure_init(&state)?;
        let mut summary = TrackerSummary {
            total_entries: state.index.len(),
            ..TrackerSummary::default()
        };
        for record in state.index.records() {
            if record.is_directory {
                summary.directory_count += 1;
            } else {
                summary.file_count += 1;
                summary.total_bytes += record.size;
                let ext = if record.extension.is_empty() {
                    "(none)".to_string()
                } else {
                    record.extension.clone()
                };
                *summary.by_extension.entry(ext).or_default() += 1;
            }
        }
        Ok(summary)
    }

    pub async fn counters(&self) -> TrackerCounters {
        self.shared.state.lock().await.counters
    }

    // ========== Maintenance ==========

    /// Drop every tracked entry whose path no longer exists on disk.
    /// Returns the removed keys, sorted.
    pub async fn cleanup_missing(&self) -> Result<Vec<String>> {
        let keys: Vec<String> = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            state.index.paths().map(|(key, _)| key.clone()).collect()
        };

        let mut missing = Vec::new();
        for key in keys {
            if key.is_empty() {
                continue;
            }
            let abs = self.shared.root.join(&key);
            if !tokio::fs::try_exists(&abs).await.unwrap_or(false) {
                missing.push(key);
            }
        }
        if missing.is_empty() {
            return Ok(missing);
        }

        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        for key in &missing {
            if let Some((id, _)) = state.index.remove_by_path(key) {
                state.counters.records_removed += 1;
                self.shared.backend.delete(id).await?;
                self.shared.backend.delete_path_mapping(key).await?;
                mark_ancestors(&mut state, key);
            }
        }
        schedule_recompute(&self.shared, &mut state);
        missing.sort();
        Ok(missing)
    }

    /// Recompute dirty directory hashes immediately instead of waiting for
    /// the debounce. Returns how many directories changed.
    pub async fn recompute_dir_hashes_now(&self) -> Result<usize> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        state.hash_gen = state.hash_gen.wrapping_add(1);
        recompute_dirty(&self.shared, &mut state).await
    }

    /// Whether any directory hash is still waiting on the debounce.
    pub async fn has_pending_dir_hashes(&self) -> bool {
        !self.shared.state.lock().await.dirty_dirs.is_empty()
    }

    // ========== Internals ==========

    fn absolute(&self, key: &str) -> PathBuf {
        if key.is_empty() {
            self.shared.root.clone()
        } else {
            self.shared.root.join(key)
        }
    }

    /// Record for `id`, pulling it out of the backend into the index when
    /// it is not loaded yet.
    async fn loaded_record(&self, id: Uuid) -> Result<Option<TrackedRecord>> {
        {
            let state = self.shared.state.lock().await;
            if let Some(record) = state.index.get(&id) {
                return Ok(Some(record.clone()));
            }
        }
        match self.shared.backend.load(id).await? {
            Some(record) => {
                let mut state = self.shared.state.lock().await;
                state.index.insert(record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Pull every mapped record that is not loaded yet into the index.
    async fn load_all(&self) -> Result<()> {
        let missing: Vec<Uuid> = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            state
                .index
                .paths()
                .filter(|(_, id)| state.index.get(id).is_none())
                .map(|(_, id)| *id)
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let found = self.shared.backend.load_batch(&missing).await?;
        let mut state = self.shared.state.lock().await;
        for (_, record) in found {
            if state.index.get(&record.id).is_none() {
                state.index.insert(record);
            }
        }
        Ok(())
    }

    /// Load the record at `path`, apply `mutate`, and persist it when the
    /// closure reports a change. `Ok(None)` means nothing tracked there.
    async fn mutate_record<F>(&self, path: &Path, mutate: F) -> Result<Option<bool>>
    where
        F: FnOnce(&mut TrackedRecord) -> bool,
    {
        let key = rel_key(&self.shared.root, path)?;
        let id = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            state.index.id_by_path(&key)
        };
        let Some(id) = id else {
            return Ok(None);
        };
        if self.loaded_record(id).await?.is_none() {
            return Ok(None);
        }

        let now = now_ms();
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        let Some(record) = state.index.get_mut(&id) else {
            return Ok(None);
        };
        if !mutate(record) {
            return Ok(Some(false));
        }
        record.updated_at = now;
        let clone = record.clone();
        self.shared.backend.save(id, &clone).await?;
        Ok(Some(true))
    }
}

// ========== Directory hash recompute ==========

fn schedule_recompute(shared: &Arc<StoreShared>, state: &mut StoreState) {
    if state.dirty_dirs.is_empty() {
        return;
    }
    state.hash_gen = state.hash_gen.wrapping_add(1);
    let generation = state.hash_gen;
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(shared.hash_debounce).await;
        recompute_if_current(&shared, generation).await;
    });
}

async fn recompute_if_current(shared: &Arc<StoreShared>, generation: u64) {
    let mut state = shared.state.lock().await;
    if !state.initialized || state.hash_gen != generation {
        return;
    }
    if let Err(e) = recompute_dirty(shared, &mut state).await {
        error!("directory hash recompute failed: {e}");
    }
}

/// Recompute every dirty directory hash, deepest keys first so parents see
/// fresh child hashes, and persist the ones that changed.
async fn recompute_dirty(shared: &StoreShared, state: &mut StoreState) -> Result<usize> {
    if state.dirty_dirs.is_empty() {
        return Ok(0);
    }
    let started = Instant::now();
    let mut keys: Vec<String> = std::mem::take(&mut state.dirty_dirs).into_iter().collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()));

    let now = now_ms();
    let mut changed: Vec<(Uuid, TrackedRecord)> = Vec::new();
    for key in keys {
        let Some(id) = state.index.id_by_path(&key) else {
            continue;
        };
        // Unloaded directory records catch up on a later pass.
        let Some(record) = state.index.get(&id) else {
            continue;
        };
        if !record.is_directory {
            continue;
        }
        let next = tracked_directory_hash(&state.index, &key);
        if next != record.hash {
            let mut updated = record.clone();
            updated.hash = next;
            updated.touch(now);
            state.index.insert(updated.clone());
            state.counters.dir_hash_recomputes += 1;
            changed.push((id, updated));
        }
    }

    if !changed.is_empty() {
        shared.backend.save_batch(&changed).await?;
        debug!(
            directories = changed.len(),
            elapsed = ?started.elapsed(),
            "directory hashes recomputed"
        );
    }
    Ok(changed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{ChildToken, directory_hash, hash_bytes};
    use crate::storage::sharded::{ShardedJsonBackend, ShardedTimings};
    use crate::storage::{NoViewer, sqlite::SqliteBackend};
    use serde_json::json;
    use std::fs;

    fn quick_timings() -> ShardedTimings {
        ShardedTimings {
            flush_debounce: Duration::from_millis(40),
            deferred_delay: Duration::from_millis(40),
        }
    }

    fn sharded_store(root: &Path) -> (TrackerStore, Arc<ShardedJsonBackend>) {
        let backend = Arc::new(ShardedJsonBackend::with_options(
            root.join(".filetrail/fsdb"),
            true,
            quick_timings(),
            Box::new(NoViewer),
        ));
        let store = TrackerStore::with_hash_debounce(
            root.to_path_buf(),
            backend.clone(),
            Duration::from_millis(30),
        );
        (store, backend)
    }

    fn sqlite_store(root: &Path) -> TrackerStore {
        let backend = Arc::new(SqliteBackend::new(
            root.join(".filetrail/tracking.db"),
            Default::default(),
        ));
        TrackerStore::with_hash_debounce(root.to_path_buf(), backend, Duration::from_millis(30))
    }

    fn token(dir: bool, rel: &str, hash: &str) -> ChildToken {
        ChildToken {
            is_directory: dir,
            relative_path: rel.to_string(),
            hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_identifier_stable_across_renames() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        fs::write(dir.path().join("a.md"), b"alpha").unwrap();
        let id = store.add_or_update(&dir.path().join("a.md")).await.unwrap();

        fs::rename(dir.path().join("a.md"), dir.path().join("b.md")).unwrap();
        let renamed = store
            .rename(&dir.path().join("a.md"), &dir.path().join("b.md"))
            .await
            .unwrap();
        assert_eq!(renamed, Some(id));

        fs::rename(dir.path().join("b.md"), dir.path().join("c.md")).unwrap();
        store
            .rename(&dir.path().join("b.md"), &dir.path().join("c.md"))
            .await
            .unwrap();

        assert_eq!(store.id_by_path(&dir.path().join("c.md")).await.unwrap(), Some(id));
        assert_eq!(store.id_by_path(&dir.path().join("a.md")).await.unwrap(), None);
        assert_eq!(store.id_by_path(&dir.path().join("b.md")).await.unwrap(), None);
        let record = store.record(id).await.unwrap().unwrap();
        assert_eq!(record.path, "c.md");
        assert_eq!(record.name, "c.md");
        assert_eq!(store.counters().await.renames, 2);
    }

    #[tokio::test]
    async fn test_unchanged_add_skips_backend_write() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backend) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        let path = dir.path().join("a.md");
        fs::write(&path, b"alpha").unwrap();
        let id = store.add_or_update(&path).await.unwrap();
        let first = store.record(id).await.unwrap().unwrap();
        backend.flush_now(true).await.unwrap();
        assert!(!backend.has_pending_writes().await);

        let again = store.add_or_update(&path).await.unwrap();
        assert_eq!(again, id);
        let counters = store.counters().await;
        assert_eq!(counters.records_added, 1);
        assert_eq!(counters.unchanged_skips, 1);
        assert_eq!(counters.records_updated, 0);
        // Nothing was re-queued for persistence and nothing was touched.
        assert!(!backend.has_pending_writes().await);
        let second = store.record(id).await.unwrap().unwrap();
        assert_eq!(second.updated_at, first.updated_at);
    }

    #[tokio::test]
    async fn test_content_change_updates_record() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backend) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        let path = dir.path().join("a.md");
        fs::write(&path, b"alpha").unwrap();
        let id = store.add_or_update(&path).await.unwrap();
        let created = store.record(id).await.unwrap().unwrap();
        backend.flush_now(true).await.unwrap();

        fs::write(&path, b"alpha beta").unwrap();
        store.add_or_update(&path).await.unwrap();

        let updated = store.record(id).await.unwrap().unwrap();
        assert_eq!(updated.hash, hash_bytes(b"alpha beta"));
        assert_eq!(updated.size, 10);
        assert_eq!(updated.created_at, created.created_at);
        assert!(backend.has_pending_writes().await);
        assert_eq!(store.counters().await.records_updated, 1);
    }

    #[tokio::test]
    async fn test_directory_rename_cascades_to_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
        fs::write(dir.path().join("docs/a.md"), b"a").unwrap();
        fs::write(dir.path().join("docs/sub/b.md"), b"b").unwrap();
        let dir_id = store.add_or_update(&dir.path().join("docs")).await.unwrap();
        let a_id = store.add_or_update(&dir.path().join("docs/a.md")).await.unwrap();
        let b_id = store
            .add_or_update(&dir.path().join("docs/sub/b.md"))
            .await
            .unwrap();
        store.add_or_update(&dir.path().join("docs/sub")).await.unwrap();

        fs::rename(dir.path().join("docs"), dir.path().join("notes")).unwrap();
        let renamed = store
            .rename(&dir.path().join("docs"), &dir.path().join("notes"))
            .await
            .unwrap();
        assert_eq!(renamed, Some(dir_id));

        assert_eq!(
            store.id_by_path(&dir.path().join("notes/a.md")).await.unwrap(),
            Some(a_id)
        );
        assert_eq!(
            store.id_by_path(&dir.path().join("notes/sub/b.md")).await.unwrap(),
            Some(b_id)
        );
        assert_eq!(store.id_by_path(&dir.path().join("docs/a.md")).await.unwrap(), None);
        let b = store.record(b_id).await.unwrap().unwrap();
        assert_eq!(b.path, "notes/sub/b.md");
        assert_eq!(store.counters().await.renames, 1);
    }

    #[tokio::test]
    async fn test_rename_updates_parent_directory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.md"), b"alpha").unwrap();
        store.add_or_update(&dir.path().join("docs")).await.unwrap();
        store.add_or_update(&dir.path().join("docs/a.md")).await.unwrap();
        store.recompute_dir_hashes_now().await.unwrap();

        let content = hash_bytes(b"alpha");
        let before = store
            .record_by_path(&dir.path().join("docs"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.hash, directory_hash(vec![token(false, "a.md", &content)]));

        fs::rename(dir.path().join("docs/a.md"), dir.path().join("docs/b.md")).unwrap();
        store
            .rename(&dir.path().join("docs/a.md"), &dir.path().join("docs/b.md"))
            .await
            .unwrap();
        store.recompute_dir_hashes_now().await.unwrap();

        let after = store
            .record_by_path(&dir.path().join("docs"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.hash, directory_hash(vec![token(false, "b.md", &content)]));
        assert_ne!(after.hash, before.hash);
    }

    #[tokio::test]
    async fn test_dir_hash_debounce_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        fs::create_dir(dir.path().join("docs")).unwrap();
        store.add_or_update(&dir.path().join("docs")).await.unwrap();
        for i in 0..5 {
            let path = dir.path().join(format!("docs/f{i}.md"));
            fs::write(&path, format!("body {i}")).unwrap();
            store.add_or_update(&path).await.unwrap();
        }
        assert!(store.has_pending_dir_hashes().await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!store.has_pending_dir_hashes().await);
        let docs = store
            .record_by_path(&dir.path().join("docs"))
            .await
            .unwrap()
            .unwrap();
        assert!(!docs.hash.is_empty());
        // Far fewer recomputes than adds once the burst settles.
        let counters = store.counters().await;
        assert!(counters.dir_hash_recomputes >= 1);
        assert!(counters.dir_hash_recomputes < 5);
    }

    #[tokio::test]
    async fn test_payload_equality_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backend) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        let path = dir.path().join("a.md");
        fs::write(&path, b"alpha").unwrap();
        store.add_or_update(&path).await.unwrap();
        backend.flush_now(true).await.unwrap();

        let stats = json!({"charCount": 42, "wordCount": 7});
        assert!(store.set_payload(&path, "writingStats", stats.clone()).await.unwrap());
        backend.flush_now(true).await.unwrap();
        assert!(!store.set_payload(&path, "writingStats", stats.clone()).await.unwrap());
        assert!(!backend.has_pending_writes().await);

        assert_eq!(store.payload(&path, "writingStats").await.unwrap(), Some(stats));
        assert_eq!(store.payload(&path, "other").await.unwrap(), None);
        let counters = store.counters().await;
        assert_eq!(counters.payload_writes, 1);
        assert_eq!(counters.payload_skips, 1);

        assert!(store.remove_payload(&path, "writingStats").await.unwrap());
        assert_eq!(store.payload(&path, "writingStats").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_temporary_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        let path = dir.path().join("draft.md");
        let id = store.create_temporary(&path).await.unwrap();
        let record = store.record(id).await.unwrap().unwrap();
        assert!(record.is_temporary);
        assert!(record.hash.is_empty());

        // First real save clears the flag through the normal update path.
        fs::write(&path, b"now it exists").unwrap();
        let same = store.add_or_update(&path).await.unwrap();
        assert_eq!(same, id);
        let record = store.record(id).await.unwrap().unwrap();
        assert!(!record.is_temporary);
        assert!(!record.hash.is_empty());

        assert!(store.mark_temporary(&path).await.unwrap());
        assert!(!store.mark_temporary(&path).await.unwrap());
        assert!(store.mark_saved(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_missing_removes_deleted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();

        fs::write(dir.path().join("keep.md"), b"keep").unwrap();
        fs::write(dir.path().join("drop.md"), b"drop").unwrap();
        store.add_or_update(&dir.path().join("keep.md")).await.unwrap();
        store.add_or_update(&dir.path().join("drop.md")).await.unwrap();

        fs::remove_file(dir.path().join("drop.md")).unwrap();
        let removed = store.cleanup_missing().await.unwrap();
        assert_eq!(removed, vec!["drop.md".to_string()]);
        assert_eq!(store.id_by_path(&dir.path().join("drop.md")).await.unwrap(), None);
        assert!(store.id_by_path(&dir.path().join("keep.md")).await.unwrap().is_some());
        assert!(store.cleanup_missing().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_path_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();
        assert!(!store.remove(&dir.path().join("ghost.md")).await.unwrap());
        assert_eq!(store.counters().await.records_removed, 0);
    }

    #[tokio::test]
    async fn test_summary_counts_files_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(dir.path());
        store.initialize(false).await.unwrap();

        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.md"), b"12345").unwrap();
        fs::write(dir.path().join("docs/b.md"), b"123").unwrap();
        fs::write(dir.path().join("Makefile"), b"all:").unwrap();
        store.add_or_update(&dir.path().join("docs")).await.unwrap();
        store.add_or_update(&dir.path().join("docs/a.md")).await.unwrap();
        store.add_or_update(&dir.path().join("docs/b.md")).await.unwrap();
        store.add_or_update(&dir.path().join("Makefile")).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total_entries, 4);
        assert_eq!(summary.file_count, 3);
        assert_eq!(summary.directory_count, 1);
        assert_eq!(summary.total_bytes, 12);
        assert_eq!(summary.by_extension.get("md"), Some(&2));
        assert_eq!(summary.by_extension.get("(none)"), Some(&1));
    }

    #[tokio::test]
    async fn test_close_persists_and_reopen_resolves_lazily() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.md"), b"alpha").unwrap();

        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();
        store.add_or_update(&dir.path().join("docs")).await.unwrap();
        let id = store.add_or_update(&dir.path().join("docs/a.md")).await.unwrap();
        store.close().await.unwrap();

        // Fresh session over the same data directory.
        let (store, backend) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();
        assert_eq!(
            store.id_by_path(&dir.path().join("docs/a.md")).await.unwrap(),
            Some(id)
        );
        assert_eq!(backend.cached_records().await, 0);
        let record = store.record_by_path(&dir.path().join("docs/a.md")).await.unwrap();
        assert_eq!(record.unwrap().hash, hash_bytes(b"alpha"));
        // The close-time drain persisted the directory hash too.
        let docs = store.record_by_path(&dir.path().join("docs")).await.unwrap().unwrap();
        assert!(docs.is_directory);
        assert!(!docs.hash.is_empty());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = sharded_store(dir.path());
        fs::write(dir.path().join("a.md"), b"alpha").unwrap();
        let err = store.add_or_update(&dir.path().join("a.md")).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_initialize_preload_loads_records() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), b"alpha").unwrap();

        let (store, _) = sharded_store(dir.path());
        store.initialize(false).await.unwrap();
        store.add_or_update(&dir.path().join("a.md")).await.unwrap();
        store.close().await.unwrap();

        let (store, backend) = sharded_store(dir.path());
        store.initialize(true).await.unwrap();
        assert_eq!(backend.cached_records().await, 1);
        store.close().await.unwrap();
    }
}
