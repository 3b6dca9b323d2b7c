//! Sharded JSON storage implementation
//!
//! One shard file per record at `<dir>/<first-2-chars>/<id>.json`, plus an
//! `index.json` that is always rewritten in full. Writes are deferred:
//! mutations land in memory and in a dirty set, and a debounced flush task
//! batches them to disk. A forced flush writes every record reachable
//! through the path map and is the repair path after a crash, since there
//! is no cross-file atomicity between shards and the index.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{
    BackendKind, BackendStats, ExportedData, ExternalViewer, HealthReport, NoViewer,
    StorageBackend,
};
use crate::index::{IndexEntry, IndexSnapshot};
use crate::record::TrackedRecord;
use crate::{Error, Result};

/// Consecutive flushes that may be deferred while the index is externally
/// observed before one proceeds regardless.
pub const MAX_VIEWER_DEFERRALS: u32 = 5;

/// Shards sampled by `check_health`.
const HEALTH_SAMPLE: usize = 10;

/// Debounce delays for the flush task. Tests shrink these.
#[derive(Debug, Clone, Copy)]
pub struct ShardedTimings {
    pub flush_debounce: Duration,
    /// Re-arm delay while the index is externally observed.
    pub deferred_delay: Duration,
}

impl Default for ShardedTimings {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_millis(1000),
            deferred_delay: Duration::from_millis(2000),
        }
    }
}

/// Sharded JSON backend with write-behind persistence.
pub struct ShardedJsonBackend {
    shared: Arc<Shared>,
}

struct Shared {
    data_dir: PathBuf,
    index_path: PathBuf,
    lazy_load: bool,
    timings: ShardedTimings,
    viewer: Box<dyn ExternalViewer>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    initialized: bool,
    records: HashMap<Uuid, TrackedRecord>,
    paths: HashMap<String, Uuid>,
    dir_ids: HashSet<Uuid>,
    dirty: HashSet<Uuid>,
    removed: HashSet<Uuid>,
    has_unsaved: bool,
    /// Bumped on every (re)schedule; a woken flush task with a stale
    /// generation does nothing.
    flush_gen: u64,
    deferrals: u32,
}

impl State {
    fn is_directory(&self, id: &Uuid) -> bool {
        self.dir_ids.contains(id)
            || self.records.get(id).map(|r| r.is_directory).unwrap_or(false)
    }

    fn derive_snapshot(&self) -> IndexSnapshot {
        let mut entries: Vec<IndexEntry> = self
            .paths
            .iter()
            .map(|(path, id)| IndexEntry {
                u: *id,
                p: path.clone(),
                d: self.is_directory(id) as u8,
            })
            .collect();
        entries.sort_by(|a, b| a.p.cmp(&b.p));
        IndexSnapshot::new(entries)
    }
}

fn ensure_init(state: &State) -> Result<()> {
    if !state.initialized {
        return Err(Error::NotInitialized("sharded backend"));
    }
    Ok(())
}

fn shard_path(data_dir: &Path, id: &Uuid) -> PathBuf {
    let s = id.to_string();
    data_dir.join(&s[..2]).join(format!("{s}.json"))
}

impl ShardedJsonBackend {
    pub fn new(data_dir: PathBuf, lazy_load: bool) -> Self {
        Self::with_options(data_dir, lazy_load, ShardedTimings::default(), Box::new(NoViewer))
    }

    pub fn with_options(
        data_dir: PathBuf,
        lazy_load: bool,
        timings: ShardedTimings,
        viewer: Box<dyn ExternalViewer>,
    ) -> Self {
        let index_path = data_dir.join("index.json");
        Self {
            shared: Arc::new(Shared {
                data_dir,
                index_path,
                lazy_load,
                timings,
                viewer,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Write everything pending right now, bypassing the debounce. With
    /// `force`, every record reachable through the path map is written,
    /// not just the dirty set.
    pub async fn flush_now(&self, force: bool) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        // Invalidate any armed timer; this flush supersedes it.
        state.flush_gen = state.flush_gen.wrapping_add(1);
        write_pending(&self.shared, &mut state, force).await
    }

    /// Whether any mutation is still waiting for a flush.
    pub async fn has_pending_writes(&self) -> bool {
        let state = self.shared.state.lock().await;
        state.has_unsaved || !state.dirty.is_empty() || !state.removed.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn cached_records(&self) -> usize {
        self.shared.state.lock().await.records.len()
    }

    async fn read_shard(&self, id: &Uuid) -> Option<TrackedRecord> {
        let path = shard_path(&self.shared.data_dir, id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("failed to read shard {}: {e}", path.display());
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("skipping corrupt shard {}: {e}", path.display());
                None
            }
        }
    }
}

/// Arm (or re-arm) the debounced flush.
fn schedule_flush(shared: &Arc<Shared>, state: &mut State, delay: Duration) {
    state.flush_gen = state.flush_gen.wrapping_add(1);
    let generation = state.flush_gen;
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        flush_if_current(shared, generation).await;
    });
}

async fn flush_if_current(shared: Arc<Shared>, generation: u64) {
    let mut state = shared.state.lock().await;
    if !state.initialized || state.flush_gen != generation {
        return;
    }

    let mut force = false;
    if shared.viewer.is_observed(&shared.index_path) {
        state.deferrals += 1;
        if state.deferrals <= MAX_VIEWER_DEFERRALS {
            debug!(
                "flush deferred, index is externally observed ({}/{})",
                state.deferrals, MAX_VIEWER_DEFERRALS
            );
            let delay = shared.timings.deferred_delay;
            schedule_flush(&shared, &mut state, delay);
            return;
        }
        debug!("deferral limit reached, flushing while observed");
        force = true;
    }

    if let Err(e) = write_pending(&shared, &mut state, force).await {
        error!("background flush failed: {e}");
    }
}

/// Write dirty shards, unlink removed ones, rewrite the index in full.
/// Runs with the state lock held, so a concurrent close waits for it.
async fn write_pending(shared: &Shared, state: &mut State, force: bool) -> Result<()> {
    let started = Instant::now();

    let target_ids: Vec<Uuid> = if force {
        let mut seen: HashSet<Uuid> = state.paths.values().copied().collect();
        seen.extend(state.dirty.iter().copied());
        seen.into_iter().collect()
    } else {
        state.dirty.iter().copied().collect()
    };

    // Group by prefix so each subdirectory is created once. Records not in
    // memory (lazy, never loaded, unchanged) keep their on-disk shards.
    let mut by_prefix: HashMap<String, Vec<(PathBuf, Vec<u8>)>> = HashMap::new();
    let mut written = 0usize;
    for id in &target_ids {
        let Some(record) = state.records.get(id) else {
            continue;
        };
        let path = shard_path(&shared.data_dir, id);
        let body = serde_json::to_vec(record)?;
        let prefix = id.to_string()[..2].to_string();
        by_prefix.entry(prefix).or_default().push((path, body));
        written += 1;
    }
    for (prefix, shards) in by_prefix {
        tokio::fs::create_dir_all(shared.data_dir.join(&prefix)).await?;
        for (path, body) in shards {
            tokio::fs::write(&path, body).await?;
        }
    }

    let removed_count = state.removed.len();
    for id in state.removed.iter() {
        let path = shard_path(&shared.data_dir, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove shard {}: {e}", path.display()),
        }
    }

    let snapshot = state.derive_snapshot();
    tokio::fs::write(&shared.index_path, serde_json::to_vec(&snapshot)?).await?;

    state.dirty.clear();
    state.removed.clear();
    state.has_unsaved = false;
    state.deferrals = 0;
    debug!(
        "flushed {written} shards, {removed_count} removals in {:?}{}",
        started.elapsed(),
        if force { " (forced)" } else { "" }
    );
    Ok(())
}

/// Read every parsable shard under `data_dir`. Corrupt shards are skipped.
async fn scan_shards(data_dir: &Path) -> Result<HashMap<Uuid, TrackedRecord>> {
    let mut records = HashMap::new();
    let mut top = match tokio::fs::read_dir(data_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = top.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let mut sub = tokio::fs::read_dir(entry.path()).await?;
        while let Some(shard) = sub.next_entry().await? {
            let path = shard.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to read shard {}: {e}", path.display());
                    continue;
                }
            };
            match serde_json::from_slice::<TrackedRecord>(&bytes) {
                Ok(record) => {
                    records.insert(record.id, record);
                }
                Err(e) => warn!("skipping corrupt shard {}: {e}", path.display()),
            }
        }
    }
    Ok(records)
}

/// Shard ids present on disk, from filenames alone.
async fn scan_shard_ids(data_dir: &Path) -> Result<HashSet<Uuid>> {
    let mut ids = HashSet::new();
    let mut top = match tokio::fs::read_dir(data_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = top.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let mut sub = tokio::fs::read_dir(entry.path()).await?;
        while let Some(shard) = sub.next_entry().await? {
            let path = shard.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.insert(id);
                }
            }
        }
    }
    Ok(ids)
}

#[async_trait::async_trait]
impl StorageBackend for ShardedJsonBackend {
    // ========== Lifecycle ==========

    async fn initialize(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.initialized {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.shared.data_dir).await?;

        let mut rebuilt = false;
        match tokio::fs::read(&self.shared.index_path).await {
            Ok(bytes) => match serde_json::from_slice::<IndexSnapshot>(&bytes) {
                Ok(snapshot) => {
                    for entry in &snapshot.entries {
                        state.paths.insert(entry.p.clone(), entry.u);
                        if entry.d != 0 {
                            state.dir_ids.insert(entry.u);
                        }
                    }
                }
                Err(e) => {
                    warn!("index file corrupt, rebuilding from shards: {e}");
                    rebuilt = true;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if rebuilt || !self.shared.lazy_load {
            // Ground truth is the shard files themselves.
            let records = scan_shards(&self.shared.data_dir).await?;
            for (id, record) in records {
                state.paths.entry(record.path.clone()).or_insert(id);
                if record.is_directory {
                    state.dir_ids.insert(id);
                }
                state.records.insert(id, record);
            }
        }

        state.initialized = true;
        if rebuilt {
            let snapshot = state.derive_snapshot();
            tokio::fs::write(&self.shared.index_path, serde_json::to_vec(&snapshot)?).await?;
            debug!("rebuilt index with {} entries", snapshot.entries.len());
        }
        debug!(
            "sharded backend ready at {} ({} mappings, lazy={})",
            self.shared.data_dir.display(),
            state.paths.len(),
            self.shared.lazy_load
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !state.initialized {
            return Ok(());
        }
        state.flush_gen = state.flush_gen.wrapping_add(1);
        if state.has_unsaved || !state.dirty.is_empty() || !state.removed.is_empty() {
            write_pending(&self.shared, &mut state, true).await?;
        }
        *state = State::default();
        debug!("sharded backend closed");
        Ok(())
    }

    // ========== Records ==========

    async fn save(&self, id: Uuid, record: &TrackedRecord) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        if record.is_directory {
            state.dir_ids.insert(id);
        } else {
            state.dir_ids.remove(&id);
        }
        state.records.insert(id, record.clone());
        state.removed.remove(&id);
        state.dirty.insert(id);
        state.has_unsaved = true;
        let delay = self.shared.timings.flush_debounce;
        schedule_flush(&self.shared, &mut state, delay);
        Ok(())
    }

    async fn save_batch(&self, entries: &[(Uuid, TrackedRecord)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        for (id, record) in entries {
            if record.is_directory {
                state.dir_ids.insert(*id);
            } else {
                state.dir_ids.remove(id);
            }
            state.records.insert(*id, record.clone());
            state.removed.remove(id);
            state.dirty.insert(*id);
        }
        state.has_unsaved = true;
        let delay = self.shared.timings.flush_debounce;
        schedule_flush(&self.shared, &mut state, delay);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<TrackedRecord>> {
        {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            if state.removed.contains(&id) {
                return Ok(None);
            }
            if let Some(record) = state.records.get(&id) {
                return Ok(Some(record.clone()));
            }
        }

        // Lazy path: pull the shard into the cache on first access.
        match self.read_shard(&id).await {
            Some(record) => {
                let mut state = self.shared.state.lock().await;
                ensure_init(&state)?;
                if record.is_directory {
                    state.dir_ids.insert(id);
                }
                state.records.insert(id, record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn load_batch(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, TrackedRecord>> {
        let mut found = HashMap::new();
        let mut misses = Vec::new();
        {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            for id in ids {
                if state.removed.contains(id) {
                    continue;
                }
                match state.records.get(id) {
                    Some(record) => {
                        found.insert(*id, record.clone());
                    }
                    None => misses.push(*id),
                }
            }
        }

        if !misses.is_empty() {
            let mut loaded = Vec::new();
            for id in &misses {
                if let Some(record) = self.read_shard(id).await {
                    loaded.push((*id, record));
                }
            }
            if !loaded.is_empty() {
                let mut state = self.shared.state.lock().await;
                ensure_init(&state)?;
                for (id, record) in loaded {
                    if record.is_directory {
                        state.dir_ids.insert(id);
                    }
                    state.records.insert(id, record.clone());
                    found.insert(id, record);
                }
            }
        }
        Ok(found)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        state.records.remove(&id);
        state.dir_ids.remove(&id);
        state.dirty.remove(&id);
        state.removed.insert(id);
        state.has_unsaved = true;
        let delay = self.shared.timings.flush_debounce;
        schedule_flush(&self.shared, &mut state, delay);
        Ok(())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        for id in ids {
            state.records.remove(id);
            state.dir_ids.remove(id);
            state.dirty.remove(id);
            state.removed.insert(*id);
        }
        state.has_unsaved = true;
        let delay = self.shared.timings.flush_debounce;
        schedule_flush(&self.shared, &mut state, delay);
        Ok(())
    }

    // ========== Path mappings ==========

    async fn save_path_mapping(&self, path: &str, id: Uuid) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        state.paths.insert(path.to_string(), id);
        state.has_unsaved = true;
        let delay = self.shared.timings.flush_debounce;
        schedule_flush(&self.shared, &mut state, delay);
        Ok(())
    }

    async fn save_path_mapping_batch(&self, mappings: &[(String, Uuid)]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        for (path, id) in mappings {
            state.paths.insert(path.clone(), *id);
        }
        state.has_unsaved = true;
        let delay = self.shared.timings.flush_debounce;
        schedule_flush(&self.shared, &mut state, delay);
        Ok(())
    }

    async fn id_by_path(&self, path: &str) -> Result<Option<Uuid>> {
        let state = self.shared.state.lock().await;
        ensure_init(&state)?;
        Ok(state.paths.get(path).copied())
    }

    async fn delete_path_mapping(&self, path: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        if state.paths.remove(path).is_some() {
            state.has_unsaved = true;
            let delay = self.shared.timings.flush_debounce;
            schedule_flush(&self.shared, &mut state, delay);
        }
        Ok(())
    }

    async fn all_path_mappings(&self) -> Result<HashMap<String, Uuid>> {
        let state = self.shared.state.lock().await;
        ensure_init(&state)?;
        Ok(state.paths.clone())
    }

    async fn all_ids(&self) -> Result<Vec<Uuid>> {
        let (mut ids, removed) = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            let mut ids: HashSet<Uuid> = state.records.keys().copied().collect();
            let removed = state.removed.clone();
            for id in &removed {
                ids.remove(id);
            }
            (ids, removed)
        };
        for id in scan_shard_ids(&self.shared.data_dir).await? {
            if !removed.contains(&id) {
                ids.insert(id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    // ========== Index ==========

    async fn save_index(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        for entry in &snapshot.entries {
            state.paths.insert(entry.p.clone(), entry.u);
            if entry.d != 0 {
                state.dir_ids.insert(entry.u);
            }
        }
        state.has_unsaved = true;
        let delay = self.shared.timings.flush_debounce;
        schedule_flush(&self.shared, &mut state, delay);
        Ok(())
    }

    async fn load_index(&self) -> Result<Option<IndexSnapshot>> {
        {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
        }
        match tokio::fs::read(&self.shared.index_path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) => {
                    warn!("index file corrupt: {e}");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ========== Maintenance ==========

    async fn stats(&self) -> Result<BackendStats> {
        let state = self.shared.state.lock().await;
        ensure_init(&state)?;
        let distinct: HashSet<Uuid> = state.paths.values().copied().collect();
        Ok(BackendStats {
            record_count: distinct.len(),
            mapping_count: state.paths.len(),
            byte_size: None,
        })
    }

    async fn optimize(&self) -> Result<()> {
        self.flush_now(true).await?;
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        let dropped = state.records.len();
        state.records.clear();
        debug!("dropped {dropped} cached records");
        Ok(())
    }

    async fn export_all(&self) -> Result<ExportedData> {
        // Disk is ground truth for an export; make it current first.
        self.flush_now(true).await?;
        let records = scan_shards(&self.shared.data_dir).await?;
        let path_mappings = self.all_path_mappings().await?;
        let index = self.load_index().await?;
        Ok(ExportedData {
            records,
            path_mappings,
            index,
        })
    }

    async fn import_all(&self, data: ExportedData) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        ensure_init(&state)?;
        state.flush_gen = state.flush_gen.wrapping_add(1);

        // Wipe existing shard subdirectories; the new dataset replaces
        // everything.
        let mut top = tokio::fs::read_dir(&self.shared.data_dir).await?;
        while let Some(entry) = top.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }

        state.records = data.records;
        state.paths = data.path_mappings;
        state.dir_ids = state
            .records
            .values()
            .filter(|r| r.is_directory)
            .map(|r| r.id)
            .collect();
        if let Some(index) = &data.index {
            for entry in &index.entries {
                if entry.d != 0 {
                    state.dir_ids.insert(entry.u);
                }
            }
        }
        state.dirty.clear();
        state.removed.clear();
        state.has_unsaved = false;

        let count = state.records.len();
        let ids: Vec<Uuid> = state.records.keys().copied().collect();
        let mut by_prefix: HashMap<String, Vec<(PathBuf, Vec<u8>)>> = HashMap::new();
        for id in ids {
            let Some(record) = state.records.get(&id) else {
                continue;
            };
            let body = serde_json::to_vec(record)?;
            let path = shard_path(&self.shared.data_dir, &id);
            by_prefix.entry(id.to_string()[..2].to_string()).or_default().push((path, body));
        }
        for (prefix, shards) in by_prefix {
            tokio::fs::create_dir_all(self.shared.data_dir.join(&prefix)).await?;
            for (path, body) in shards {
                tokio::fs::write(&path, body).await?;
            }
        }

        let snapshot = state.derive_snapshot();
        tokio::fs::write(&self.shared.index_path, serde_json::to_vec(&snapshot)?).await?;
        debug!("imported {count} records, {} path mappings", state.paths.len());
        Ok(())
    }

    async fn check_health(&self) -> Result<HealthReport> {
        let mut issues = Vec::new();
        if !self.shared.data_dir.exists() {
            issues.push(format!(
                "data directory missing: {}",
                self.shared.data_dir.display()
            ));
        }
        if !self.shared.index_path.exists() {
            issues.push("index file missing".to_string());
        }

        let sample: Vec<Uuid> = {
            let state = self.shared.state.lock().await;
            ensure_init(&state)?;
            state
                .paths
                .values()
                .filter(|id| !state.dirty.contains(id) && !state.removed.contains(id))
                .take(HEALTH_SAMPLE)
                .copied()
                .collect()
        };
        for id in sample {
            let path = shard_path(&self.shared.data_dir, &id);
            if !path.exists() {
                issues.push(format!("shard missing for {id}"));
            }
        }

        Ok(HealthReport::from_issues(issues))
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::ShardedJson
    }
}
