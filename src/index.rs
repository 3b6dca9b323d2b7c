//! In-memory tracking index and its persisted snapshot form.
//!
//! [`TrackingIndex`] pairs the record cache with the path map. The path map
//! is always complete once a store is initialized; the record side may be a
//! partial cache when the backend loads shards lazily, so lookups never
//! assume a mapped id has a loaded record.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::TrackedRecord;

/// Version stamp written into record-bearing stores.
pub const STORE_VERSION: &str = "1.0.0";
/// Version stamp of the index snapshot wire format.
pub const INDEX_VERSION: &str = "1.0.0+idx1";

/// Compact persisted form of the path map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: String,
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
    pub entries: Vec<IndexEntry>,
}

/// One snapshot entry: identifier, path key, directory flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub u: Uuid,
    pub p: String,
    pub d: u8,
}

impl IndexSnapshot {
    pub fn new(entries: Vec<IndexEntry>) -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            last_updated: crate::record::now_ms(),
            entries,
        }
    }
}

/// Id-to-record and path-to-id maps kept mutually consistent.
#[derive(Debug, Default)]
pub struct TrackingIndex {
    records: HashMap<Uuid, TrackedRecord>,
    paths: HashMap<String, Uuid>,
    /// Ids known to be directories, including ones whose records are not
    /// currently loaded. Seeded from the snapshot, maintained on insert.
    dir_ids: HashSet<Uuid>,
}

impl TrackingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Number of records currently loaded in memory.
    pub fn loaded_len(&self) -> usize {
        self.records.len()
    }

    /// Insert or replace a record, keeping both maps consistent. If the
    /// record's path was mapped to a different id, that stale record is
    /// removed and returned.
    pub fn insert(&mut self, record: TrackedRecord) -> Option<TrackedRecord> {
        let id = record.id;
        if record.is_directory {
            self.dir_ids.insert(id);
        } else {
            self.dir_ids.remove(&id);
        }
        let displaced = match self.paths.insert(record.path.clone(), id) {
            Some(prev) if prev != id => self.records.remove(&prev),
            _ => None,
        };
        self.records.insert(id, record);
        displaced
    }

    /// Register a mapping without a loaded record (lazy startup).
    pub fn insert_mapping(&mut self, path: String, id: Uuid, is_directory: bool) {
        self.paths.insert(path, id);
        if is_directory {
            self.dir_ids.insert(id);
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&TrackedRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut TrackedRecord> {
        self.records.get_mut(id)
    }

    pub fn id_by_path(&self, key: &str) -> Option<Uuid> {
        self.paths.get(key).copied()
    }

    pub fn by_path(&self, key: &str) -> Option<&TrackedRecord> {
        self.paths.get(key).and_then(|id| self.records.get(id))
    }

    pub fn contains_path(&self, key: &str) -> bool {
        self.paths.contains_key(key)
    }

    pub fn is_directory_id(&self, id: &Uuid) -> bool {
        self.dir_ids.contains(id)
            || self.records.get(id).map(|r| r.is_directory).unwrap_or(false)
    }

    /// Remove the entity mapped at `key` from both maps. The record half
    /// of the pair is `None` when the record was never loaded.
    pub fn remove_by_path(&mut self, key: &str) -> Option<(Uuid, Option<TrackedRecord>)> {
        let id = self.paths.remove(key)?;
        self.dir_ids.remove(&id);
        let record = self.records.remove(&id);
        Some((id, record))
    }

    /// Move the mapping at `old` to `new`, rewriting the record's derived
    /// fields. The identifier is preserved. Returns the id on success.
    pub fn rekey(&mut self, old: &str, new: &str) -> Option<Uuid> {
        let id = self.paths.remove(old)?;
        self.paths.insert(new.to_string(), id);
        if let Some(record) = self.records.get_mut(&id) {
            record.rekey(new);
        }
        Some(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.paths.values().copied().collect()
    }

    pub fn paths(&self) -> impl Iterator<Item = (&String, &Uuid)> {
        self.paths.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &TrackedRecord> {
        self.records.values()
    }

    /// Path entries strictly under `dir_key` (every entry for the root key).
    pub fn descendants_of<'a>(
        &'a self,
        dir_key: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Uuid)> + 'a {
        let prefix = if dir_key.is_empty() {
            String::new()
        } else {
            format!("{dir_key}/")
        };
        self.paths.iter().filter(move |(key, _)| {
            if dir_key.is_empty() {
                !key.is_empty()
            } else {
                key.starts_with(&prefix)
            }
        })
    }

    /// Build the persisted snapshot from the path map. Entries are sorted
    /// by path so the output is stable.
    pub fn snapshot(&self) -> IndexSnapshot {
        let mut entries: Vec<IndexEntry> = self
            .paths
            .iter()
            .map(|(path, id)| IndexEntry {
                u: *id,
                p: path.clone(),
                d: self.is_directory_id(id) as u8,
            })
            .collect();
        entries.sort_by(|a, b| a.p.cmp(&b.p));
        IndexSnapshot::new(entries)
    }

    /// Seed the path map and directory flags from a snapshot. Loaded
    /// records are untouched.
    pub fn apply_snapshot(&mut self, snapshot: &IndexSnapshot) {
        for entry in &snapshot.entries {
            self.paths.insert(entry.p.clone(), entry.u);
            if entry.d != 0 {
                self.dir_ids.insert(entry.u);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, dir: bool) -> TrackedRecord {
        TrackedRecord::new(key, dir)
    }

    #[test]
    fn test_insert_and_lookup_both_maps() {
        let mut index = TrackingIndex::new();
        let rec = record("src/a.md", false);
        let id = rec.id;
        index.insert(rec);

        assert_eq!(index.id_by_path("src/a.md"), Some(id));
        assert_eq!(index.by_path("src/a.md").map(|r| r.id), Some(id));
        assert_eq!(index.len(), 1);
        assert_eq!(index.loaded_len(), 1);
    }

    #[test]
    fn test_insert_displaces_stale_record_on_path_takeover() {
        let mut index = TrackingIndex::new();
        let old = record("a.md", false);
        let old_id = old.id;
        index.insert(old);

        let new = record("a.md", false);
        let displaced = index.insert(new).unwrap();
        assert_eq!(displaced.id, old_id);
        assert_eq!(index.loaded_len(), 1);
    }

    #[test]
    fn test_rekey_preserves_identifier() {
        let mut index = TrackingIndex::new();
        let rec = record("a.md", false);
        let id = rec.id;
        index.insert(rec);

        assert_eq!(index.rekey("a.md", "b.md"), Some(id));
        assert!(!index.contains_path("a.md"));
        assert_eq!(index.id_by_path("b.md"), Some(id));
        let rec = index.get(&id).unwrap();
        assert_eq!(rec.path, "b.md");
        assert_eq!(rec.name, "b.md");
    }

    #[test]
    fn test_remove_clears_both_maps() {
        let mut index = TrackingIndex::new();
        let rec = record("src/a.md", false);
        let id = rec.id;
        index.insert(rec);

        let (removed_id, removed) = index.remove_by_path("src/a.md").unwrap();
        assert_eq!(removed_id, id);
        assert_eq!(removed.unwrap().id, id);
        assert!(index.is_empty());
        assert_eq!(index.loaded_len(), 0);
    }

    #[test]
    fn test_descendants_filter() {
        let mut index = TrackingIndex::new();
        index.insert(record("src", true));
        index.insert(record("src/a.md", false));
        index.insert(record("src/sub/b.md", false));
        index.insert(record("srcfoo.md", false));

        let under_src: Vec<_> = index.descendants_of("src").map(|(k, _)| k.clone()).collect();
        assert_eq!(under_src.len(), 2);
        assert!(under_src.contains(&"src/a.md".to_string()));
        assert!(under_src.contains(&"src/sub/b.md".to_string()));

        // Root key sees everything except itself.
        assert_eq!(index.descendants_of("").count(), 4);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut index = TrackingIndex::new();
        index.insert(record("src", true));
        index.insert(record("src/a.md", false));

        let snap = index.snapshot();
        assert_eq!(snap.version, INDEX_VERSION);
        assert_eq!(snap.entries.len(), 2);
        assert_eq!(snap.entries[0].p, "src");
        assert_eq!(snap.entries[0].d, 1);
        assert_eq!(snap.entries[1].d, 0);

        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("lastUpdated").is_some());
        assert!(json["entries"][0].get("u").is_some());
        assert!(json["entries"][0].get("p").is_some());

        let mut seeded = TrackingIndex::new();
        seeded.apply_snapshot(&snap);
        assert_eq!(seeded.len(), 2);
        assert_eq!(seeded.loaded_len(), 0);
        let dir_id = snap.entries[0].u;
        assert!(seeded.is_directory_id(&dir_id));
    }
}
