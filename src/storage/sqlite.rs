//! SQLite storage implementation
//!
//! Write-through engine behind the [`StorageBackend`] contract. Records are
//! stored as serialized JSON payloads keyed by identifier; batches run in
//! engine transactions so a failed batch never half-persists.

use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::schema;
use super::{BackendKind, BackendStats, ExportedData, HealthReport, StorageBackend};
use crate::config::SqliteOptions;
use crate::index::IndexSnapshot;
use crate::record::{TrackedRecord, now_ms};
use crate::{Error, Result};

/// Ids per `IN (...)` clause when loading batches.
const LOAD_CHUNK: usize = 500;

const MMAP_SIZE_BYTES: i64 = 67_108_864;
const PAGE_SIZE_BYTES: u32 = 4096;

/// Relational backend over a single SQLite file.
pub struct SqliteBackend {
    db_path: PathBuf,
    options: SqliteOptions,
    conn: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    pub fn new(db_path: PathBuf, options: SqliteOptions) -> Self {
        Self {
            db_path,
            options,
            conn: Mutex::new(None),
        }
    }

    fn apply_pragmas(conn: &Connection, options: &SqliteOptions) -> Result<()> {
        // page_size must land before WAL mode is entered, or it is ignored.
        let mut script = format!("PRAGMA page_size = {PAGE_SIZE_BYTES};\n");
        if options.enable_write_ahead_log {
            script.push_str("PRAGMA journal_mode = WAL;\n");
        }
        script.push_str("PRAGMA synchronous = NORMAL;\n");
        script.push_str("PRAGMA temp_store = MEMORY;\n");
        script.push_str(&format!("PRAGMA cache_size = {};\n", options.cache_size_pages));
        if options.enable_memory_mapped_io {
            script.push_str(&format!("PRAGMA mmap_size = {MMAP_SIZE_BYTES};\n"));
        }
        conn.execute_batch(&script)?;
        Ok(())
    }

    fn parse_record(id: &str, payload: &str) -> Option<TrackedRecord> {
        match serde_json::from_str(payload) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("skipping corrupt record row {id}: {e}");
                None
            }
        }
    }
}

fn open_conn<'a>(guard: &'a mut Option<Connection>) -> Result<&'a mut Connection> {
    guard.as_mut().ok_or(Error::NotInitialized("sqlite backend"))
}

#[async_trait::async_trait]
impl StorageBackend for SqliteBackend {
    // ========== Lifecycle ==========

    async fn initialize(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.db_path)?;
        Self::apply_pragmas(&conn, &self.options)?;
        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, [])?;
        }
        debug!("sqlite backend ready at {}", self.db_path.display());
        *guard = Some(conn);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            debug!("sqlite backend closed");
        }
        Ok(())
    }

    // ========== Records ==========

    async fn save(&self, id: Uuid, record: &TrackedRecord) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let payload = serde_json::to_string(record)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO records (id, payload, updated_at, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![id.to_string(), payload, record.updated_at, record.created_at],
        )?;
        Ok(())
    }

    async fn save_batch(&self, entries: &[(Uuid, TrackedRecord)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        // Dropping the transaction on an early `?` rolls the batch back.
        let tx = conn.transaction()?;
        for (id, record) in entries {
            let payload = serde_json::to_string(record)?;
            tx.execute(
                r#"
                INSERT OR REPLACE INTO records (id, payload, updated_at, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![id.to_string(), payload, record.updated_at, record.created_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<TrackedRecord>> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let id_str = id.to_string();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM records WHERE id = ?1",
                [&id_str],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload.and_then(|p| Self::parse_record(&id_str, &p)))
    }

    async fn load_batch(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, TrackedRecord>> {
        let mut found = HashMap::new();
        if ids.is_empty() {
            return Ok(found);
        }
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        for chunk in ids.chunks(LOAD_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT id, payload FROM records WHERE id IN ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.to_string())),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            for row in rows {
                let (id_str, payload) = row?;
                let Ok(id) = Uuid::parse_str(&id_str) else {
                    warn!("skipping record row with malformed id {id_str}");
                    continue;
                };
                if let Some(record) = Self::parse_record(&id_str, &payload) {
                    found.insert(id, record);
                }
            }
        }
        Ok(found)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        conn.execute("DELETE FROM records WHERE id = ?1", [id.to_string()])?;
        Ok(())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM records WHERE id = ?1", [id.to_string()])?;
        }
        tx.commit()?;
        Ok(())
    }

    // ========== Path mappings ==========

    async fn save_path_mapping(&self, path: &str, id: Uuid) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        conn.execute(
            "INSERT OR REPLACE INTO path_mappings (path, id, updated_at) VALUES (?1, ?2, ?3)",
            params![path, id.to_string(), now_ms()],
        )?;
        Ok(())
    }

    async fn save_path_mapping_batch(&self, mappings: &[(String, Uuid)]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let tx = conn.transaction()?;
        let now = now_ms();
        for (path, id) in mappings {
            tx.execute(
                "INSERT OR REPLACE INTO path_mappings (path, id, updated_at) VALUES (?1, ?2, ?3)",
                params![path, id.to_string(), now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn id_by_path(&self, path: &str) -> Result<Option<Uuid>> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let id_str: Option<String> = conn
            .query_row(
                "SELECT id FROM path_mappings WHERE path = ?1",
                [path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id_str.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    async fn delete_path_mapping(&self, path: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        conn.execute("DELETE FROM path_mappings WHERE path = ?1", [path])?;
        Ok(())
    }

    async fn all_path_mappings(&self) -> Result<HashMap<String, Uuid>> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let mut stmt = conn.prepare("SELECT path, id FROM path_mappings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut mappings = HashMap::new();
        for row in rows {
            let (path, id_str) = row?;
            match Uuid::parse_str(&id_str) {
                Ok(id) => {
                    mappings.insert(path, id);
                }
                Err(_) => warn!("skipping path mapping {path} with malformed id {id_str}"),
            }
        }
        Ok(mappings)
    }

    async fn all_ids(&self) -> Result<Vec<Uuid>> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let mut stmt = conn.prepare("SELECT id FROM records")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            let id_str = row?;
            if let Ok(id) = Uuid::parse_str(&id_str) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    // ========== Index blob ==========

    async fn save_index(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let payload = serde_json::to_string(snapshot)?;
        conn.execute(
            "INSERT OR REPLACE INTO index_blob (key, payload, updated_at) VALUES (?1, ?2, ?3)",
            params![schema::INDEX_BLOB_KEY, payload, now_ms()],
        )?;
        Ok(())
    }

    async fn load_index(&self) -> Result<Option<IndexSnapshot>> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM index_blob WHERE key = ?1",
                [schema::INDEX_BLOB_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(p) => match serde_json::from_str(&p) {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) => {
                    warn!("stored index snapshot is corrupt, ignoring: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    // ========== Maintenance ==========

    async fn stats(&self) -> Result<BackendStats> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let record_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        let mapping_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM path_mappings", [], |row| row.get(0))?;
        let byte_size = std::fs::metadata(&self.db_path).ok().map(|m| m.len());
        Ok(BackendStats {
            record_count: record_count as usize,
            mapping_count: mapping_count as usize,
            byte_size,
        })
    }

    async fn optimize(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        conn.execute_batch("VACUUM; ANALYZE;")?;
        debug!("sqlite backend vacuumed and analyzed");
        Ok(())
    }

    async fn export_all(&self) -> Result<ExportedData> {
        let records = {
            let mut guard = self.conn.lock().await;
            let conn = open_conn(&mut guard)?;
            let mut stmt = conn.prepare("SELECT id, payload FROM records")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut records = HashMap::new();
            for row in rows {
                let (id_str, payload) = row?;
                let Ok(id) = Uuid::parse_str(&id_str) else {
                    warn!("skipping record row with malformed id {id_str}");
                    continue;
                };
                if let Some(record) = Self::parse_record(&id_str, &payload) {
                    records.insert(id, record);
                }
            }
            records
        };

        Ok(ExportedData {
            records,
            path_mappings: self.all_path_mappings().await?,
            index: self.load_index().await?,
        })
    }

    async fn import_all(&self, data: ExportedData) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_conn(&mut guard)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM path_mappings", [])?;
        tx.execute("DELETE FROM index_blob", [])?;

        for (id, record) in &data.records {
            let payload = serde_json::to_string(record)?;
            tx.execute(
                r#"
                INSERT INTO records (id, payload, updated_at, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![id.to_string(), payload, record.updated_at, record.created_at],
            )?;
        }

        let now = now_ms();
        for (path, id) in &data.path_mappings {
            tx.execute(
                "INSERT INTO path_mappings (path, id, updated_at) VALUES (?1, ?2, ?3)",
                params![path, id.to_string(), now],
            )?;
        }

        if let Some(index) = &data.index {
            let payload = serde_json::to_string(index)?;
            tx.execute(
                "INSERT INTO index_blob (key, payload, updated_at) VALUES (?1, ?2, ?3)",
                params![schema::INDEX_BLOB_KEY, payload, now],
            )?;
        }

        tx.commit()?;
        debug!(
            "imported {} records and {} path mappings",
            data.records.len(),
            data.path_mappings.len()
        );
        Ok(())
    }

    async fn check_health(&self) -> Result<HealthReport> {
        let mut issues = Vec::new();
        if !self.db_path.exists() {
            issues.push(format!("database file missing: {}", self.db_path.display()));
        }

        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            None => issues.push("backend not initialized".to_string()),
            Some(conn) => {
                match conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0)) {
                    Ok(verdict) if verdict == "ok" => {}
                    Ok(verdict) => issues.push(format!("integrity check failed: {verdict}")),
                    Err(e) => issues.push(format!("integrity check errored: {e}")),
                }
                for table in schema::EXPECTED_TABLES {
                    let present: Option<String> = conn
                        .query_row(
                            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                            [table],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if present.is_none() {
                        issues.push(format!("missing table: {table}"));
                    }
                }
            }
        }

        Ok(HealthReport::from_issues(issues))
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Relational
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_record(key: &str, hash: &str) -> TrackedRecord {
        let mut record = TrackedRecord::new(key, false);
        record.hash = hash.to_string();
        record.size = hash.len() as u64;
        record.modified_at = 1_700_000_000_000;
        record
    }

    async fn open_backend(dir: &Path) -> SqliteBackend {
        let backend = SqliteBackend::new(dir.join("tracking.db"), SqliteOptions::default());
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_not_initialized_is_fatal_to_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("tracking.db"), SqliteOptions::default());
        let record = sample_record("a.md", "h1");
        let err = backend.save(record.id, &record).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(dir.path()).await;

        let mut record = sample_record("src/a.md", "h1");
        record.set_payload("writingStats", serde_json::json!({"chars": 12}));
        backend.save(record.id, &record).await.unwrap();
        backend.save_path_mapping("src/a.md", record.id).await.unwrap();

        let loaded = backend.load(record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(backend.id_by_path("src/a.md").await.unwrap(), Some(record.id));
        assert_eq!(backend.id_by_path("missing.md").await.unwrap(), None);

        backend.delete(record.id).await.unwrap();
        assert!(backend.load(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_load_returns_found_subset_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(dir.path()).await;

        // More entries than one IN-clause chunk holds.
        let entries: Vec<(Uuid, TrackedRecord)> = (0..LOAD_CHUNK + 5)
            .map(|i| {
                let record = sample_record(&format!("f{i}.md"), &format!("h{i}"));
                (record.id, record)
            })
            .collect();
        backend.save_batch(&entries).await.unwrap();

        let mut ids: Vec<Uuid> = entries.iter().map(|(id, _)| *id).collect();
        let missing: Vec<Uuid> = (0..10).map(|_| Uuid::now_v7()).collect();
        ids.extend(&missing);

        let found = backend.load_batch(&ids).await.unwrap();
        assert_eq!(found.len(), entries.len());
        for id in &missing {
            assert!(!found.contains_key(id));
        }
    }

    #[tokio::test]
    async fn test_index_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(dir.path()).await;
        assert!(backend.load_index().await.unwrap().is_none());

        let record = sample_record("a.md", "h1");
        let snapshot = IndexSnapshot::new(vec![crate::index::IndexEntry {
            u: record.id,
            p: record.path.clone(),
            d: 0,
        }]);
        backend.save_index(&snapshot).await.unwrap();

        let loaded = backend.load_index().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_export_import_replaces_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(dir.path()).await;

        let stale = sample_record("stale.md", "h0");
        backend.save(stale.id, &stale).await.unwrap();
        backend.save_path_mapping("stale.md", stale.id).await.unwrap();

        let fresh = sample_record("fresh.md", "h1");
        let mut data = ExportedData::default();
        data.records.insert(fresh.id, fresh.clone());
        data.path_mappings.insert("fresh.md".to_string(), fresh.id);
        backend.import_all(data).await.unwrap();

        let exported = backend.export_all().await.unwrap();
        assert_eq!(exported.records.len(), 1);
        assert!(exported.records.contains_key(&fresh.id));
        assert_eq!(exported.path_mappings.get("fresh.md"), Some(&fresh.id));
        assert!(backend.load(stale.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_row_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tracking.db");
        let backend = SqliteBackend::new(db_path.clone(), SqliteOptions::default());
        backend.initialize().await.unwrap();

        let good = sample_record("good.md", "h1");
        backend.save(good.id, &good).await.unwrap();
        backend.close().await.unwrap();

        // Poison one row from the outside.
        let bad_id = Uuid::now_v7();
        let raw = Connection::open(&db_path).unwrap();
        raw.execute(
            "INSERT INTO records (id, payload, updated_at, created_at) VALUES (?1, 'not json', 0, 0)",
            [bad_id.to_string()],
        )
        .unwrap();
        drop(raw);

        backend.initialize().await.unwrap();
        assert!(backend.load(bad_id).await.unwrap().is_none());
        let exported = backend.export_all().await.unwrap();
        assert_eq!(exported.records.len(), 1);
        assert!(exported.records.contains_key(&good.id));
    }

    #[tokio::test]
    async fn test_wal_mode_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tracking.db");
        let backend = SqliteBackend::new(db_path.clone(), SqliteOptions::default());
        backend.initialize().await.unwrap();
        backend.close().await.unwrap();

        let raw = Connection::open(&db_path).unwrap();
        let mode: String = raw
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_health_check_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(dir.path()).await;
        let report = backend.check_health().await.unwrap();
        assert!(report.healthy, "unexpected issues: {:?}", report.issues);

        backend.optimize().await.unwrap();
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.record_count, 0);
        assert!(stats.byte_size.unwrap_or(0) > 0);
    }
}
