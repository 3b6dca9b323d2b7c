//! Backend migration and diff engine
//!
//! Moves a complete dataset between storage engines in phases
//! (export, import, validate, cleanup) and reports progress through a
//! caller-supplied sink. Validation samples the target and collects
//! mismatches as strings; it never aborts the run. A failed migration
//! leaves no partial state worth keeping: the fix is to re-run it.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::Result;
use crate::record::TrackedRecord;
use crate::storage::StorageBackend;

/// Records and path mappings sampled during validation.
const VALIDATE_SAMPLE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Export,
    Import,
    Validate,
    Cleanup,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Export => "export",
            MigrationPhase::Import => "import",
            MigrationPhase::Validate => "validate",
            MigrationPhase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress tick, pushed to the caller's sink.
#[derive(Debug, Clone)]
pub struct MigrationProgress {
    pub phase: MigrationPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub validate_after: bool,
    /// Report what the operator should clean up. Source data is never
    /// deleted here; that stays a manual step after a backup.
    pub cleanup_source: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            validate_after: true,
            cleanup_source: false,
        }
    }
}

/// Final outcome. `success` holds exactly when `errors` is empty.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub success: bool,
    pub record_count: usize,
    pub mapping_count: usize,
    pub duration: Duration,
    pub errors: Vec<String>,
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Migration Report:")?;
        writeln!(f, "  {} Success: {}", if self.success { "✅" } else { "❌" }, self.success)?;
        writeln!(f, "  Records: {}", self.record_count)?;
        writeln!(f, "  Path mappings: {}", self.mapping_count)?;
        writeln!(f, "  Duration: {:.2?}", self.duration)?;
        writeln!(f, "  Errors: {}", self.errors.len())
    }
}

/// Move everything from `source` into `target`. Both backends must be
/// initialized by the caller. The target's previous contents are
/// replaced wholesale.
pub async fn migrate(
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
    options: &MigrationOptions,
    mut progress: impl FnMut(MigrationProgress),
) -> MigrationReport {
    let started = Instant::now();
    let mut errors: Vec<String> = Vec::new();

    info!(
        "migrating {} -> {}",
        source.backend_kind(),
        target.backend_kind()
    );
    progress(MigrationProgress {
        phase: MigrationPhase::Export,
        current: 0,
        total: 1,
        message: format!("exporting from {}", source.backend_kind()),
    });

    let data = match source.export_all().await {
        Ok(data) => data,
        Err(e) => {
            errors.push(format!("export failed: {e}"));
            return MigrationReport {
                success: false,
                record_count: 0,
                mapping_count: 0,
                duration: started.elapsed(),
                errors,
            };
        }
    };
    let record_count = data.records.len();
    let mapping_count = data.path_mappings.len();
    progress(MigrationProgress {
        phase: MigrationPhase::Export,
        current: 1,
        total: 1,
        message: format!("exported {record_count} records, {mapping_count} mappings"),
    });

    // Validation samples must be taken before the data moves.
    let record_sample: Vec<(Uuid, TrackedRecord)> = data
        .records
        .iter()
        .take(VALIDATE_SAMPLE)
        .map(|(id, record)| (*id, record.clone()))
        .collect();
    let mapping_sample: Vec<(String, Uuid)> = data
        .path_mappings
        .iter()
        .take(VALIDATE_SAMPLE)
        .map(|(path, id)| (path.clone(), *id))
        .collect();

    progress(MigrationProgress {
        phase: MigrationPhase::Import,
        current: 0,
        total: record_count,
        message: format!("importing into {}", target.backend_kind()),
    });
    if let Err(e) = target.import_all(data).await {
        errors.push(format!("import failed: {e}"));
        return MigrationReport {
            success: false,
            record_count,
            mapping_count,
            duration: started.elapsed(),
            errors,
        };
    }
    progress(MigrationProgress {
        phase: MigrationPhase::Import,
        current: record_count,
        total: record_count,
        message: "import complete".to_string(),
    });

    if options.validate_after {
        validate_target(
            target,
            record_count,
            mapping_count,
            &record_sample,
            &mapping_sample,
            &mut errors,
            &mut progress,
        )
        .await;
    }

    if options.cleanup_source {
        progress(MigrationProgress {
            phase: MigrationPhase::Cleanup,
            current: 1,
            total: 1,
            message: format!(
                "source {} data left in place; remove it manually after a backup",
                source.backend_kind()
            ),
        });
    }

    let report = MigrationReport {
        success: errors.is_empty(),
        record_count,
        mapping_count,
        duration: started.elapsed(),
        errors,
    };
    debug!("migration finished in {:.2?}", report.duration);
    report
}

async fn validate_target(
    target: &dyn StorageBackend,
    record_count: usize,
    mapping_count: usize,
    record_sample: &[(Uuid, TrackedRecord)],
    mapping_sample: &[(String, Uuid)],
    errors: &mut Vec<String>,
    progress: &mut impl FnMut(MigrationProgress),
) {
    let total = 2 + record_sample.len() + mapping_sample.len();
    let mut current = 0;

    match target.all_ids().await {
        Ok(ids) if ids.len() == record_count => {}
        Ok(ids) => errors.push(format!(
            "record count mismatch after migration: expected {record_count}, target has {}",
            ids.len()
        )),
        Err(e) => errors.push(format!("record count check failed: {e}")),
    }
    current += 1;
    progress(MigrationProgress {
        phase: MigrationPhase::Validate,
        current,
        total,
        message: "verified record count".to_string(),
    });

    match target.all_path_mappings().await {
        Ok(mappings) if mappings.len() == mapping_count => {}
        Ok(mappings) => errors.push(format!(
            "mapping count mismatch after migration: expected {mapping_count}, target has {}",
            mappings.len()
        )),
        Err(e) => errors.push(format!("mapping count check failed: {e}")),
    }
    current += 1;
    progress(MigrationProgress {
        phase: MigrationPhase::Validate,
        current,
        total,
        message: "verified mapping count".to_string(),
    });

    for (id, expected) in record_sample {
        match target.load(*id).await {
            Ok(Some(actual)) if &actual == expected => {}
            Ok(Some(actual)) => errors.push(format!(
                "record {id} differs after migration (path {} vs {})",
                actual.path, expected.path
            )),
            Ok(None) => errors.push(format!("record {id} missing after migration")),
            Err(e) => errors.push(format!("record {id} unreadable after migration: {e}")),
        }
        current += 1;
        progress(MigrationProgress {
            phase: MigrationPhase::Validate,
            current,
            total,
            message: format!("sampled record {id}"),
        });
    }

    for (path, id) in mapping_sample {
        match target.id_by_path(path).await {
            Ok(Some(actual)) if actual == *id => {}
            Ok(Some(actual)) => errors.push(format!(
                "mapping for {path} points at {actual}, expected {id}"
            )),
            Ok(None) => errors.push(format!("mapping for {path} missing after migration")),
            Err(e) => errors.push(format!("mapping for {path} unreadable: {e}")),
        }
        current += 1;
        progress(MigrationProgress {
            phase: MigrationPhase::Validate,
            current,
            total,
            message: format!("sampled mapping {path}"),
        });
    }
}

/// Full set difference between two backends' datasets.
#[derive(Debug, Clone, Default)]
pub struct BackendDiff {
    pub records_only_in_a: Vec<Uuid>,
    pub records_only_in_b: Vec<Uuid>,
    /// Present on both sides with unequal contents.
    pub differing_records: Vec<Uuid>,
    pub paths_only_in_a: Vec<String>,
    pub paths_only_in_b: Vec<String>,
}

impl BackendDiff {
    pub fn is_empty(&self) -> bool {
        self.records_only_in_a.is_empty()
            && self.records_only_in_b.is_empty()
            && self.differing_records.is_empty()
            && self.paths_only_in_a.is_empty()
            && self.paths_only_in_b.is_empty()
    }
}

impl fmt::Display for BackendDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backend Diff:")?;
        writeln!(f, "  Records only in A: {}", self.records_only_in_a.len())?;
        writeln!(f, "  Records only in B: {}", self.records_only_in_b.len())?;
        writeln!(f, "  Differing records: {}", self.differing_records.len())?;
        writeln!(f, "  Paths only in A: {}", self.paths_only_in_a.len())?;
        writeln!(f, "  Paths only in B: {}", self.paths_only_in_b.len())
    }
}

/// Compare two initialized backends entry by entry.
pub async fn compare_backends(
    a: &dyn StorageBackend,
    b: &dyn StorageBackend,
) -> Result<BackendDiff> {
    let data_a = a.export_all().await?;
    let data_b = b.export_all().await?;

    let mut diff = BackendDiff::default();
    for (id, record_a) in &data_a.records {
        match data_b.records.get(id) {
            None => diff.records_only_in_a.push(*id),
            Some(record_b) if record_a != record_b => diff.differing_records.push(*id),
            Some(_) => {}
        }
    }
    let ids_a: HashSet<&Uuid> = data_a.records.keys().collect();
    for id in data_b.records.keys() {
        if !ids_a.contains(id) {
            diff.records_only_in_b.push(*id);
        }
    }

    for path in data_a.path_mappings.keys() {
        if !data_b.path_mappings.contains_key(path) {
            diff.paths_only_in_a.push(path.clone());
        }
    }
    for path in data_b.path_mappings.keys() {
        if !data_a.path_mappings.contains_key(path) {
            diff.paths_only_in_b.push(path.clone());
        }
    }

    diff.records_only_in_a.sort();
    diff.records_only_in_b.sort();
    diff.differing_records.sort();
    diff.paths_only_in_a.sort();
    diff.paths_only_in_b.sort();
    Ok(diff)
}
