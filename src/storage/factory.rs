//! Config-driven backend construction

use std::path::Path;
use std::sync::Arc;

use super::{BackendKind, ShardedJsonBackend, SqliteBackend, StorageBackend};
use crate::config::TrackerConfig;

/// Build the backend named by `config`, resolving relative data paths
/// against `root`. This is the only place concrete engine types are named.
pub fn create_backend(config: &TrackerConfig, root: &Path) -> Arc<dyn StorageBackend> {
    match config.backend {
        BackendKind::ShardedJson => Arc::new(ShardedJsonBackend::new(
            config.resolved_data_path(root),
            config.sharded.lazy_load,
        )),
        BackendKind::Relational => Arc::new(SqliteBackend::new(
            config.resolved_db_path(root),
            config.sqlite.clone(),
        )),
    }
}

/// Build a backend of an explicit kind, ignoring the kind in `config`.
/// Used for migration targets and comparisons.
pub fn create_backend_of(
    kind: BackendKind,
    config: &TrackerConfig,
    root: &Path,
) -> Arc<dyn StorageBackend> {
    let mut config = config.clone();
    config.backend = kind;
    create_backend(&config, root)
}
