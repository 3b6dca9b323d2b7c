//! # Filetrail - Durable file-tracking metadata store
//!
//! Workspace-scoped tracking of files and directories with identities that
//! survive renames and moves.
//!
//! Filetrail provides:
//! - Stable UUID identities with content hashes and stat snapshots
//! - Structural directory hashes folded from tracked child hashes
//! - A pluggable async storage contract with two engines:
//!   sharded JSON files (lazy load, debounced batched writes) and SQLite
//! - A migration and diff engine for moving between backends
//! - Namespaced opaque payloads attached to records by host tooling

pub mod config;
pub mod hash;
pub mod index;
pub mod migrate;
pub mod record;
pub mod scan;
pub mod storage;
pub mod tracker;
pub mod watcher;


// Re-exports for convenient access
pub use config::TrackerConfig;
pub use index::{IndexSnapshot, TrackingIndex};
pub use record::TrackedRecord;
pub use storage::{BackendKind, StorageBackend};
pub use tracker::TrackerStore;

/// Result type alias for Filetrail operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Filetrail operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Backend not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}
