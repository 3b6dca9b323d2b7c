//! Database schema definitions

/// SQL to create the records table. `payload` holds the full serialized
/// record; the columns beside it exist for maintenance queries only.
pub const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

/// SQL to create the path mappings table
pub const CREATE_PATH_MAPPINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS path_mappings (
    path TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// SQL to create the index blob table. Holds a single row under key
/// 'main' with the serialized index snapshot.
pub const CREATE_INDEX_BLOB_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS index_blob (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_path_mappings_id ON path_mappings(id)",
];

/// Tables `check_health` expects to find.
pub const EXPECTED_TABLES: &[&str] = &["records", "path_mappings", "index_blob"];

/// Key of the single index blob row.
pub const INDEX_BLOB_KEY: &str = "main";

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![
        CREATE_RECORDS_TABLE,
        CREATE_PATH_MAPPINGS_TABLE,
        CREATE_INDEX_BLOB_TABLE,
    ];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
