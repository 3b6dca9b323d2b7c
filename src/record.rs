//! Tracked-entity metadata model.
//!
//! A [`TrackedRecord`] describes one file or directory under the workspace
//! root. Its identifier is assigned once and survives renames and moves;
//! everything else is replaceable state derived from the filesystem or
//! attached by host tooling.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Current epoch time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Metadata for one tracked file or directory.
///
/// Persisted as camelCase JSON in shard bodies and relational payloads.
/// `hash` is a blake3 hex digest for files and a structural digest for
/// directories; the empty string means a directory hash that has not been
/// aggregated yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRecord {
    pub id: Uuid,
    /// Workspace-relative key with `/` separators. Unique at any instant.
    pub path: String,
    pub name: String,
    pub extension: String,
    pub size: u64,
    /// Filesystem mtime, epoch milliseconds.
    pub modified_at: i64,
    pub hash: String,
    pub is_directory: bool,
    pub is_temporary: bool,
    pub created_at: i64,
    pub last_tracked_at: i64,
    pub updated_at: i64,
    /// Namespaced opaque payloads owned by host tooling. The store compares
    /// and persists them without interpreting their contents.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payloads: BTreeMap<String, serde_json::Value>,
}

impl TrackedRecord {
    /// Create a fresh record for `key` with a newly assigned identifier.
    pub fn new(key: &str, is_directory: bool) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::now_v7(),
            path: key.to_string(),
            name: name_of(key).to_string(),
            extension: extension_of(key),
            size: 0,
            modified_at: 0,
            hash: String::new(),
            is_directory,
            is_temporary: false,
            created_at: now,
            last_tracked_at: now,
            updated_at: now,
            payloads: BTreeMap::new(),
        }
    }

    /// True when the stat-plus-content snapshot matches the stored one.
    /// Used to short-circuit redundant updates for files.
    pub fn is_unchanged(&self, hash: &str, size: u64, modified_at: i64) -> bool {
        self.hash == hash && self.size == size && self.modified_at == modified_at
    }

    /// Rewrite the path key and the display fields derived from it.
    /// The identifier is untouched.
    pub fn rekey(&mut self, key: &str) {
        self.path = key.to_string();
        self.name = name_of(key).to_string();
        self.extension = extension_of(key);
    }

    /// Refresh the tracking timestamps.
    pub fn touch(&mut self, now: i64) {
        self.last_tracked_at = now;
        self.updated_at = now;
    }

    /// Store a payload under `ns`, returning whether anything changed.
    /// Writing a value equal to the stored one is a no-op.
    pub fn set_payload(&mut self, ns: &str, value: serde_json::Value) -> bool {
        if self.payloads.get(ns) == Some(&value) {
            return false;
        }
        self.payloads.insert(ns.to_string(), value);
        true
    }

    /// Drop the payload under `ns`, returning whether it existed.
    pub fn remove_payload(&mut self, ns: &str) -> bool {
        self.payloads.remove(ns).is_some()
    }
}

// ========== Path keys ==========

/// Normalize `path` into the workspace-relative key used everywhere in the
/// store: `/`-separated, lexically resolved, `""` for the root itself.
///
/// Relative inputs are taken as relative to `root`. Inputs that escape the
/// root are rejected; nothing touches the filesystem here, so symlinks are
/// not chased.
pub fn rel_key(root: &Path, path: &Path) -> Result<String> {
    let joined;
    let abs = if path.is_absolute() {
        path
    } else {
        joined = root.join(path);
        &joined
    };

    let root_parts = lexical_parts(root)?;
    let parts = lexical_parts(abs)?;
    if parts.len() < root_parts.len() || parts[..root_parts.len()] != root_parts[..] {
        return Err(Error::InvalidPath(format!(
            "{} is outside the workspace root",
            path.display()
        )));
    }

    let key = parts[root_parts.len()..].join("/");
    #[cfg(windows)]
    let key = key.to_lowercase();
    Ok(key)
}

fn lexical_parts(path: &Path) -> Result<Vec<String>> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidPath(format!(
                        "{} escapes the filesystem root",
                        path.display()
                    )));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(parts)
}

/// Final segment of a relative key (the key itself when it has no `/`).
pub fn name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Lower-cased extension without the leading dot. Dotfiles and names
/// without a dot yield `""`.
pub fn extension_of(key: &str) -> String {
    let name = name_of(key);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx + 1..].to_lowercase(),
        _ => String::new(),
    }
}

/// Parent key of `key`: `"a/b" -> "a"`, `"a" -> ""`, and `None` for the
/// root key itself.
pub fn parent_key(key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    Some(match key.rfind('/') {
        Some(idx) => key[..idx].to_string(),
        None => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_rel_key_normalization() {
        let root = PathBuf::from("/ws/project");
        assert_eq!(rel_key(&root, Path::new("/ws/project/src/a.md")).unwrap(), "src/a.md");
        assert_eq!(rel_key(&root, Path::new("src/a.md")).unwrap(), "src/a.md");
        assert_eq!(rel_key(&root, Path::new("./src/../src/a.md")).unwrap(), "src/a.md");
        assert_eq!(rel_key(&root, Path::new("/ws/project")).unwrap(), "");
        assert!(rel_key(&root, Path::new("/ws/other/a.md")).is_err());
        assert!(rel_key(&root, Path::new("../outside.md")).is_err());
    }

    #[test]
    fn test_name_and_extension() {
        assert_eq!(name_of("src/notes/Chapter.MD"), "Chapter.MD");
        assert_eq!(extension_of("src/notes/Chapter.MD"), "md");
        assert_eq!(extension_of("src/.gitignore"), "");
        assert_eq!(extension_of("Makefile"), "");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
    }

    #[test]
    fn test_parent_key_chain() {
        assert_eq!(parent_key("a/b/c.md"), Some("a/b".to_string()));
        assert_eq!(parent_key("a/b"), Some("a".to_string()));
        assert_eq!(parent_key("a"), Some(String::new()));
        assert_eq!(parent_key(""), None);
    }

    #[test]
    fn test_new_record_derives_display_fields() {
        let rec = TrackedRecord::new("notes/draft.Md", false);
        assert_eq!(rec.name, "draft.Md");
        assert_eq!(rec.extension, "md");
        assert!(!rec.is_directory);
        assert!(rec.hash.is_empty());
        assert_eq!(rec.created_at, rec.updated_at);
    }

    #[test]
    fn test_payload_equality_merge() {
        let mut rec = TrackedRecord::new("a.md", false);
        let stats = json!({"charCount": 120, "sessions": 3});
        assert!(rec.set_payload("writingStats", stats.clone()));
        assert!(!rec.set_payload("writingStats", stats));
        assert!(rec.set_payload("writingStats", json!({"charCount": 121})));
        assert!(rec.remove_payload("writingStats"));
        assert!(!rec.remove_payload("writingStats"));
    }

    #[test]
    fn test_unchanged_short_circuit_fields() {
        let mut rec = TrackedRecord::new("a.md", false);
        rec.hash = "abc".into();
        rec.size = 10;
        rec.modified_at = 99;
        assert!(rec.is_unchanged("abc", 10, 99));
        assert!(!rec.is_unchanged("abc", 11, 99));
        assert!(!rec.is_unchanged("abd", 10, 99));
    }

    #[test]
    fn test_serde_camel_case_fields() {
        let rec = TrackedRecord::new("src/a.md", false);
        let value = serde_json::to_value(&rec).unwrap();
        assert!(value.get("isDirectory").is_some());
        assert!(value.get("modifiedAt").is_some());
        assert!(value.get("lastTrackedAt").is_some());
        // Empty payload map stays off the wire.
        assert!(value.get("payloads").is_none());
    }
}
