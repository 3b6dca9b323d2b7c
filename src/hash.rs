//! Content and structural hashing.
//!
//! File hashes come from blake3 over the file bytes. Directory hashes are
//! structural: a fold over the already-stored hashes of tracked
//! descendants, never a re-read of the filesystem. A directory with no
//! hashable descendants hashes to the empty string.

use std::path::Path;

use crate::Result;
use crate::index::TrackingIndex;

/// blake3 hex digest of a file's contents.
pub async fn hash_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hash_bytes(&bytes))
}

/// blake3 hex digest of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// One descendant's contribution to a directory hash.
#[derive(Debug, Clone)]
pub struct ChildToken {
    pub is_directory: bool,
    /// Path relative to the directory being hashed, `/`-separated.
    pub relative_path: String,
    pub hash: String,
}

impl ChildToken {
    fn render(&self) -> String {
        let kind = if self.is_directory { 'D' } else { 'F' };
        format!("{kind}:{}:{}", self.relative_path, self.hash)
    }
}

/// Fold child tokens into a structural hash. Tokens with empty hashes are
/// ignored; the rendered tokens are sorted so the result is independent of
/// supply order. No tokens means no hash yet.
pub fn directory_hash<I>(tokens: I) -> String
where
    I: IntoIterator<Item = ChildToken>,
{
    let mut rendered: Vec<String> = tokens
        .into_iter()
        .filter(|t| !t.hash.is_empty())
        .map(|t| t.render())
        .collect();
    if rendered.is_empty() {
        return String::new();
    }
    rendered.sort();
    hash_bytes(rendered.join("|").as_bytes())
}

/// Structural hash of `dir_key` from the index's current state. Only
/// strict descendants participate; descendants whose records are not
/// loaded or not yet hashed are skipped.
pub fn tracked_directory_hash(index: &TrackingIndex, dir_key: &str) -> String {
    let skip = if dir_key.is_empty() { 0 } else { dir_key.len() + 1 };
    let tokens = index.descendants_of(dir_key).filter_map(|(key, id)| {
        let record = index.get(id)?;
        if record.hash.is_empty() {
            return None;
        }
        Some(ChildToken {
            is_directory: record.is_directory,
            relative_path: key[skip..].to_string(),
            hash: record.hash.clone(),
        })
    });
    directory_hash(tokens)
}
