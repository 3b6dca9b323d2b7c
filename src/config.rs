use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::BackendKind;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    pub backend: BackendKind,
    pub workspace_root: Option<String>,
    pub debug: bool,
    pub sqlite: SqliteOptions,
    pub sharded: ShardedOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqliteOptions {
    pub db_path: String,
    pub enable_write_ahead_log: bool,
    pub cache_size_pages: u32,
    #[serde(rename = "enableMemoryMappedIO")]
    pub enable_memory_mapped_io: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            db_path: ".filetrail/tracking.db".to_string(),
            enable_write_ahead_log: true,
            cache_size_pages: 2560,
            enable_memory_mapped_io: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardedOptions {
    pub data_path: String,
    pub lazy_load: bool,
}

impl Default for ShardedOptions {
    fn default() -> Self {
        Self {
            data_path: ".filetrail/fsdb".to_string(),
            lazy_load: true,
        }
    }
}

impl TrackerConfig {
    /// Database file location, resolved against `root` when relative.
    pub fn resolved_db_path(&self, root: &Path) -> PathBuf {
        resolve(root, &self.sqlite.db_path)
    }

    /// Shard data directory, resolved against `root` when relative.
    pub fn resolved_data_path(&self, root: &Path) -> PathBuf {
        resolve(root, &self.sharded.data_path)
    }
}

fn resolve(root: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() { path } else { root.join(path) }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("filetrail.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<TrackerConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: TrackerConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &TrackerConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_data_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn ensure_gitignore(project_root: &Path) -> anyhow::Result<()> {
    let gitignore_path = project_root.join(".gitignore");
    let entry = ".filetrail/";

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if existing.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
    }

    let mut content = String::new();
    if gitignore_path.exists() {
        content.push_str(&std::fs::read_to_string(&gitignore_path)?);
        if !content.ends_with('\n') {
            content.push('\n');
        }
    }
    content.push_str(entry);
    content.push('\n');
    std::fs::write(&gitignore_path, content)?;
    Ok(())
}
