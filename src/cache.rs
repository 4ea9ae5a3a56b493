//! Opt-in on-disk snapshots of derived tables.
//!
//! A snapshot is addressed by a key hashed from everything that determines
//! its content: stage name, schema fingerprint, build flags and the bytes of
//! every input file. Changing any of them yields a new key, so a stale
//! snapshot is never picked up silently. `force_rebuild` bypasses lookups
//! but still refreshes the stored snapshot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::table::{Table, TableError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub force_rebuild: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("data/cache"),
            force_rebuild: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheOutcome {
    Disabled,
    Hit,
    Miss,
    Rebuilt,
}

/// Hex SHA-256; only [`CacheKeyBuilder::finish`] creates one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub struct CacheKeyBuilder {
    hasher: Sha256,
}

impl CacheKeyBuilder {
    pub fn new(stage: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("stage:{stage};"));
        Self { hasher }
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.hasher.update(format!("{name}={value};"));
        self
    }

    /// Mixes in the SHA-256 of the file's contents. A missing file is a
    /// missing input for `table`.
    pub fn file(self, table: &str, path: &Path) -> Result<Self, TableError> {
        if !path.is_file() {
            return Err(TableError::MissingInput {
                table: table.to_string(),
                path: path.to_path_buf(),
            });
        }
        let digest = file_sha256_hex(path)?;
        Ok(self.field(table, &digest))
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(hex::encode(self.hasher.finalize()))
    }
}

pub fn file_sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn snapshot_path(cfg: &CacheConfig, stage: &str, key: &CacheKey) -> PathBuf {
    let key = key.as_str();
    let prefix = key.get(..16).unwrap_or(key);
    cfg.dir.join(format!("{stage}-{prefix}.csv"))
}

/// Returns the cached snapshot when caching is enabled, present and not
/// bypassed; otherwise runs `build` and stores its result. `key` is only
/// evaluated when caching is enabled, since hashing inputs reads them fully.
pub fn load_or_build<E, K, F>(
    cfg: &CacheConfig,
    stage: &str,
    key: K,
    text_columns: &[&str],
    build: F,
) -> Result<(Table, CacheOutcome), E>
where
    E: From<TableError>,
    K: FnOnce() -> Result<CacheKey, E>,
    F: FnOnce() -> Result<Table, E>,
{
    if !cfg.enabled {
        return Ok((build()?, CacheOutcome::Disabled));
    }

    let key = key()?;
    let path = snapshot_path(cfg, stage, &key);
    if path.is_file() && !cfg.force_rebuild {
        let table = Table::read_csv(&path, stage, text_columns)?;
        info!(
            component = "cache",
            event = "cache.hit",
            stage,
            path = %path.display(),
            rows = table.row_count()
        );
        return Ok((table, CacheOutcome::Hit));
    }

    let outcome = if cfg.force_rebuild {
        CacheOutcome::Rebuilt
    } else {
        CacheOutcome::Miss
    };
    let table = build()?;
    table.write_csv(&path)?;
    info!(
        component = "cache",
        event = "cache.store",
        stage,
        path = %path.display(),
        outcome = ?outcome,
        rows = table.row_count()
    );
    Ok((table, outcome))
}
