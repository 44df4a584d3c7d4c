pub mod reader;

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::models::ShardId;

pub use reader::{Malformed, ParsedRow, ShardCursor, ShardReader};

/// One partition file of the source corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub id: ShardId,
    pub path: PathBuf,
}

/// Identifies the inputs a shard's checkpoint was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub catalog_digest: String,
    pub shard_bytes: u64,
    /// Modification time in nanoseconds since the epoch, where the platform reports one.
    pub shard_modified_ns: Option<u64>,
}

impl ShardSpec {
    pub fn fingerprint(&self, catalog_digest: &str) -> Result<SourceFingerprint, ShardError> {
        let meta = std::fs::metadata(&self.path).map_err(|source| ShardError::Io { path: self.path.clone(), source })?;
        let shard_modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| u64::try_from(d.as_nanos()).ok());
        Ok(SourceFingerprint { catalog_digest: catalog_digest.to_string(), shard_bytes: meta.len(), shard_modified_ns })
    }
}

/// Lists `<prefix>*.<extension>` files in `dir`, sorted by file name and
/// numbered from 1 in that order.
pub fn discover_shards(dir: &Path, prefix: &str, extension: &str) -> Result<Vec<ShardSpec>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list source directory {}", dir.display()))?;
    let mut names: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() { continue; }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else { continue };
        let ext_ok = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case(extension)).unwrap_or(false);
        if name.starts_with(prefix) && ext_ok { names.push((name, path)); }
    }
    if names.is_empty() {
        bail!("No shards matching {}*.{} in {}", prefix, extension, dir.display());
    }
    names.sort();
    Ok(names
        .into_iter()
        .enumerate()
        .map(|(i, (name, path))| ShardSpec { id: ShardId { index: i as u32 + 1, name }, path })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_matching_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["trade_db_2.csv", "trade_db_1.csv", "notes.csv", "trade_db_3.txt"] {
            std::fs::write(dir.path().join(n), "x\n").unwrap();
        }
        let shards = discover_shards(dir.path(), "trade_db_", "csv").unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].id.name, "trade_db_1.csv");
        assert_eq!(shards[0].id.index, 1);
        assert_eq!(shards[1].id.index, 2);
    }

    #[test]
    fn fingerprint_tracks_size_and_catalog() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("trade_db_1.csv"), "Year\n2020\n").unwrap();
        let shard = discover_shards(dir.path(), "trade_db_", "csv").unwrap().remove(0);
        let a = shard.fingerprint("c1").unwrap();
        assert_eq!(a.shard_bytes, 10);
        assert_eq!(shard.fingerprint("c1").unwrap(), a);
        assert_ne!(shard.fingerprint("c2").unwrap(), a);
        std::fs::write(&shard.path, "Year\n2020\n2021\n").unwrap();
        assert_ne!(shard.fingerprint("c1").unwrap(), a);
    }

    #[test]
    fn empty_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_shards(dir.path(), "trade_db_", "csv").is_err());
    }
}
