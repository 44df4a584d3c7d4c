pub mod connection;
pub mod memory;
pub mod schema;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, StoreError};
use crate::models::{EntityId, NaturalKey, NaturalKeySpec, StagingRecord};

pub use connection::{make_pool, make_pool_with_size};
pub use memory::InMemoryStore;
pub use schema::MySqlTradeStore;

/// Columns shared by staging, production, snapshot and shadow tables, in insert order.
pub const RECORD_COLUMNS: [&str; 18] = [
    "load_seq", "entity_id", "year", "appendix", "taxon", "class", "order_name", "family", "genus",
    "importer", "exporter", "origin", "quantity", "term", "unit", "purpose", "source", "data_source",
];

/// Accepts plain SQL identifiers only (ASCII alphanumerics and `_`, at most 64 chars).
pub fn validate_ident(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > 64 || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

/// Name of the composite index over `spec`'s columns. Stable for a given
/// field order and short enough for MySQL's 64 character limit.
pub fn key_index_name(spec: &NaturalKeySpec) -> String {
    let digest = format!("{:x}", Sha256::digest(spec.describe().as_bytes()));
    format!("idx_key_{}", &digest[..12])
}

/// Row count and year range of one entity in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTableSummary {
    pub entity_id: EntityId,
    pub rows: u64,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: u64,
    pub batches: u64,
    /// Cancellation stopped the loop between batches; what was applied is committed.
    pub interrupted: bool,
}

/// The production store boundary: bulk insert, natural-key lookup,
/// snapshot/restore and atomic swap. Table names are validated by every
/// implementation before use.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Creates `table` with the record shape if it does not exist.
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError>;

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    async fn truncate(&self, table: &str) -> Result<(), StoreError>;

    async fn drop_table(&self, table: &str) -> Result<(), StoreError>;

    async fn count(&self, table: &str) -> Result<u64, StoreError>;

    async fn insert_batch(&self, table: &str, rows: &[StagingRecord]) -> Result<u64, StoreError>;

    /// Page of `table` ordered by `load_seq`.
    async fn fetch_batch(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<StagingRecord>, StoreError>;

    /// Creates the composite natural-key index on `table` unless it exists.
    async fn ensure_key_index(&self, table: &str, spec: &NaturalKeySpec) -> Result<(), StoreError>;

    /// Number of rows in `table` per requested key. Keys with no rows may be absent.
    async fn key_counts(&self, table: &str, spec: &NaturalKeySpec, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, u64>, StoreError>;

    /// Per-entity row count and year range of `table`, ordered by entity id.
    async fn entity_summary(&self, table: &str) -> Result<Vec<EntityTableSummary>, StoreError>;

    /// Inserts `rows` into `table` inside one transaction, `batch_size` at a
    /// time, checking `cancel` between batches. Any error rolls back every batch.
    async fn apply_rows(&self, table: &str, rows: &[StagingRecord], batch_size: usize, cancel: &AtomicBool) -> Result<ApplyOutcome, StoreError>;

    /// Copies `table` into a new table `snapshot`; returns the copied row count.
    async fn create_snapshot(&self, table: &str, snapshot: &str) -> Result<u64, StoreError>;

    /// Replaces `table` with `snapshot`; the snapshot is consumed.
    async fn restore_snapshot(&self, table: &str, snapshot: &str) -> Result<(), StoreError>;

    /// Atomically renames `live` to `retired` and `shadow` to `live`.
    async fn swap_tables(&self, live: &str, shadow: &str, retired: &str) -> Result<(), StoreError>;
}
