use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{EntityId, NaturalKey, NaturalKeySpec, StagingRecord};

use super::{key_index_name, validate_ident, ApplyOutcome, EntityTableSummary, TradeStore};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: Uuid,
    pub record: StagingRecord,
}

#[derive(Debug, Default)]
struct Faults {
    /// Staging-style inserts fail once this many rows have been inserted.
    insert_after: Option<u64>,
    inserted: u64,
    /// Transactional applies fail after this many rows inside one call.
    apply_after: Option<u64>,
    /// Rows removed from the table as an apply commits, as a concurrent
    /// delete would.
    lost_on_apply: usize,
}

/// Table store held in process memory. Used for dry runs and tests; supports
/// fault injection for failure-path tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<BTreeMap<String, Vec<StoredRow>>>,
    indexes: Mutex<BTreeMap<String, BTreeSet<String>>>,
    faults: Mutex<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Makes `insert_batch` fail once `rows` rows have been written through it.
    pub fn fail_inserts_after(&self, rows: u64) {
        if let Ok(mut f) = self.faults.lock() {
            f.insert_after = Some(rows);
            f.inserted = 0;
        }
    }

    /// Makes `apply_rows` fail after `rows` rows of a call have been applied.
    pub fn fail_apply_after(&self, rows: u64) {
        if let Ok(mut f) = self.faults.lock() { f.apply_after = Some(rows); }
    }

    /// Makes the next committing `apply_rows` calls lose `rows` existing rows.
    pub fn lose_rows_on_apply(&self, rows: usize) {
        if let Ok(mut f) = self.faults.lock() { f.lost_on_apply = rows; }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut f) = self.faults.lock() { *f = Faults::default(); }
    }

    /// Copy of a table's rows in `load_seq` order.
    pub fn rows(&self, table: &str) -> Result<Vec<StoredRow>, StoreError> {
        let tables = self.lock()?;
        let mut rows = tables.get(table).cloned().ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        rows.sort_by_key(|r| r.record.load_seq);
        Ok(rows)
    }

    /// Natural-key index names created on `table`.
    pub fn key_indexes(&self, table: &str) -> Vec<String> {
        self.indexes
            .lock()
            .map(|m| m.get(table).map(|s| s.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<StoredRow>>>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    fn stored(rows: &[StagingRecord]) -> impl Iterator<Item = StoredRow> + '_ {
        rows.iter().map(|r| StoredRow { id: Uuid::new_v4(), record: r.clone() })
    }
}

#[async_trait]
impl TradeStore for InMemoryStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        validate_ident(table)?;
        self.lock()?.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains_key(table))
    }

    async fn ensure_key_index(&self, table: &str, spec: &NaturalKeySpec) -> Result<(), StoreError> {
        if !self.lock()?.contains_key(table) { return Err(StoreError::MissingTable(table.to_string())); }
        let mut indexes = self.indexes.lock().map_err(|_| StoreError::Poisoned)?;
        indexes.entry(table.to_string()).or_default().insert(key_index_name(spec));
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<(), StoreError> {
        self.lock()?.get_mut(table).ok_or_else(|| StoreError::MissingTable(table.to_string()))?.clear();
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        self.lock()?.remove(table);
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<u64, StoreError> {
        let tables = self.lock()?;
        tables.get(table).map(|t| t.len() as u64).ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    async fn insert_batch(&self, table: &str, rows: &[StagingRecord]) -> Result<u64, StoreError> {
        let mut tables = self.lock()?;
        let t = tables.get_mut(table).ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        let mut faults = self.faults.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(limit) = faults.insert_after {
            let room = limit.saturating_sub(faults.inserted) as usize;
            if rows.len() > room {
                t.extend(Self::stored(&rows[..room]));
                faults.inserted += room as u64;
                return Err(StoreError::Rejected(format!("injected insert failure after {} rows", limit)));
            }
        }
        faults.inserted += rows.len() as u64;
        t.extend(Self::stored(rows));
        Ok(rows.len() as u64)
    }

    async fn fetch_batch(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<StagingRecord>, StoreError> {
        Ok(self.rows(table)?.into_iter().skip(offset as usize).take(limit).map(|r| r.record).collect())
    }

    async fn key_counts(&self, table: &str, spec: &NaturalKeySpec, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, u64>, StoreError> {
        let tables = self.lock()?;
        let t = tables.get(table).ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        let wanted: std::collections::HashSet<&NaturalKey> = keys.iter().collect();
        let mut out = HashMap::new();
        for row in t {
            let k = spec.key_for(&row.record);
            if wanted.contains(&k) { *out.entry(k).or_insert(0) += 1; }
        }
        Ok(out)
    }

    async fn entity_summary(&self, table: &str) -> Result<Vec<EntityTableSummary>, StoreError> {
        let tables = self.lock()?;
        let rows = tables.get(table).ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        let mut by_entity: BTreeMap<EntityId, EntityTableSummary> = BTreeMap::new();
        for r in rows {
            let rec = &r.record;
            let s = by_entity
                .entry(rec.entity_id.clone())
                .or_insert_with(|| EntityTableSummary { entity_id: rec.entity_id.clone(), rows: 0, min_year: None, max_year: None });
            s.rows += 1;
            s.min_year = Some(s.min_year.map_or(rec.year, |y| y.min(rec.year)));
            s.max_year = Some(s.max_year.map_or(rec.year, |y| y.max(rec.year)));
        }
        Ok(by_entity.into_values().collect())
    }

    async fn apply_rows(&self, table: &str, rows: &[StagingRecord], batch_size: usize, cancel: &AtomicBool) -> Result<ApplyOutcome, StoreError> {
        let mut tables = self.lock()?;
        let (apply_after, lost) = {
            let f = self.faults.lock().map_err(|_| StoreError::Poisoned)?;
            (f.apply_after, f.lost_on_apply)
        };
        let live = tables.get(table).ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        // Work on a copy; it replaces the table only on commit.
        let mut pending = live.clone();
        let mut outcome = ApplyOutcome::default();
        for batch in rows.chunks(batch_size.max(1)) {
            if cancel.load(Ordering::Relaxed) {
                outcome.interrupted = true;
                break;
            }
            for r in batch {
                if apply_after.is_some_and(|n| outcome.applied >= n) {
                    return Err(StoreError::Rejected(format!("injected apply failure after {} rows", outcome.applied)));
                }
                pending.push(StoredRow { id: Uuid::new_v4(), record: r.clone() });
                outcome.applied += 1;
            }
            outcome.batches += 1;
        }
        pending.drain(..lost.min(pending.len()));
        tables.insert(table.to_string(), pending);
        Ok(outcome)
    }

    async fn create_snapshot(&self, table: &str, snapshot: &str) -> Result<u64, StoreError> {
        validate_ident(snapshot)?;
        let mut tables = self.lock()?;
        let copy = tables.get(table).cloned().ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        let n = copy.len() as u64;
        tables.insert(snapshot.to_string(), copy);
        Ok(n)
    }

    async fn restore_snapshot(&self, table: &str, snapshot: &str) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let snap = tables.remove(snapshot).ok_or_else(|| StoreError::MissingSnapshot(snapshot.to_string()))?;
        tables.insert(table.to_string(), snap);
        Ok(())
    }

    async fn swap_tables(&self, live: &str, shadow: &str, retired: &str) -> Result<(), StoreError> {
        validate_ident(retired)?;
        let mut tables = self.lock()?;
        if !tables.contains_key(live) { return Err(StoreError::MissingTable(live.to_string())); }
        let s = tables.remove(shadow).ok_or_else(|| StoreError::MissingTable(shadow.to_string()))?;
        if let Some(l) = tables.remove(live) { tables.insert(retired.to_string(), l); }
        tables.insert(live.to_string(), s);
        Ok(())
    }
}
