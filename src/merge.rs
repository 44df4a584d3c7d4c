use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::TradeStore;
use crate::error::MergeError;
use crate::models::{Disposition, MergeDecision, NaturalKey, NaturalKeySpec, StagingRecord};

/// Decisions for every staging row, in `load_seq` order, plus the NEW rows themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub decisions: Vec<MergeDecision>,
    #[serde(skip)]
    pub new_rows: Vec<StagingRecord>,
}

impl MergePlan {
    pub fn new_count(&self) -> u64 { self.count(Disposition::New) }
    pub fn duplicate_count(&self) -> u64 { self.count(Disposition::Duplicate) }
    fn count(&self, d: Disposition) -> u64 { self.decisions.iter().filter(|x| x.disposition == d).count() as u64 }
}

/// Set difference of staging against production on the natural key.
/// Read-only on both tables, so planning the same pair twice gives the same plan.
pub struct MergePlanner<'a> {
    store: &'a dyn TradeStore,
    staging_table: &'a str,
    production_table: &'a str,
    spec: &'a NaturalKeySpec,
    batch_size: usize,
}

impl<'a> MergePlanner<'a> {
    pub fn new(store: &'a dyn TradeStore, staging_table: &'a str, production_table: &'a str, spec: &'a NaturalKeySpec, batch_size: usize) -> Self {
        Self { store, staging_table, production_table, spec, batch_size: batch_size.max(1) }
    }

    pub async fn plan(&self) -> Result<MergePlan, MergeError> {
        let production_exists = self.store.table_exists(self.production_table).await?;
        if !production_exists {
            log::info!("[Plan] Production table `{}` does not exist yet; every row is NEW", self.production_table);
        }
        let mut plan = MergePlan::default();
        let mut seen: HashMap<NaturalKey, StagingRecord> = HashMap::new();
        let mut offset = 0u64;
        loop {
            let rows = self.store.fetch_batch(self.staging_table, offset, self.batch_size).await?;
            if rows.is_empty() { break; }
            offset += rows.len() as u64;

            let keys: Vec<NaturalKey> = rows.iter().map(|r| self.spec.key_for(r)).collect();
            for (row, key) in rows.iter().zip(&keys) {
                if let Some(first) = seen.get(key) {
                    return Err(MergeError::Ambiguous { key: key.clone(), rows: vec![first.clone(), row.clone()], production_matches: 0 });
                }
                seen.insert(key.clone(), row.clone());
            }
            let counts = if production_exists {
                self.store.key_counts(self.production_table, self.spec, &keys).await?
            } else {
                HashMap::new()
            };

            for (row, key) in rows.into_iter().zip(keys) {
                let matches = counts.get(&key).copied().unwrap_or(0);
                if matches > 1 {
                    return Err(MergeError::Ambiguous { key, rows: vec![row], production_matches: matches });
                }
                let disposition = if matches == 0 { Disposition::New } else { Disposition::Duplicate };
                plan.decisions.push(MergeDecision { load_seq: row.load_seq, natural_key: key, disposition });
                if disposition == Disposition::New { plan.new_rows.push(row); }
            }
        }
        log::info!("[Plan] {} staging rows: {} NEW, {} DUPLICATE", plan.decisions.len(), plan.new_count(), plan.duplicate_count());
        Ok(plan)
    }
}
