use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::db::TradeStore;
use crate::engine::ProgressUpdate;
use crate::error::StagingError;
use crate::metrics::Throughput;
use crate::models::{MatchedRow, NaturalKeySpec, StagingRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSummary {
    pub input_rows: u64,
    pub duplicates_collapsed: u64,
    pub written: u64,
    pub batches: u64,
}

/// Shapes matched rows for the store and keeps the first row per natural
/// key. `matched` must already be in consolidated (shard, offset) order;
/// `load_seq` numbers the survivors in that order.
pub fn build_staging_records(matched: &[MatchedRow], spec: &NaturalKeySpec, data_source: &str) -> (Vec<StagingRecord>, u64) {
    let mut seen = HashSet::with_capacity(matched.len());
    let mut out = Vec::with_capacity(matched.len());
    let mut dups = 0u64;
    for m in matched {
        let rec = StagingRecord::from_matched(out.len() as u64, m, data_source);
        if seen.insert(spec.key_for(&rec)) {
            out.push(rec);
        } else {
            dups += 1;
        }
    }
    (out, dups)
}

pub struct StagingLoader<'a> {
    store: &'a dyn TradeStore,
    table: &'a str,
    spec: &'a NaturalKeySpec,
    write_batch_size: usize,
    data_source: &'a str,
}

impl<'a> StagingLoader<'a> {
    pub fn new(store: &'a dyn TradeStore, table: &'a str, spec: &'a NaturalKeySpec, write_batch_size: usize, data_source: &'a str) -> Self {
        Self { store, table, spec, write_batch_size: write_batch_size.max(1), data_source }
    }

    /// Replaces the staging table contents with the deduplicated rows and
    /// verifies the row count. Any failure leaves staging empty.
    pub async fn load<F>(&self, matched: &[MatchedRow], on_progress: F) -> Result<StagingSummary, StagingError>
    where
        F: Fn(ProgressUpdate),
    {
        let (records, dups) = build_staging_records(matched, self.spec, self.data_source);
        if dups > 0 {
            log::info!("[Stage] Collapsed {} rows sharing a natural key ({})", dups, self.spec.describe());
        }
        self.store.ensure_table(self.table).await?;
        self.store.truncate(self.table).await?;

        let mut summary = StagingSummary { input_rows: matched.len() as u64, duplicates_collapsed: dups, ..Default::default() };
        let meter = Throughput::start(records.len() as u64);
        for batch in records.chunks(self.write_batch_size) {
            match self.store.insert_batch(self.table, batch).await {
                Ok(n) => {
                    summary.written += n;
                    summary.batches += 1;
                }
                Err(source) => {
                    log::error!("[Stage] Write failed after {} rows: {}", summary.written, source);
                    self.discard().await;
                    return Err(StagingError::Write { written: summary.written, source });
                }
            }
            on_progress(ProgressUpdate::at("staging", summary.written as usize, records.len(), &meter));
        }

        let expected = records.len() as u64;
        let found = self.store.count(self.table).await?;
        if found != expected || summary.written != expected {
            log::error!("[Stage] Verification failed: expected {}, table has {}", expected, found);
            self.discard().await;
            return Err(StagingError::CountMismatch { expected, found });
        }
        log::info!("[Stage] {} rows staged in `{}` ({} batches)", summary.written, self.table, summary.batches);
        Ok(summary)
    }

    async fn discard(&self) {
        if let Err(e) = self.store.truncate(self.table).await {
            log::warn!("[Stage] Could not clear `{}` after failure: {}", self.table, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityId, TradeRow};

    fn m(offset: u64, importer: &str, qty: f64) -> MatchedRow {
        MatchedRow {
            entity_id: EntityId::new("bear"),
            row: TradeRow {
                source_shard: 1, source_offset: offset, year: 2020, appendix: "II".into(), taxon: "Ursus maritimus".into(),
                class: String::new(), order: String::new(), family: String::new(), genus: String::new(),
                term: "skins".into(), quantity: Some(qty), unit: String::new(), importer: importer.into(),
                exporter: "CA".into(), origin: String::new(), purpose: "T".into(), source: "W".into(),
                reporter_type: String::new(),
            },
        }
    }

    #[test]
    fn dedup_keeps_first_and_numbers_survivors() {
        let rows = vec![m(0, "US", 1.0), m(1, "US", 5.0), m(2, "GB", 1.0)];
        let (recs, dups) = build_staging_records(&rows, &NaturalKeySpec::default(), "src");
        assert_eq!(dups, 1);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].quantity, Some(1.0));
        assert_eq!((recs[0].load_seq, recs[1].load_seq), (0, 1));
        assert_eq!(recs[1].importer, "GB");
    }
}
