use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::EntityAggregate;
use crate::cutover::CutoverRecord;
use crate::db::EntityTableSummary;
use crate::engine::{RowCounts, ShardReport};
use crate::models::{EntityId, StagingRecord};
use crate::resolver::CatalogConflict;
use crate::staging::StagingSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Extraction finished but cutover was skipped on request.
    SkippedDryRun,
    /// Extraction only, no store stages requested.
    Extracted,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedEntry {
    pub name: String,
    pub count: u64,
    /// Nearest catalog synonym; informational only, never used to resolve.
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub new_rows: u64,
    pub duplicate_rows: u64,
}

/// Extraction against production for one entity after a cutover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReconciliation {
    pub entity_id: EntityId,
    pub extracted_rows: u64,
    pub staged_rows: u64,
    pub production_rows: u64,
    pub extracted_years: Option<(i32, i32)>,
    pub production_years: Option<(i32, i32)>,
    /// Production holds at least every staged row and the extracted year range.
    pub complete: bool,
}

/// Joins extraction aggregates with staging and production summaries per
/// entity. Entities present only in production are left out.
pub fn reconcile(aggregates: &[EntityAggregate], staged: &[EntityTableSummary], production: &[EntityTableSummary]) -> Vec<EntityReconciliation> {
    let mut out: BTreeMap<EntityId, EntityReconciliation> = BTreeMap::new();
    let blank = |id: &EntityId| EntityReconciliation {
        entity_id: id.clone(),
        extracted_rows: 0,
        staged_rows: 0,
        production_rows: 0,
        extracted_years: None,
        production_years: None,
        complete: false,
    };
    for a in aggregates {
        let e = out.entry(a.entity_id.clone()).or_insert_with(|| blank(&a.entity_id));
        e.extracted_rows = a.record_count;
        e.extracted_years = a.min_year.zip(a.max_year);
    }
    for s in staged {
        out.entry(s.entity_id.clone()).or_insert_with(|| blank(&s.entity_id)).staged_rows = s.rows;
    }
    for p in production {
        if let Some(e) = out.get_mut(&p.entity_id) {
            e.production_rows = p.rows;
            e.production_years = p.min_year.zip(p.max_year);
        }
    }
    for e in out.values_mut() {
        let years_covered = match (e.extracted_years, e.production_years) {
            (None, _) => true,
            (Some((lo, hi)), Some((plo, phi))) => plo <= lo && phi >= hi,
            (Some(_), None) => false,
        };
        e.complete = e.production_rows >= e.staged_rows && years_covered;
    }
    out.into_values().collect()
}

/// Machine-readable summary written for every run, including failed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub total_shards: usize,
    pub shards_processed: usize,
    pub shards_failed: usize,
    pub shards_interrupted: usize,
    pub shards: Vec<ShardReport>,
    pub rows: RowCounts,
    pub distinct_unmatched_names: usize,
    pub top_unmatched: Vec<UnmatchedEntry>,
    pub catalog_conflicts: Vec<CatalogConflict>,
    pub staging: Option<StagingSummary>,
    pub merge: Option<MergeSummary>,
    /// Rows behind an ambiguous natural key, for operator review.
    #[serde(default)]
    pub conflict_rows: Vec<StagingRecord>,
    pub cutover: Option<CutoverRecord>,
    #[serde(default)]
    pub reconciliation: Vec<EntityReconciliation>,
    pub aggregates: Vec<EntityAggregate>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            job_name: job_name.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Failed,
            error: None,
            total_shards: 0,
            shards_processed: 0,
            shards_failed: 0,
            shards_interrupted: 0,
            shards: Vec::new(),
            rows: RowCounts::default(),
            distinct_unmatched_names: 0,
            top_unmatched: Vec::new(),
            catalog_conflicts: Vec::new(),
            staging: None,
            merge: None,
            conflict_rows: Vec::new(),
            cutover: None,
            reconciliation: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    /// Every shard is accounted for and every row read landed in exactly one bucket.
    pub fn is_consistent(&self) -> bool {
        self.shards_processed + self.shards_failed + self.shards_interrupted == self.total_shards && self.rows.is_balanced()
    }

    pub fn reconciliation_gaps(&self) -> usize { self.reconciliation.iter().filter(|r| !r.complete).count() }

    pub fn finish(&mut self, outcome: RunOutcome, error: Option<String>) {
        self.outcome = outcome;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write run report {}", path.display()))?;
        log::info!("[Report] Wrote {}", path.display());
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read run report {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid run report {}", path.display()))
    }
}
