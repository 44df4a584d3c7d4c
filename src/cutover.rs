use std::fmt;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{validate_ident, ApplyOutcome, TradeStore};
use crate::error::{CutoverError, StoreError};
use crate::models::StagingRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CutoverMode {
    /// Insert NEW rows into production inside one transaction.
    #[default]
    Append,
    /// Build a shadow copy with the NEW rows and rename it over production.
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CutoverState {
    Prepared,
    SnapshotTaken,
    Applying,
    Applied,
    Failed,
    RolledBack,
}

impl fmt::Display for CutoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepared => "PREPARED",
            Self::SnapshotTaken => "SNAPSHOT_TAKEN",
            Self::Applying => "APPLYING",
            Self::Applied => "APPLIED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: CutoverState,
    pub at: DateTime<Utc>,
}

/// Everything needed to inspect a cutover later or to roll it back from a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoverRecord {
    pub mode: CutoverMode,
    pub state: CutoverState,
    pub production_table: String,
    /// Pre-cutover copy of production. In swap mode it holds the retired
    /// table and only exists once the swap has happened.
    pub snapshot_table: String,
    pub snapshot_rows: Option<u64>,
    pub shadow_table: Option<String>,
    pub attempted: u64,
    pub applied: u64,
    pub batches: u64,
    pub interrupted: bool,
    /// Row count of the apply target just before the insert, and of
    /// production once the cutover finished.
    #[serde(default)]
    pub rows_before: Option<u64>,
    #[serde(default)]
    pub rows_after: Option<u64>,
    /// Operator accepted the result; the snapshot has been disposed of.
    pub confirmed: bool,
    pub error: Option<String>,
    pub history: Vec<Transition>,
}

/// Single writer to production. Every mutation goes through one of the
/// transitions below; anything else is rejected with `InvalidTransition`.
pub struct CutoverController<'a> {
    store: &'a dyn TradeStore,
    apply_batch_size: usize,
    record: CutoverRecord,
}

impl<'a> CutoverController<'a> {
    pub fn new(store: &'a dyn TradeStore, production_table: &str, mode: CutoverMode, apply_batch_size: usize, run_id: &str) -> Self {
        let record = CutoverRecord {
            mode,
            state: CutoverState::Prepared,
            production_table: production_table.to_string(),
            snapshot_table: format!("{}_snap_{}", production_table, run_id),
            snapshot_rows: None,
            shadow_table: match mode {
                CutoverMode::Append => None,
                CutoverMode::Swap => Some(format!("{}_shadow_{}", production_table, run_id)),
            },
            attempted: 0,
            applied: 0,
            batches: 0,
            interrupted: false,
            rows_before: None,
            rows_after: None,
            confirmed: false,
            error: None,
            history: vec![Transition { state: CutoverState::Prepared, at: Utc::now() }],
        };
        Self { store, apply_batch_size: apply_batch_size.max(1), record }
    }

    /// Reattaches to a cutover recorded by an earlier run (operator rollback/confirm).
    pub fn resume(store: &'a dyn TradeStore, record: CutoverRecord) -> Self {
        Self { store, apply_batch_size: 1, record }
    }

    pub fn state(&self) -> CutoverState { self.record.state }
    pub fn record(&self) -> &CutoverRecord { &self.record }
    pub fn into_record(self) -> CutoverRecord { self.record }

    fn transition(&mut self, to: CutoverState) {
        log::info!("[Cutover] {} -> {}", self.record.state, to);
        self.record.state = to;
        self.record.history.push(Transition { state: to, at: Utc::now() });
    }

    fn invalid(&self, action: &'static str) -> CutoverError {
        CutoverError::InvalidTransition { from: self.record.state.to_string(), action }
    }

    fn fail(&mut self, err: &dyn fmt::Display) {
        self.record.error = Some(err.to_string());
        self.transition(CutoverState::Failed);
    }

    async fn drop_shadow(&self) {
        if let Some(shadow) = &self.record.shadow_table {
            if let Err(e) = self.store.drop_table(shadow).await {
                log::warn!("[Cutover] Could not drop shadow `{}`: {}", shadow, e);
            }
        }
    }

    async fn copy_production(&self, copy_to: &str) -> Result<u64, StoreError> {
        validate_ident(&self.record.snapshot_table)?;
        self.store.ensure_table(&self.record.production_table).await?;
        self.store.create_snapshot(&self.record.production_table, copy_to).await
    }

    /// PREPARED -> SNAPSHOT_TAKEN | FAILED. Append mode copies production to
    /// the snapshot table; swap mode copies it to the shadow table and leaves
    /// the live table untouched as the pre-cutover state. A failed copy is
    /// dropped.
    pub async fn take_snapshot(&mut self) -> Result<(), CutoverError> {
        if self.record.state != CutoverState::Prepared { return Err(self.invalid("take_snapshot")); }
        let copy_to = self.record.shadow_table.clone().unwrap_or_else(|| self.record.snapshot_table.clone());
        match self.copy_production(&copy_to).await {
            Ok(rows) => {
                log::info!("[Cutover] Copied {} production rows to `{}`", rows, copy_to);
                self.record.snapshot_rows = Some(rows);
                self.transition(CutoverState::SnapshotTaken);
                Ok(())
            }
            Err(source) => {
                log::error!("[Cutover] Snapshot failed; production unchanged: {}", source);
                self.fail(&source);
                if let Err(e) = self.store.drop_table(&copy_to).await {
                    log::warn!("[Cutover] Could not drop partial copy `{}`: {}", copy_to, e);
                }
                Err(source.into())
            }
        }
    }

    async fn write_rows(&self, target: &str, rows: &[StagingRecord], cancel: &AtomicBool) -> Result<(u64, ApplyOutcome), StoreError> {
        let before = self.store.count(target).await?;
        let outcome = self.store.apply_rows(target, rows, self.apply_batch_size, cancel).await?;
        Ok((before, outcome))
    }

    /// SNAPSHOT_TAKEN -> APPLYING -> APPLIED | FAILED. Only inserts; a
    /// failure while writing leaves production exactly as it was before this
    /// call. Once committed, production must hold exactly the prior rows plus
    /// the inserted ones, otherwise the cutover is FAILED with rollback open.
    pub async fn apply(&mut self, rows: &[StagingRecord], cancel: &AtomicBool) -> Result<ApplyOutcome, CutoverError> {
        if self.record.state != CutoverState::SnapshotTaken { return Err(self.invalid("apply")); }
        self.transition(CutoverState::Applying);
        self.record.attempted = rows.len() as u64;
        let target = self.record.shadow_table.clone().unwrap_or_else(|| self.record.production_table.clone());

        let (before, outcome) = match self.write_rows(&target, rows, cancel).await {
            Ok(r) => r,
            Err(source) => {
                log::error!("[Cutover] Apply failed; production unchanged: {}", source);
                self.fail(&source);
                self.drop_shadow().await;
                return Err(CutoverError::Apply { attempted: rows.len() as u64, source });
            }
        };
        if self.record.mode == CutoverMode::Swap {
            let (live, retired) = (self.record.production_table.clone(), self.record.snapshot_table.clone());
            if let Err(source) = self.store.swap_tables(&live, &target, &retired).await {
                log::error!("[Cutover] Swap failed; production unchanged: {}", source);
                self.fail(&source);
                self.drop_shadow().await;
                return Err(CutoverError::Apply { attempted: rows.len() as u64, source });
            }
            self.record.shadow_table = None;
        }
        // From here production holds the new rows.
        self.record.rows_before = Some(before);
        self.record.applied = outcome.applied;
        self.record.batches = outcome.batches;
        self.record.interrupted = outcome.interrupted;

        let found = match self.store.count(&self.record.production_table).await {
            Ok(n) => n,
            Err(source) => {
                self.fail(&source);
                return Err(source.into());
            }
        };
        self.record.rows_after = Some(found);
        let expected = before + outcome.applied;
        if found != expected {
            let err = CutoverError::Verification { expected, found };
            log::error!("[Cutover] {}", err);
            self.fail(&err);
            return Err(err);
        }
        if outcome.interrupted {
            log::warn!("[Cutover] Cancelled after {} of {} rows; re-plan to apply the rest", outcome.applied, rows.len());
        }
        log::info!("[Cutover] Production `{}` now holds {} rows ({} + {})", self.record.production_table, found, before, outcome.applied);
        self.transition(CutoverState::Applied);
        Ok(outcome)
    }

    /// Convenience for the normal path: snapshot then apply.
    pub async fn run(&mut self, rows: &[StagingRecord], cancel: &AtomicBool) -> Result<ApplyOutcome, CutoverError> {
        self.take_snapshot().await?;
        self.apply(rows, cancel).await
    }

    /// Operator action: FAILED -> ROLLED_BACK, or APPLIED -> ROLLED_BACK while unconfirmed.
    pub async fn rollback(&mut self) -> Result<(), CutoverError> {
        let allowed = match self.record.state {
            CutoverState::Failed => true,
            CutoverState::Applied => !self.record.confirmed,
            _ => false,
        };
        if !allowed { return Err(self.invalid("rollback")); }
        let snapshot_exists = self.store.table_exists(&self.record.snapshot_table).await?;
        if snapshot_exists {
            self.store.restore_snapshot(&self.record.production_table, &self.record.snapshot_table).await?;
            log::info!("[Cutover] Restored `{}` from `{}`", self.record.production_table, self.record.snapshot_table);
        } else if self.record.state == CutoverState::Failed && self.record.rows_before.is_none() {
            // Without a snapshot the failure came before anything was committed or swapped.
            log::info!("[Cutover] Nothing was committed; `{}` already in pre-cutover state", self.record.production_table);
        } else {
            return Err(StoreError::MissingSnapshot(self.record.snapshot_table.clone()).into());
        }
        self.transition(CutoverState::RolledBack);
        Ok(())
    }

    /// Operator action on APPLIED: disposes of the snapshot. Rollback is no longer possible.
    pub async fn confirm(&mut self) -> Result<(), CutoverError> {
        if self.record.state != CutoverState::Applied || self.record.confirmed { return Err(self.invalid("confirm")); }
        self.store.drop_table(&self.record.snapshot_table).await?;
        self.record.confirmed = true;
        log::info!("[Cutover] Confirmed; dropped snapshot `{}`", self.record.snapshot_table);
        Ok(())
    }

    /// FAILED -> PREPARED so the same plan can be applied again once the
    /// cause is fixed. Refused once rows reached production; roll back instead.
    pub async fn reset(&mut self) -> Result<(), CutoverError> {
        if self.record.state != CutoverState::Failed || self.record.rows_before.is_some() { return Err(self.invalid("reset")); }
        self.store.drop_table(&self.record.snapshot_table).await?;
        self.drop_shadow().await;
        self.record.error = None;
        self.record.snapshot_rows = None;
        self.record.attempted = 0;
        self.record.rows_before = None;
        self.record.rows_after = None;
        self.transition(CutoverState::Prepared);
        Ok(())
    }
}
