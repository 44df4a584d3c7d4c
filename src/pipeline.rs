use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::config::AppConfig;
use crate::cutover::CutoverController;
use crate::db::TradeStore;
use crate::engine::{
    Checkpointer, ExtractionCoordinator, ExtractionOutput, ExtractionSettings, FileCheckpointer, ProgressUpdate,
    SharedCheckpointer, StreamControl,
};
use crate::error::MergeError;
use crate::export::export_all;
use crate::merge::{MergePlan, MergePlanner};
use crate::report::{reconcile, MergeSummary, RunOutcome, RunReport, UnmatchedEntry};
use crate::resolver::EntityResolver;
use crate::shard::discover_shards;
use crate::staging::StagingLoader;

pub fn new_run_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

pub fn report_path(output_dir: &Path, run_id: &str) -> PathBuf {
    output_dir.join(format!("report_{}.json", run_id))
}

/// File-backed checkpoints under the configured directory. `fresh` discards
/// whatever an earlier run of the same job left behind.
pub fn open_checkpointer(cfg: &AppConfig, fresh: bool) -> Result<SharedCheckpointer> {
    let cp = FileCheckpointer::new(&cfg.pipeline.checkpoint_dir);
    if fresh {
        cp.clear(&cfg.pipeline.job_name)?;
        log::info!("[Checkpoint] Cleared checkpoints for job `{}`", cfg.pipeline.job_name);
    }
    Ok(Arc::new(cp))
}

/// One end-to-end run. Stages after extraction only happen when a store is supplied.
pub struct Pipeline<'a> {
    cfg: &'a AppConfig,
    control: StreamControl,
    checkpointer: SharedCheckpointer,
    run_id: String,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a AppConfig, control: StreamControl, checkpointer: SharedCheckpointer) -> Self {
        Self { cfg, control, checkpointer, run_id: new_run_id() }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str { &self.run_id }

    /// Runs every requested stage and returns the report, also on failure.
    /// The report is written to the output directory before returning.
    pub async fn execute<F>(&self, store: Option<&dyn TradeStore>, on_progress: F) -> RunReport
    where
        F: Fn(ProgressUpdate) + Send + Clone + 'static,
    {
        let mut report = RunReport::new(&self.run_id, &self.cfg.pipeline.job_name);
        match self.execute_stages(store, &mut report, on_progress).await {
            Ok(outcome) => report.finish(outcome, None),
            Err(e) => {
                log::error!("[Run] {} failed: {:#}", self.run_id, e);
                report.finish(RunOutcome::Failed, Some(format!("{:#}", e)));
            }
        }
        let path = report_path(&self.cfg.pipeline.output_dir, &self.run_id);
        if let Err(e) = report.write_json(&path) {
            log::error!("[Report] {:#}", e);
        }
        report
    }

    async fn execute_stages<F>(&self, store: Option<&dyn TradeStore>, report: &mut RunReport, on_progress: F) -> Result<RunOutcome>
    where
        F: Fn(ProgressUpdate) + Send + Clone + 'static,
    {
        let p = &self.cfg.pipeline;
        let resolver = Arc::new(EntityResolver::from_csv_path(&p.entities_path)?);
        report.catalog_conflicts = resolver.conflicts();
        for c in &report.catalog_conflicts {
            log::warn!("[Resolver] `{}` is claimed by {} entities and will not resolve", c.name, c.entity_ids.len());
        }

        let output = self.extract(Arc::clone(&resolver), report, on_progress.clone()).await?;
        if output.cancelled {
            log::warn!("[Run] Cancelled during extraction; checkpoints kept for resume");
            return Ok(RunOutcome::Cancelled);
        }
        if report.total_shards > 0 && report.shards_processed == 0 {
            bail!("All {} shards failed", report.total_shards);
        }

        let Some(store) = store else { return Ok(RunOutcome::Extracted) };

        let staged = StagingLoader::new(store, &p.staging_table, &self.cfg.natural_key, p.write_batch_size, &p.data_source_label)
            .load(&output.matched, &on_progress)
            .await
            .context("Staging failed")?;
        log::info!("[Stage] {} rows in `{}` ({} batches)", staged.written, p.staging_table, staged.batches);
        report.staging = Some(staged);

        // Tables created before the configured key was chosen may lack its index.
        if !p.dry_run && store.table_exists(&p.production_table).await? {
            store
                .ensure_key_index(&p.production_table, &self.cfg.natural_key)
                .await
                .context("Failed to index production natural key")?;
        }
        let plan = self.plan(store, report).await?;
        if p.dry_run {
            log::info!("[Run] Dry run: {} NEW rows would be applied to `{}`", plan.new_count(), p.production_table);
            return Ok(RunOutcome::SkippedDryRun);
        }
        if self.control.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        let mut cutover = CutoverController::new(store, &p.production_table, p.cutover_mode, p.apply_batch_size, &self.run_id);
        let applied = cutover.run(&plan.new_rows, &self.control.cancel).await;
        report.cutover = Some(cutover.into_record());
        let applied = applied.context("Cutover failed")?;
        if applied.interrupted {
            return Ok(RunOutcome::Cancelled);
        }

        let staged = store.entity_summary(&p.staging_table).await.context("Reconciliation failed")?;
        let production = store.entity_summary(&p.production_table).await.context("Reconciliation failed")?;
        report.reconciliation = reconcile(&report.aggregates, &staged, &production);
        let gaps = report.reconciliation_gaps();
        if gaps > 0 {
            for r in report.reconciliation.iter().filter(|r| !r.complete) {
                log::error!("[Reconcile] {}: {} staged, {} in production, years {:?} vs {:?}",
                    r.entity_id, r.staged_rows, r.production_rows, r.extracted_years, r.production_years);
            }
            bail!("{} entities are short in production after cutover; rollback is available", gaps);
        }
        log::info!("[Reconcile] {} entities consistent with production", report.reconciliation.len());
        Ok(RunOutcome::Succeeded)
    }

    async fn extract<F>(&self, resolver: Arc<EntityResolver>, report: &mut RunReport, on_progress: F) -> Result<ExtractionOutput>
    where
        F: Fn(ProgressUpdate) + Send + 'static,
    {
        let p = &self.cfg.pipeline;
        let shards = discover_shards(&p.source_dir, &p.shard_prefix, &p.shard_extension)?;
        report.total_shards = shards.len();

        let coordinator = ExtractionCoordinator::new(
            ExtractionSettings::from(p),
            Arc::clone(&resolver),
            Arc::clone(&self.checkpointer),
            self.cfg.trend.clone(),
        );
        let control = self.control.clone();
        let output = tokio::task::spawn_blocking(move || coordinator.run(&shards, &control, on_progress))
            .await
            .context("Extraction task panicked")??;

        report.shards = output.shards.clone();
        report.shards_processed = output.shards_processed();
        report.shards_failed = output.shards_failed();
        report.shards_interrupted = output.shards_interrupted();
        report.rows = output.counts.clone();
        report.distinct_unmatched_names = output.unmatched.distinct();
        report.aggregates = output.aggregates.clone();

        let mut unmatched: Vec<UnmatchedEntry> = output
            .unmatched
            .top(output.unmatched.distinct())
            .into_iter()
            .map(|(name, count)| {
                let hint = resolver.nearest_synonym(&name).map(|(s, score)| format!("{} [{:.2}]", s, score));
                UnmatchedEntry { name, count, hint }
            })
            .collect();
        export_all(&p.output_dir, &self.run_id, &output.matched, &unmatched, &output.aggregates, &p.data_source_label)?;
        unmatched.truncate(p.top_unmatched);
        report.top_unmatched = unmatched;

        log::info!(
            "[Extract] {}/{} shards processed ({} failed, {} interrupted); {} read, {} matched, {} unmatched, {} malformed",
            report.shards_processed, report.total_shards, report.shards_failed, report.shards_interrupted,
            report.rows.rows_read, report.rows.matched, report.rows.unmatched, report.rows.malformed
        );
        if !report.is_consistent() {
            log::error!("[Extract] Shard or row accounting does not balance");
        }
        Ok(output)
    }

    async fn plan(&self, store: &dyn TradeStore, report: &mut RunReport) -> Result<MergePlan> {
        let p = &self.cfg.pipeline;
        let planner = MergePlanner::new(store, &p.staging_table, &p.production_table, &self.cfg.natural_key, p.write_batch_size);
        let plan = match planner.plan().await {
            Ok(plan) => plan,
            Err(MergeError::Ambiguous { key, rows, production_matches }) => {
                log::error!("[Plan] Natural key {} is ambiguous ({} production matches); cutover aborted", key, production_matches);
                for r in &rows {
                    log::error!("[Plan]   load_seq={} taxon=`{}` year={} {}->{}", r.load_seq, r.taxon, r.year, r.exporter, r.importer);
                }
                report.conflict_rows = rows;
                bail!("Ambiguous natural key {} ({} production matches)", key, production_matches);
            }
            Err(e) => return Err(e).context("Merge planning failed"),
        };
        report.merge = Some(MergeSummary { new_rows: plan.new_count(), duplicate_rows: plan.duplicate_count() });

        let plan_path = p.output_dir.join(format!("plan_{}.json", self.run_id));
        let json = serde_json::to_string_pretty(&plan).context("Failed to serialize merge plan")?;
        std::fs::write(&plan_path, json).with_context(|| format!("Failed to write {}", plan_path.display()))?;
        Ok(plan)
    }
}

/// Operator rollback of the cutover recorded in `report_path`. The report is rewritten with the new state.
pub async fn rollback_from_report(store: &dyn TradeStore, report_path: &Path) -> Result<RunReport> {
    operate_on_report(store, report_path, "rollback").await
}

/// Operator confirmation of an applied cutover; disposes of the snapshot.
pub async fn confirm_from_report(store: &dyn TradeStore, report_path: &Path) -> Result<RunReport> {
    operate_on_report(store, report_path, "confirm").await
}

async fn operate_on_report(store: &dyn TradeStore, report_path: &Path, action: &str) -> Result<RunReport> {
    let mut report = RunReport::read_json(report_path)?;
    let Some(record) = report.cutover.take() else {
        bail!("Run {} has no cutover to {}", report.run_id, action);
    };
    let mut controller = CutoverController::resume(store, record);
    let result = match action {
        "rollback" => controller.rollback().await,
        _ => controller.confirm().await,
    };
    report.cutover = Some(controller.into_record());
    report.write_json(report_path)?;
    result.with_context(|| format!("{} of run {} failed", action, report.run_id))?;
    Ok(report)
}
