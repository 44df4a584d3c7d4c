pub mod file_checkpointer;
pub mod pool;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::{EntityAggregate, PartialAggregates, TrendPolicy};
use crate::config::PipelineConfig;
use crate::error::ShardError;
use crate::matching::MatchFilter;
use crate::metrics::{memory_stats_mb, Throughput};
use crate::models::{MatchedRow, ShardId};
use crate::resolver::{EntityResolver, UnmatchedNames};
use crate::shard::{ParsedRow, ShardCursor, ShardReader, ShardSpec, SourceFingerprint};

pub use file_checkpointer::FileCheckpointer;

/// Durable progress keyed by job and partition: a small token that is
/// replaced on every commit, plus an append-only log of row records.
pub trait Checkpointer {
    fn save(&self, job: &str, partition: &str, token: &str) -> Result<()>;
    fn load(&self, job: &str, partition: &str) -> Result<Option<String>>;
    /// Appends newline-terminated records to the partition's row log.
    fn append_rows(&self, job: &str, partition: &str, lines: &str) -> Result<()>;
    /// Row log records in append order. A torn final record may be present.
    fn load_rows(&self, job: &str, partition: &str) -> Result<Vec<String>>;
    /// Replaces the row log with `lines`; an empty string truncates it.
    fn reset_rows(&self, job: &str, partition: &str, lines: &str) -> Result<()>;
    /// Drops every token and row log of `job`.
    fn clear(&self, job: &str) -> Result<()>;
}

type PartitionKey = (String, String);

/// Process-local checkpoints; progress survives retries but not restarts.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    tokens: Mutex<HashMap<PartitionKey, String>>,
    rows: Mutex<HashMap<PartitionKey, String>>,
}

fn lock_map<'m>(m: &'m Mutex<HashMap<PartitionKey, String>>) -> Result<MutexGuard<'m, HashMap<PartitionKey, String>>> {
    m.lock().map_err(|_| anyhow!("checkpoint map lock poisoned"))
}

fn key(job: &str, partition: &str) -> PartitionKey { (job.to_string(), partition.to_string()) }

impl Checkpointer for MemoryCheckpointer {
    fn save(&self, job: &str, partition: &str, token: &str) -> Result<()> {
        lock_map(&self.tokens)?.insert(key(job, partition), token.to_string());
        Ok(())
    }
    fn load(&self, job: &str, partition: &str) -> Result<Option<String>> {
        Ok(lock_map(&self.tokens)?.get(&key(job, partition)).cloned())
    }
    fn append_rows(&self, job: &str, partition: &str, lines: &str) -> Result<()> {
        lock_map(&self.rows)?.entry(key(job, partition)).or_default().push_str(lines);
        Ok(())
    }
    fn load_rows(&self, job: &str, partition: &str) -> Result<Vec<String>> {
        Ok(lock_map(&self.rows)?
            .get(&key(job, partition))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default())
    }
    fn reset_rows(&self, job: &str, partition: &str, lines: &str) -> Result<()> {
        lock_map(&self.rows)?.insert(key(job, partition), lines.to_string());
        Ok(())
    }
    fn clear(&self, job: &str) -> Result<()> {
        lock_map(&self.tokens)?.retain(|(j, _), _| j != job);
        lock_map(&self.rows)?.retain(|(j, _), _| j != job);
        Ok(())
    }
}

/// Shared by every shard worker. Implementations synchronize internally so
/// workers on different partitions do not wait on each other.
pub type SharedCheckpointer = Arc<dyn Checkpointer + Send + Sync>;

/// Cooperative run control shared between the operator surface and workers.
#[derive(Clone, Default)]
pub struct StreamControl {
    pub cancel: Arc<AtomicBool>,
    pub pause: Arc<AtomicBool>,
}

impl StreamControl {
    pub fn new() -> Self { Self::default() }
    pub fn request_cancel(&self) { self.cancel.store(true, Ordering::Relaxed); }
    pub fn is_cancelled(&self) -> bool { self.cancel.load(Ordering::Relaxed) }

    fn wait_while_paused(&self) {
        while self.pause.load(Ordering::Relaxed) && !self.is_cancelled() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub processed: usize,
    pub total: usize,
    pub percent: f32,
    pub eta_secs: u64,
    pub mem_used_mb: u64,
    pub mem_avail_mb: u64,
    pub stage: &'static str,
}

impl ProgressUpdate {
    pub fn at(stage: &'static str, processed: usize, total: usize, meter: &Throughput) -> Self {
        let mem = memory_stats_mb();
        Self {
            processed,
            total,
            percent: meter.fraction(processed as u64) * 100.0,
            eta_secs: meter.eta_secs(processed as u64),
            mem_used_mb: mem.used_mb,
            mem_avail_mb: mem.avail_mb,
            stage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub rows_read: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub malformed: u64,
}

impl RowCounts {
    pub fn add(&mut self, o: &RowCounts) {
        self.rows_read += o.rows_read;
        self.matched += o.matched;
        self.unmatched += o.unmatched;
        self.malformed += o.malformed;
    }

    /// Every row read is accounted for exactly once.
    pub fn is_balanced(&self) -> bool { self.matched + self.unmatched + self.malformed == self.rows_read }
}

/// Committed state of one shard, stored as the checkpoint token after every
/// batch. Matched rows live in the partition's row log instead; the first
/// `counts.matched` records of that log belong to this state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardProgress {
    pub shard: ShardId,
    /// Source file and catalog the state was computed from. A checkpoint
    /// whose fingerprint differs from the current one is discarded.
    #[serde(default)]
    pub fingerprint: Option<SourceFingerprint>,
    pub cursor: ShardCursor,
    pub counts: RowCounts,
    #[serde(skip)]
    pub matched: Vec<MatchedRow>,
    pub aggregates: PartialAggregates,
    pub unmatched: UnmatchedNames,
    pub complete: bool,
}

impl ShardProgress {
    pub fn new(shard: ShardId, fingerprint: SourceFingerprint) -> Self {
        Self {
            shard,
            fingerprint: Some(fingerprint),
            cursor: ShardCursor::default(),
            counts: RowCounts::default(),
            matched: Vec::new(),
            aggregates: PartialAggregates::default(),
            unmatched: UnmatchedNames::default(),
            complete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Completed,
    Failed,
    /// Stopped by cancellation; resumes from its checkpoint on the next run.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReport {
    pub shard: ShardId,
    pub status: ShardStatus,
    pub attempts: u32,
    pub resumed: bool,
    pub counts: RowCounts,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub retry_limit: u32,
    pub max_malformed_ratio: f64,
    pub job_name: String,
}

impl From<&PipelineConfig> for ExtractionSettings {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            workers: c.workers,
            batch_size: c.batch_size,
            retry_limit: c.retry_limit,
            max_malformed_ratio: c.max_malformed_ratio,
            job_name: c.job_name.clone(),
        }
    }
}

/// Consolidated result of the fan-in. Only completed shards contribute rows.
#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub shards: Vec<ShardReport>,
    /// Ordered by (shard index, in-shard offset).
    pub matched: Vec<MatchedRow>,
    pub aggregates: Vec<EntityAggregate>,
    pub unmatched: UnmatchedNames,
    pub counts: RowCounts,
    pub cancelled: bool,
}

impl ExtractionOutput {
    fn count(&self, status: ShardStatus) -> usize { self.shards.iter().filter(|s| s.status == status).count() }
    pub fn shards_processed(&self) -> usize { self.count(ShardStatus::Completed) }
    pub fn shards_failed(&self) -> usize { self.count(ShardStatus::Failed) }
    pub fn shards_interrupted(&self) -> usize { self.count(ShardStatus::Interrupted) }
}

struct ShardOutcome {
    report: ShardReport,
    progress: Option<ShardProgress>,
}

struct WorkerContext {
    settings: ExtractionSettings,
    resolver: Arc<EntityResolver>,
    checkpointer: SharedCheckpointer,
    control: StreamControl,
}

/// Fans shards out to a bounded pool and merges what comes back on the calling thread.
pub struct ExtractionCoordinator {
    settings: ExtractionSettings,
    resolver: Arc<EntityResolver>,
    checkpointer: SharedCheckpointer,
    trend: TrendPolicy,
}

impl ExtractionCoordinator {
    pub fn new(settings: ExtractionSettings, resolver: Arc<EntityResolver>, checkpointer: SharedCheckpointer, trend: TrendPolicy) -> Self {
        Self { settings, resolver, checkpointer, trend }
    }

    pub fn run<F>(&self, shards: &[ShardSpec], control: &StreamControl, on_progress: F) -> Result<ExtractionOutput>
    where
        F: Fn(ProgressUpdate),
    {
        let total = shards.len();
        log::info!("[Extract] {} shards, {} workers, batch size {}, retry limit {}",
            total, self.settings.workers, self.settings.batch_size, self.settings.retry_limit);
        let pool = pool::build_pool(self.settings.workers)?;
        let ctx = Arc::new(WorkerContext {
            settings: self.settings.clone(),
            resolver: Arc::clone(&self.resolver),
            checkpointer: Arc::clone(&self.checkpointer),
            control: control.clone(),
        });

        let (tx, rx) = crossbeam_channel::unbounded::<ShardOutcome>();
        for shard in shards.iter().cloned() {
            let ctx = Arc::clone(&ctx);
            let tx = tx.clone();
            pool.spawn(move || {
                let outcome = run_shard(&ctx, &shard);
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        let meter = Throughput::start(total as u64);
        on_progress(ProgressUpdate::at("extracting", 0, total, &meter));
        let mut reports = Vec::with_capacity(total);
        let mut completed = Vec::new();
        for outcome in rx.iter() {
            let r = &outcome.report;
            match r.status {
                ShardStatus::Completed => log::info!("[Shard {}] done: {} read, {} matched, {} unmatched, {} malformed ({} attempt(s){})",
                    r.shard, r.counts.rows_read, r.counts.matched, r.counts.unmatched, r.counts.malformed, r.attempts,
                    if r.resumed { ", resumed" } else { "" }),
                ShardStatus::Failed => log::error!("[Shard {}] failed after {} attempt(s): {}",
                    r.shard, r.attempts, r.error.as_deref().unwrap_or("unknown error")),
                ShardStatus::Interrupted => log::warn!("[Shard {}] interrupted at row {}", r.shard, r.counts.rows_read),
            }
            completed.extend(outcome.progress);
            reports.push(outcome.report);
            on_progress(ProgressUpdate::at("extracting", reports.len(), total, &meter));
        }
        if reports.len() != total {
            bail!("Extraction lost track of {} shard(s)", total - reports.len());
        }

        // Fold in shard order so the result does not depend on completion order.
        reports.sort_by_key(|r| r.shard.index);
        completed.sort_by_key(|p: &ShardProgress| p.shard.index);
        let mut matched = Vec::new();
        let mut aggregates = PartialAggregates::default();
        let mut unmatched = UnmatchedNames::default();
        let mut counts = RowCounts::default();
        for p in completed {
            counts.add(&p.counts);
            aggregates.merge(p.aggregates);
            unmatched.merge(p.unmatched);
            matched.extend(p.matched);
        }
        matched.sort_by_key(|m| (m.row.source_shard, m.row.source_offset));
        let output = ExtractionOutput {
            shards: reports,
            matched,
            aggregates: aggregates.finalize(&self.trend),
            unmatched,
            counts,
            cancelled: control.is_cancelled(),
        };
        log::info!("[Extract] {} processed, {} failed, {} interrupted; {} rows read, {} matched in {:.1}s ({:.0} shards/s)",
            output.shards_processed(), output.shards_failed(), output.shards_interrupted(),
            output.counts.rows_read, output.counts.matched, meter.elapsed().as_secs_f64(), meter.per_second(total as u64));
        Ok(output)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

fn run_shard(ctx: &WorkerContext, shard: &ShardSpec) -> ShardOutcome {
    let max_attempts = ctx.settings.retry_limit + 1;
    let mut attempts = 0;
    let mut resumed = false;
    let mut last_err = None;
    while attempts < max_attempts {
        attempts += 1;
        let result = catch_unwind(AssertUnwindSafe(|| extract_shard(ctx, shard)))
            .unwrap_or_else(|p| Err(ShardError::Panicked { shard: shard.id.to_string(), detail: panic_message(p.as_ref()) }));
        match result {
            Ok((progress, from_checkpoint)) => {
                resumed |= from_checkpoint;
                let status = if progress.complete { ShardStatus::Completed } else { ShardStatus::Interrupted };
                let report = ShardReport {
                    shard: shard.id.clone(),
                    status,
                    attempts,
                    resumed,
                    counts: progress.counts.clone(),
                    error: None,
                };
                let progress = (status == ShardStatus::Completed).then_some(progress);
                return ShardOutcome { report, progress };
            }
            Err(e) => {
                log::warn!("[Shard {}] attempt {}/{} failed: {}", shard.id, attempts, max_attempts, e);
                // Later attempts restart from the last committed checkpoint.
                resumed = true;
                last_err = Some(e);
                if ctx.control.is_cancelled() { break; }
            }
        }
    }
    ShardOutcome {
        report: ShardReport {
            shard: shard.id.clone(),
            status: ShardStatus::Failed,
            attempts,
            resumed,
            counts: RowCounts::default(),
            error: last_err.map(|e| e.to_string()),
        },
        progress: None,
    }
}

fn checkpoint_error(shard: &ShardSpec, detail: impl std::fmt::Display) -> ShardError {
    ShardError::Checkpoint { shard: shard.id.to_string(), detail: detail.to_string() }
}

fn checkpoint_io<T>(shard: &ShardSpec, r: Result<T>) -> Result<T, ShardError> {
    r.map_err(|e| checkpoint_error(shard, format!("{:#}", e)))
}

/// Restores the committed state of `shard`, or `None` when there is nothing
/// usable: no checkpoint, a fingerprint mismatch, or a row log shorter than
/// the committed match count.
fn load_progress(ctx: &WorkerContext, shard: &ShardSpec, fingerprint: &SourceFingerprint) -> Result<Option<ShardProgress>, ShardError> {
    let job = &ctx.settings.job_name;
    let Some(token) = checkpoint_io(shard, ctx.checkpointer.load(job, &shard.id.name))? else { return Ok(None) };
    let mut progress: ShardProgress = serde_json::from_str(&token).map_err(|e| checkpoint_error(shard, e))?;
    if progress.shard != shard.id {
        return Err(checkpoint_error(shard, format!("checkpoint belongs to {}; rerun with a fresh job", progress.shard)));
    }
    if progress.fingerprint.as_ref() != Some(fingerprint) {
        log::warn!("[Shard {}] source file or entity catalog changed since the checkpoint; re-reading from the start", shard.id);
        return Ok(None);
    }

    let committed = progress.counts.matched as usize;
    let lines = checkpoint_io(shard, ctx.checkpointer.load_rows(job, &shard.id.name))?;
    if lines.len() < committed {
        log::warn!("[Shard {}] row log has {} of {} committed rows; re-reading from the start", shard.id, lines.len(), committed);
        return Ok(None);
    }
    let mut matched = Vec::with_capacity(committed);
    for line in &lines[..committed] {
        match serde_json::from_str::<MatchedRow>(line) {
            Ok(m) => matched.push(m),
            Err(e) => {
                log::warn!("[Shard {}] unreadable row log record ({}); re-reading from the start", shard.id, e);
                return Ok(None);
            }
        }
    }
    if lines.len() > committed {
        // Records appended after the last committed token.
        let kept: String = lines[..committed].iter().map(|l| format!("{}\n", l)).collect();
        checkpoint_io(shard, ctx.checkpointer.reset_rows(job, &shard.id.name, &kept))?;
    }
    progress.matched = matched;
    Ok(Some(progress))
}

/// Appends `new_rows` to the row log, then replaces the token. A crash
/// between the two leaves extra log records that the next load drops.
fn commit_progress(ctx: &WorkerContext, shard: &ShardSpec, progress: &ShardProgress, new_rows: &[MatchedRow]) -> Result<(), ShardError> {
    let job = &ctx.settings.job_name;
    if !new_rows.is_empty() {
        let mut lines = String::new();
        for m in new_rows {
            lines.push_str(&serde_json::to_string(m).map_err(|e| checkpoint_error(shard, e))?);
            lines.push('\n');
        }
        checkpoint_io(shard, ctx.checkpointer.append_rows(job, &shard.id.name, &lines))?;
    }
    let token = serde_json::to_string(progress).map_err(|e| checkpoint_error(shard, e))?;
    checkpoint_io(shard, ctx.checkpointer.save(job, &shard.id.name, &token))
}

/// One attempt at a shard. Returns the committed progress and whether it
/// started from a checkpoint.
fn extract_shard(ctx: &WorkerContext, shard: &ShardSpec) -> Result<(ShardProgress, bool), ShardError> {
    let fingerprint = shard.fingerprint(ctx.resolver.catalog_digest())?;
    let (mut progress, resumed) = match load_progress(ctx, shard, &fingerprint)? {
        Some(p) => (p, true),
        None => {
            checkpoint_io(shard, ctx.checkpointer.reset_rows(&ctx.settings.job_name, &shard.id.name, ""))?;
            (ShardProgress::new(shard.id.clone(), fingerprint), false)
        }
    };
    if progress.complete {
        log::info!("[Shard {}] already complete in checkpoint; not re-reading", shard.id);
        return Ok((progress, true));
    }
    if resumed {
        log::info!("[Shard {}] resuming at row {}", shard.id, progress.cursor.row);
    }

    let mut reader = ShardReader::open_at(shard, progress.cursor)?;
    let filter = MatchFilter::new(&ctx.resolver);
    let batch_size = ctx.settings.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size.min(65_536));
    loop {
        ctx.control.wait_while_paused();
        if ctx.control.is_cancelled() {
            log::info!("[Shard {}] cancel requested; stopping at row {}", shard.id, progress.cursor.row);
            return Ok((progress, resumed));
        }
        batch.clear();
        if reader.next_batch(batch_size, &mut batch)? == 0 { break; }
        let committed = progress.matched.len();
        for parsed in batch.drain(..) {
            progress.counts.rows_read += 1;
            match parsed {
                ParsedRow::Row(row) => match filter.filter(row, &mut progress.unmatched).into_matched() {
                    Some(m) => {
                        progress.aggregates.observe(&m);
                        progress.matched.push(m);
                        progress.counts.matched += 1;
                    }
                    None => progress.counts.unmatched += 1,
                },
                ParsedRow::Malformed { offset, reason } => {
                    log::debug!("[Shard {}] row {} malformed: {:?}", shard.id, offset, reason);
                    progress.counts.malformed += 1;
                }
            }
        }
        progress.cursor = reader.cursor();
        commit_progress(ctx, shard, &progress, &progress.matched[committed..])?;
    }

    let c = &progress.counts;
    if c.rows_read > 0 && (c.malformed as f64 / c.rows_read as f64) > ctx.settings.max_malformed_ratio {
        return Err(ShardError::TooManyMalformed {
            path: shard.path.clone(),
            malformed: c.malformed,
            read: c.rows_read,
            limit: ctx.settings.max_malformed_ratio * 100.0,
        });
    }
    progress.complete = true;
    commit_progress(ctx, shard, &progress, &[])?;
    Ok((progress, resumed))
}
