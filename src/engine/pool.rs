//! Dedicated Rayon pool for shard workers, kept apart from the Tokio runtime
//! that drives the database stages.

use anyhow::{Context, Result};
use rayon::ThreadPool;

/// Worker count used when none is configured: all cores, minus one on
/// machines with more than 16.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8);
    let reserved = if cores > 16 { 1 } else { 0 };
    cores.saturating_sub(reserved).max(1)
}

pub fn build_pool(workers: usize) -> Result<ThreadPool> {
    let n = workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n)
        .thread_name(|i| format!("trade-subset-shard-{}", i))
        .build()
        .context("Failed to create shard worker pool")?;
    log::info!("[Extract] Worker pool ready with {} threads", n);
    Ok(pool)
}
