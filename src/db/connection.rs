use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use std::time::Duration;

fn env_num<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

pub async fn make_pool(cfg: &DatabaseConfig) -> Result<MySqlPool> {
    make_pool_with_size(cfg, None).await
}

/// The pipeline is mostly single-writer, so the default pool is small; the
/// env knobs exist for shared databases with tight connection limits.
pub async fn make_pool_with_size(cfg: &DatabaseConfig, max: Option<u32>) -> Result<MySqlPool> {
    let max_conn: u32 = max.or_else(|| env_num("TRADE_SUBSET_POOL_SIZE")).filter(|n| *n > 0).unwrap_or(8);
    let min_conn: u32 = env_num("TRADE_SUBSET_POOL_MIN").unwrap_or(1).min(max_conn);
    let acquire_ms: u64 = env_num("TRADE_SUBSET_ACQUIRE_MS").unwrap_or(5_000);
    let idle_ms: u64 = env_num("TRADE_SUBSET_IDLE_MS").unwrap_or(60_000);
    let life_ms: u64 = env_num("TRADE_SUBSET_LIFETIME_MS").unwrap_or(600_000);

    let pool = MySqlPoolOptions::new()
        .max_connections(max_conn)
        .min_connections(min_conn)
        .acquire_timeout(Duration::from_millis(acquire_ms))
        .idle_timeout(Some(Duration::from_millis(idle_ms)))
        .max_lifetime(Some(Duration::from_millis(life_ms)))
        .connect(&cfg.to_url())
        .await
        .with_context(|| format!("Failed to connect to {}:{}/{}", cfg.host, cfg.port, cfg.database))?;
    log::info!("[DB] Connected to {}:{}/{} (pool max {})", cfg.host, cfg.port, cfg.database, max_conn);
    Ok(pool)
}
