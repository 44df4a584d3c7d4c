use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::aggregate::TrendPolicy;
use crate::config::{AppConfig, DatabaseConfig, PipelineConfig};
use crate::cutover::CutoverMode;
use crate::engine::pool::default_worker_count;
use crate::error::ConfigError;
use crate::models::NaturalKeySpec;

#[derive(Parser, Debug)]
#[command(name = "trade_subset", version, about = "Extract, aggregate and merge a tracked-taxa subset of a sharded trade corpus", disable_help_subcommand = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract, aggregate and export only; no database access
    Extract(ExtractArgs),
    /// Extract, stage, plan and cut over into production
    Run(RunArgs),
    /// Restore production from the snapshot recorded in a run report
    Rollback(OperatorArgs),
    /// Accept an applied cutover and drop its snapshot
    Confirm(OperatorArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// Directory holding the shard files
    #[arg(long, value_name = "DIR", env = "TRADE_SUBSET_SOURCE_DIR")]
    pub source_dir: PathBuf,
    /// Canonical entity catalog (CSV: entity_id,primary_name,synonyms[,common_name])
    #[arg(long, value_name = "PATH", env = "TRADE_SUBSET_ENTITIES")]
    pub entities: PathBuf,
    #[arg(long, default_value = "trade_db_")]
    pub shard_prefix: String,
    #[arg(long, default_value = "csv")]
    pub shard_extension: String,
    /// Worker threads (env: TRADE_SUBSET_WORKERS)
    #[arg(long, env = "TRADE_SUBSET_WORKERS")]
    pub workers: Option<usize>,
    /// Rows per read batch and checkpoint (env: TRADE_SUBSET_BATCH_SIZE)
    #[arg(long, env = "TRADE_SUBSET_BATCH_SIZE", default_value_t = 50_000)]
    pub batch_size: usize,
    /// Retries per shard after the first failure (env: TRADE_SUBSET_RETRIES)
    #[arg(long, env = "TRADE_SUBSET_RETRIES", default_value_t = 2)]
    pub retries: u32,
    /// Fraction of malformed rows above which a shard fails
    #[arg(long, default_value_t = 0.05)]
    pub max_malformed_ratio: f64,
    #[arg(long, default_value = ".trade_subset/checkpoints")]
    pub checkpoint_dir: PathBuf,
    /// Checkpoint namespace; reusing it resumes the previous run
    #[arg(long, default_value = "default")]
    pub job: String,
    /// Discard existing checkpoints for the job before starting
    #[arg(long)]
    pub fresh: bool,
    #[arg(long, default_value = "out")]
    pub output_dir: PathBuf,
    #[arg(long, default_value_t = 25)]
    pub top_unmatched: usize,
    #[arg(long, default_value = "CITES v2025.1")]
    pub data_source_label: String,
    /// Relative change between early and late windows that counts as a trend
    #[arg(long, default_value_t = 0.20)]
    pub trend_threshold: f64,
    /// Fraction of the year span used for each trend window
    #[arg(long, default_value_t = 1.0 / 3.0)]
    pub trend_window: f64,
    /// Spans shorter than this are always stable
    #[arg(long, default_value_t = 3)]
    pub trend_min_span: u32,
}

#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    /// DB host (env: DB_HOST)
    #[arg(long = "db-host", env = "DB_HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// DB port (env: DB_PORT)
    #[arg(long = "db-port", env = "DB_PORT", default_value_t = 3306)]
    pub port: u16,
    /// DB user (env: DB_USER)
    #[arg(long = "db-user", env = "DB_USER")]
    pub user: String,
    /// DB password (env: DB_PASSWORD or DB_PASS)
    #[arg(long = "db-password", env = "DB_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,
    /// Database name (env: DB_NAME)
    #[arg(long = "db-name", env = "DB_NAME")]
    pub database: String,
}

impl DbArgs {
    pub fn to_database_config(&self) -> Result<DatabaseConfig, ConfigError> {
        let password = if self.password.is_empty() {
            std::env::var("DB_PASS").unwrap_or_default()
        } else {
            self.password.clone()
        };
        let cfg = DatabaseConfig { username: self.user.clone(), password, host: self.host.clone(), port: self.port, database: self.database.clone() };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub extract: ExtractArgs,
    #[command(flatten)]
    pub db: DbArgs,
    #[arg(long, default_value = "trade_records_staging")]
    pub staging_table: String,
    #[arg(long, default_value = "trade_records")]
    pub production_table: String,
    #[arg(long, default_value_t = 5_000)]
    pub write_batch_size: usize,
    #[arg(long, default_value_t = 1_000)]
    pub apply_batch_size: usize,
    /// Comma-separated natural key fields
    #[arg(long, default_value = "entity_id,year,taxon,importer,exporter,term,purpose,source")]
    pub natural_key: String,
    #[arg(long, value_enum, default_value_t = CutoverMode::Append)]
    pub mode: CutoverMode,
    /// Stage and plan, but leave production untouched
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Report written by the run whose cutover is acted on
    #[arg(long, value_name = "PATH")]
    pub report: PathBuf,
    #[command(flatten)]
    pub db: DbArgs,
}

impl ExtractArgs {
    fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            source_dir: self.source_dir.clone(),
            shard_prefix: self.shard_prefix.clone(),
            shard_extension: self.shard_extension.clone(),
            entities_path: self.entities.clone(),
            workers: self.workers.unwrap_or_else(default_worker_count),
            batch_size: self.batch_size,
            retry_limit: self.retries,
            max_malformed_ratio: self.max_malformed_ratio,
            checkpoint_dir: self.checkpoint_dir.clone(),
            job_name: self.job.clone(),
            output_dir: self.output_dir.clone(),
            top_unmatched: self.top_unmatched,
            data_source_label: self.data_source_label.clone(),
            ..PipelineConfig::default()
        }
    }

    fn trend(&self) -> TrendPolicy {
        TrendPolicy { threshold: self.trend_threshold, window_fraction: self.trend_window, min_span_years: self.trend_min_span }
    }

    pub fn to_app_config(&self) -> Result<AppConfig, ConfigError> {
        let cfg = AppConfig { pipeline: self.pipeline(), trend: self.trend(), ..AppConfig::default() };
        cfg.validate_offline()?;
        Ok(cfg)
    }
}

impl RunArgs {
    pub fn to_app_config(&self) -> Result<AppConfig, ConfigError> {
        let mut pipeline = self.extract.pipeline();
        pipeline.staging_table = self.staging_table.clone();
        pipeline.production_table = self.production_table.clone();
        pipeline.write_batch_size = self.write_batch_size;
        pipeline.apply_batch_size = self.apply_batch_size;
        pipeline.cutover_mode = self.mode;
        pipeline.dry_run = self.dry_run;
        let cfg = AppConfig {
            database: self.db.to_database_config()?,
            pipeline,
            trend: self.extract.trend(),
            natural_key: NaturalKeySpec::parse(&self.natural_key)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_build_validated_config() {
        let cli = Cli::try_parse_from([
            "trade_subset", "run", "--source-dir", "src", "--entities", "e.csv", "--db-user", "u", "--db-name", "trade",
            "--mode", "swap", "--dry-run", "--natural-key", "year,taxon,exporter", "--workers", "3",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else { panic!("expected run") };
        let cfg = args.to_app_config().unwrap();
        assert_eq!(cfg.pipeline.cutover_mode, CutoverMode::Swap);
        assert!(cfg.pipeline.dry_run);
        assert_eq!(cfg.pipeline.workers, 3);
        assert_eq!(cfg.natural_key.fields.len(), 3);
    }

    #[test]
    fn unknown_key_field_is_a_config_error() {
        let cli = Cli::try_parse_from([
            "trade_subset", "run", "--source-dir", "s", "--entities", "e.csv", "--db-user", "u", "--db-name", "trade",
            "--natural-key", "year,colour",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else { panic!("expected run") };
        assert!(matches!(args.to_app_config(), Err(ConfigError::UnknownKeyField(_))));
    }
}
