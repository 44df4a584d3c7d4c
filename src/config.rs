use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::aggregate::TrendPolicy;
use crate::cutover::CutoverMode;
use crate::db::validate_ident;
use crate::engine::pool::default_worker_count;
use crate::error::ConfigError;
use crate::models::NaturalKeySpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl DatabaseConfig {
    pub fn to_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.database
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() { return Err(ConfigError::MissingField("database.host")); }
        if self.username.trim().is_empty() { return Err(ConfigError::MissingField("database.username")); }
        if self.database.trim().is_empty() { return Err(ConfigError::MissingField("database.database")); }
        if self.port == 0 {
            return Err(ConfigError::OutOfRange { field: "database.port", detail: "0".into() });
        }
        validate_ident(&self.database)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { username: String::new(), password: String::new(), host: "127.0.0.1".into(), port: 3306, database: String::new() }
    }
}

/// Operator controls for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub shard_prefix: String,
    pub shard_extension: String,
    pub entities_path: PathBuf,
    pub workers: usize,
    /// Rows read per batch; also the checkpoint granularity.
    pub batch_size: usize,
    /// Extra attempts after the first failure of a shard.
    pub retry_limit: u32,
    pub max_malformed_ratio: f64,
    pub checkpoint_dir: PathBuf,
    pub job_name: String,
    pub staging_table: String,
    pub production_table: String,
    pub write_batch_size: usize,
    pub apply_batch_size: usize,
    pub data_source_label: String,
    pub top_unmatched: usize,
    pub cutover_mode: CutoverMode,
    pub dry_run: bool,
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("data/source"),
            shard_prefix: "trade_db_".into(),
            shard_extension: "csv".into(),
            entities_path: PathBuf::from("data/entities.csv"),
            workers: default_worker_count(),
            batch_size: 50_000,
            retry_limit: 2,
            max_malformed_ratio: 0.05,
            checkpoint_dir: PathBuf::from(".trade_subset/checkpoints"),
            job_name: "default".into(),
            staging_table: "trade_records_staging".into(),
            production_table: "trade_records".into(),
            write_batch_size: 5_000,
            apply_batch_size: 1_000,
            data_source_label: "CITES v2025.1".into(),
            top_unmatched: 25,
            cutover_mode: CutoverMode::Append,
            dry_run: false,
            output_dir: PathBuf::from("out"),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, v: usize) -> Result<(), ConfigError> {
            if v == 0 { Err(ConfigError::OutOfRange { field, detail: "must be > 0".into() }) } else { Ok(()) }
        }
        positive("workers", self.workers)?;
        positive("batch_size", self.batch_size)?;
        positive("write_batch_size", self.write_batch_size)?;
        positive("apply_batch_size", self.apply_batch_size)?;
        if !(0.0..=1.0).contains(&self.max_malformed_ratio) {
            return Err(ConfigError::OutOfRange { field: "max_malformed_ratio", detail: self.max_malformed_ratio.to_string() });
        }
        if self.job_name.trim().is_empty() { return Err(ConfigError::MissingField("job_name")); }
        if !self.job_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
            return Err(ConfigError::InvalidIdentifier(self.job_name.clone()));
        }
        validate_ident(&self.staging_table)?;
        validate_ident(&self.production_table)?;
        if self.staging_table == self.production_table {
            return Err(ConfigError::OutOfRange { field: "staging_table", detail: "must differ from production_table".into() });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub trend: TrendPolicy,
    pub natural_key: NaturalKeySpec,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.validate_offline()
    }

    /// Everything except the database connection, for extraction-only runs.
    pub fn validate_offline(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        self.trend.validate()?;
        if self.natural_key.fields.is_empty() {
            return Err(ConfigError::MissingField("natural_key"));
        }
        let mut seen = std::collections::HashSet::new();
        for f in &self.natural_key.fields {
            if !seen.insert(*f) { return Err(ConfigError::DuplicateKeyField(f.as_str().to_string())); }
        }
        Ok(())
    }
}
