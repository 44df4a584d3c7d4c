use std::path::PathBuf;

use thiserror::Error;

use crate::models::{NaturalKey, StagingRecord};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("{field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("unknown natural key field: {0}")]
    UnknownKeyField(String),
    #[error("duplicate natural key field: {0}")]
    DuplicateKeyField(String),
}

/// Failure of a single shard attempt. Retried by the coordinator.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("CSV error on {path}: {source}")]
    Csv { path: PathBuf, #[source] source: csv::Error },
    #[error("{path} is missing required column {column}")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{path}: {malformed} of {read} rows malformed (limit {limit:.2}%)")]
    TooManyMalformed { path: PathBuf, malformed: u64, read: u64, limit: f64 },
    #[error("checkpoint error for {shard}: {detail}")]
    Checkpoint { shard: String, detail: String },
    #[error("worker for {shard} panicked: {detail}")]
    Panicked { shard: String, detail: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("snapshot {0} does not exist")]
    MissingSnapshot(String),
    #[error("insert rejected: {0}")]
    Rejected(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging write failed after {written} rows: {source}")]
    Write { written: u64, #[source] source: StoreError },
    #[error("staging verification failed: expected {expected} rows, found {found}")]
    CountMismatch { expected: u64, found: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("natural key {key} is ambiguous ({} offending rows)", rows.len())]
    Ambiguous { key: NaturalKey, rows: Vec<StagingRecord>, production_matches: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CutoverError {
    #[error("invalid cutover transition from {from} via {action}")]
    InvalidTransition { from: String, action: &'static str },
    #[error("cutover application failed after {attempted} rows; production left unchanged: {source}")]
    Apply { attempted: u64, #[source] source: StoreError },
    #[error("production has {found} rows after cutover, expected {expected}; rollback is available")]
    Verification { expected: u64, found: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("not a decimal quantity: {0:?}")]
    Syntax(String),
    #[error("{0:?} has more than 6 decimal places")]
    Precision(String),
    #[error("{0:?} is out of range")]
    Overflow(String),
}
