pub mod aggregate;
pub mod cli;
pub mod config;
pub mod cutover;
pub mod db;
pub mod engine;
pub mod error;
pub mod export;
pub mod matching;
pub mod merge;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod shard;
pub mod staging;
