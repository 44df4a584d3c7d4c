pub mod csv_export;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::aggregate::EntityAggregate;
use crate::models::MatchedRow;
use crate::report::UnmatchedEntry;

pub use csv_export::{export_matched_csv, export_unmatched_csv, CsvStreamWriter};

pub fn export_aggregates_json(aggregates: &[EntityAggregate], path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(aggregates).context("Failed to serialize aggregates")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub matched: PathBuf,
    pub unmatched: PathBuf,
    pub aggregates: PathBuf,
}

impl ExportPaths {
    pub fn in_dir(dir: &Path, run_id: &str) -> Self {
        Self {
            matched: dir.join(format!("matched_{}.csv", run_id)),
            unmatched: dir.join(format!("unmatched_{}.csv", run_id)),
            aggregates: dir.join(format!("aggregates_{}.json", run_id)),
        }
    }
}

/// Writes the three extraction artifacts under `dir`.
pub fn export_all(dir: &Path, run_id: &str, matched: &[MatchedRow], unmatched: &[UnmatchedEntry], aggregates: &[EntityAggregate], data_source: &str) -> Result<ExportPaths> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output dir {}", dir.display()))?;
    let paths = ExportPaths::in_dir(dir, run_id);
    let n = export_matched_csv(matched, &paths.matched, data_source)?;
    export_unmatched_csv(unmatched, &paths.unmatched)?;
    export_aggregates_json(aggregates, &paths.aggregates)?;
    log::info!("[Export] {} matched rows -> {}", n, paths.matched.display());
    Ok(paths)
}
