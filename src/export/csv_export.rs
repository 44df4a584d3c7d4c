use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use csv::Writer;

use crate::models::MatchedRow;
use crate::report::UnmatchedEntry;

const MATCHED_HEADERS: [&str; 20] = [
    "entity_id", "source_shard", "source_offset", "Year", "Appendix", "Taxon", "Class", "Order", "Family", "Genus",
    "Term", "Quantity", "Unit", "Importer", "Exporter", "Origin", "Purpose", "Source", "Reporter.type", "data_source",
];

fn write_row(w: &mut Writer<File>, m: &MatchedRow, data_source: &str) -> Result<()> {
    let r = &m.row;
    let fields: [&str; 20] = [
        m.entity_id.as_str(),
        &r.source_shard.to_string(),
        &r.source_offset.to_string(),
        &r.year.to_string(),
        &r.appendix,
        &r.taxon,
        &r.class,
        &r.order,
        &r.family,
        &r.genus,
        &r.term,
        &r.quantity.map(|q| q.to_string()).unwrap_or_default(),
        &r.unit,
        &r.importer,
        &r.exporter,
        &r.origin,
        &r.purpose,
        &r.source,
        &r.reporter_type,
        data_source,
    ];
    w.write_record(fields)?;
    Ok(())
}

/// Writes the consolidated matched rows one at a time.
pub struct CsvStreamWriter {
    writer: Writer<File>,
    data_source: String,
    written: u64,
}

impl CsvStreamWriter {
    pub fn create(path: &Path, data_source: &str) -> Result<Self> {
        let mut writer = Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
        writer.write_record(MATCHED_HEADERS)?;
        Ok(Self { writer, data_source: data_source.to_string(), written: 0 })
    }
    pub fn write(&mut self, m: &MatchedRow) -> Result<()> {
        write_row(&mut self.writer, m, &self.data_source)?;
        self.written += 1;
        Ok(())
    }
    pub fn flush_partial(&mut self) -> Result<()> { self.writer.flush()?; Ok(()) }
    pub fn flush(mut self) -> Result<u64> { self.writer.flush()?; Ok(self.written) }
}

pub fn export_matched_csv(rows: &[MatchedRow], path: &Path, data_source: &str) -> Result<u64> {
    let mut w = CsvStreamWriter::create(path, data_source)?;
    for (i, m) in rows.iter().enumerate() {
        w.write(m)?;
        if (i + 1) % 100_000 == 0 { w.flush_partial()?; }
    }
    w.flush()
}

pub fn export_unmatched_csv(entries: &[UnmatchedEntry], path: &Path) -> Result<()> {
    let mut w = Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    w.write_record(["name", "count", "hint"])?;
    for e in entries {
        let fields: [&str; 3] = [&e.name, &e.count.to_string(), e.hint.as_deref().unwrap_or("")];
        w.write_record(fields)?;
    }
    w.flush()?;
    Ok(())
}
