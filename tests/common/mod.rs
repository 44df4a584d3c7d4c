#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use trade_subset::config::AppConfig;
use trade_subset::engine::{MemoryCheckpointer, SharedCheckpointer};
use trade_subset::models::{EntityId, MatchedRow, TradeRow};

pub const HEADER: &str = "Year,Appendix,Taxon,Class,Order,Family,Genus,Term,Quantity,Unit,Importer,Exporter,Origin,Purpose,Source,Reporter.type";

/// (year, taxon, quantity, exporter, importer)
pub type Trade<'a> = (i32, &'a str, f64, &'a str, &'a str);

pub fn trade_line(t: &Trade) -> String {
    let (year, taxon, qty, exporter, importer) = t;
    format!("{},II,{},Mammalia,Carnivora,Ursidae,Ursus,skins,{},,{},{},,T,W,E", year, taxon, qty, importer, exporter)
}

pub fn write_shard(dir: &Path, name: &str, trades: &[Trade]) -> PathBuf {
    let mut body = String::from(HEADER);
    body.push('\n');
    for t in trades {
        body.push_str(&trade_line(t));
        body.push('\n');
    }
    write_raw(dir, name, &body)
}

pub fn write_raw(dir: &Path, name: &str, body: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

pub fn write_catalog(dir: &Path) -> PathBuf {
    write_raw(
        dir,
        "entities.csv",
        "entity_id,primary_name,synonyms,common_name\n\
         polar_bear,Ursus maritimus,Thalarctos maritimus,Polar bear\n\
         african_elephant,Loxodonta africana,,African elephant\n\
         pangolin,Manis temminckii,Smutsia temminckii,Ground pangolin\n",
    )
}

/// Offline config rooted in `root`: shards under `root/source`, artifacts under `root/out`.
pub fn config(root: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.pipeline.source_dir = root.join("source");
    cfg.pipeline.entities_path = root.join("entities.csv");
    cfg.pipeline.checkpoint_dir = root.join("checkpoints");
    cfg.pipeline.output_dir = root.join("out");
    cfg.pipeline.workers = 2;
    cfg.pipeline.batch_size = 2;
    cfg.pipeline.retry_limit = 1;
    cfg.pipeline.write_batch_size = 2;
    cfg.pipeline.apply_batch_size = 2;
    cfg.pipeline.job_name = "test".into();
    cfg
}

pub fn memory_checkpointer() -> SharedCheckpointer {
    Arc::new(MemoryCheckpointer::default())
}

pub fn matched(entity: &str, shard: u32, offset: u64, t: &Trade) -> MatchedRow {
    let (year, taxon, qty, exporter, importer) = *t;
    MatchedRow {
        entity_id: EntityId::new(entity),
        row: TradeRow {
            source_shard: shard,
            source_offset: offset,
            year,
            appendix: "II".into(),
            taxon: taxon.into(),
            class: String::new(),
            order: String::new(),
            family: String::new(),
            genus: String::new(),
            term: "skins".into(),
            quantity: Some(qty),
            unit: String::new(),
            importer: importer.into(),
            exporter: exporter.into(),
            origin: String::new(),
            purpose: "T".into(),
            source: "W".into(),
            reporter_type: "E".into(),
        },
    }
}
