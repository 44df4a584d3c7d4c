mod common;

use std::sync::Arc;

use trade_subset::aggregate::Trend;
use trade_subset::engine::{
    Checkpointer, ExtractionCoordinator, ExtractionOutput, ExtractionSettings, FileCheckpointer, SharedCheckpointer,
    ShardStatus, StreamControl,
};
use trade_subset::models::EntityId;
use trade_subset::resolver::EntityResolver;
use trade_subset::shard::{discover_shards, ShardSpec};

use common::{config, memory_checkpointer, write_catalog, write_raw, write_shard, HEADER};

fn extract(root: &std::path::Path, checkpointer: SharedCheckpointer, control: &StreamControl) -> ExtractionOutput {
    let cfg = config(root);
    let resolver = Arc::new(EntityResolver::from_csv_path(&cfg.pipeline.entities_path).unwrap());
    let shards = discover_shards(&cfg.pipeline.source_dir, &cfg.pipeline.shard_prefix, &cfg.pipeline.shard_extension).unwrap();
    let coordinator = ExtractionCoordinator::new(ExtractionSettings::from(&cfg.pipeline), resolver, checkpointer, cfg.trend.clone());
    coordinator.run(&shards, control, |_| {}).unwrap()
}

#[test]
fn two_shard_entity_aggregates_and_trend() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    let src = root.join("source");
    write_shard(&src, "trade_db_1.csv", &[
        (2020, "Ursus maritimus", 10.0, "CA", "US"),
        (2021, "Ursus maritimus", 20.0, "CA", "US"),
        (2022, "Thalarctos maritimus", 30.0, "GL", "DK"),
    ]);
    write_shard(&src, "trade_db_2.csv", &[
        (2023, "Ursus maritimus", 40.0, "CA", "JP"),
        (2024, "URSUS  MARITIMUS", 50.0, "CA", "US"),
        (2024, "Panthera leo", 5.0, "ZA", "US"),
    ]);

    let out = extract(root, memory_checkpointer(), &StreamControl::new());
    assert_eq!(out.shards_processed(), 2);
    assert_eq!(out.counts.rows_read, 6);
    assert_eq!(out.counts.matched, 5);
    assert_eq!(out.counts.unmatched, 1);
    assert!(out.counts.is_balanced());
    assert_eq!(out.unmatched.get("Panthera leo"), 1);

    assert_eq!(out.aggregates.len(), 1);
    let bear = &out.aggregates[0];
    assert_eq!(bear.entity_id, EntityId::new("polar_bear"));
    assert_eq!(bear.record_count, 5);
    assert_eq!(bear.quantity_sum.to_string(), "150");
    assert_eq!((bear.min_year, bear.max_year), (Some(2020), Some(2024)));
    assert_eq!(bear.trend_classification, Some(Trend::Increasing));
    assert_eq!(bear.export_country_counts.get("CA"), Some(&4));

    let order: Vec<(u32, u64)> = out.matched.iter().map(|m| (m.row.source_shard, m.row.source_offset)).collect();
    assert_eq!(order, vec![(1, 0), (1, 1), (1, 2), (2, 0), (2, 1)]);
}

#[test]
fn failed_shard_contributes_nothing_and_others_complete() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    let src = root.join("source");
    write_shard(&src, "trade_db_1.csv", &[(2020, "Ursus maritimus", 1.0, "CA", "US")]);
    // No Term column.
    write_raw(&src, "trade_db_2.csv", "Year,Taxon,Quantity,Importer,Exporter,Purpose,Source\n2020,Ursus maritimus,3,US,CA,T,W\n");
    write_shard(&src, "trade_db_3.csv", &[(2021, "Loxodonta africana", 2.0, "KE", "CN")]);

    let out = extract(root, memory_checkpointer(), &StreamControl::new());
    assert_eq!(out.shards.len(), 3);
    assert_eq!(out.shards_processed(), 2);
    assert_eq!(out.shards_failed(), 1);
    let failed = &out.shards[1];
    assert_eq!(failed.status, ShardStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert!(failed.error.as_deref().unwrap_or("").contains("Term"));
    assert_eq!(out.counts.rows_read, 2);
    assert_eq!(out.counts.matched, 2);
    assert!(out.matched.iter().all(|m| m.row.source_shard != 2));
}

#[test]
fn malformed_rows_are_counted_and_threshold_fails_shard() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    let src = root.join("source");
    let good = common::trade_line(&(2020, "Ursus maritimus", 1.0, "CA", "US"));
    // 1 of 20 is exactly the 5% default, which does not exceed it.
    let mut body = format!("{}\n", HEADER);
    for _ in 0..19 { body.push_str(&good); body.push('\n'); }
    body.push_str("not-a-year,II,Ursus maritimus,,,,,skins,1,,US,CA,,T,W,E\n");
    write_raw(&src, "trade_db_1.csv", &body);

    let mut bad = format!("{}\n{}\n", HEADER, good);
    bad.push_str("2020,II,,,,,,skins,1,,US,CA,,T,W,E\n");
    bad.push_str("2020,II,Ursus maritimus,short\n");
    write_raw(&src, "trade_db_2.csv", &bad);

    let out = extract(root, memory_checkpointer(), &StreamControl::new());
    let first = &out.shards[0];
    assert_eq!(first.status, ShardStatus::Completed);
    assert_eq!(first.counts.malformed, 1);
    assert_eq!(first.counts.matched, 19);
    let second = &out.shards[1];
    assert_eq!(second.status, ShardStatus::Failed);
    assert!(second.error.as_deref().unwrap_or("").contains("malformed"));
    assert_eq!(out.counts.rows_read, 20);
    assert!(out.counts.is_balanced());
}

#[test]
fn cancelled_run_interrupts_every_shard() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    let src = root.join("source");
    write_shard(&src, "trade_db_1.csv", &[(2020, "Ursus maritimus", 1.0, "CA", "US")]);
    write_shard(&src, "trade_db_2.csv", &[(2021, "Ursus maritimus", 1.0, "CA", "US")]);

    let control = StreamControl::new();
    control.request_cancel();
    let out = extract(root, memory_checkpointer(), &control);
    assert!(out.cancelled);
    assert_eq!(out.shards_interrupted(), 2);
    assert_eq!(out.shards_processed() + out.shards_failed() + out.shards_interrupted(), 2);
    assert!(out.matched.is_empty());
}

#[test]
fn resumes_from_mid_shard_checkpoint_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    let trades = [
        (2018, "Ursus maritimus", 1.0, "CA", "US"),
        (2019, "Loxodonta africana", 2.0, "KE", "CN"),
        (2020, "Ursus maritimus", 3.0, "CA", "US"),
        (2021, "Panthera leo", 4.0, "ZA", "US"),
        (2022, "Manis temminckii", 5.0, "NG", "VN"),
        (2023, "Ursus maritimus", 6.0, "GL", "DK"),
    ];

    let fresh = {
        let other = tempfile::tempdir().unwrap();
        write_catalog(other.path());
        write_shard(&other.path().join("source"), "trade_db_1.csv", &trades);
        extract(other.path(), memory_checkpointer(), &StreamControl::new())
    };

    // A completed run over the first three rows has the same cursor and row
    // log a crash after row three would have left behind.
    let ckdir = root.join("checkpoints");
    let partial_src = root.join("partial");
    write_shard(&partial_src, "trade_db_1.csv", &trades[..3]);
    let mut cfg = config(root);
    cfg.pipeline.source_dir = partial_src;
    let resolver = Arc::new(EntityResolver::from_csv_path(&cfg.pipeline.entities_path).unwrap());
    let shards = discover_shards(&cfg.pipeline.source_dir, "trade_db_", "csv").unwrap();
    let file_ck: SharedCheckpointer = Arc::new(FileCheckpointer::new(&ckdir));
    ExtractionCoordinator::new(ExtractionSettings::from(&cfg.pipeline), Arc::clone(&resolver), Arc::clone(&file_ck), cfg.trend.clone())
        .run(&shards, &StreamControl::new(), |_| {})
        .unwrap();
    assert_eq!(file_ck.load_rows("test", "trade_db_1.csv").unwrap().len(), 3);

    // Point the checkpoint at the full file, as if it had been read from it.
    let full = write_shard(&root.join("source"), "trade_db_1.csv", &trades);
    let full_spec = ShardSpec { id: shards[0].id.clone(), path: full };
    let token = file_ck.load("test", "trade_db_1.csv").unwrap().unwrap();
    let mut v: serde_json::Value = serde_json::from_str(&token).unwrap();
    assert_eq!(v["cursor"]["row"], 3);
    assert!(v.get("matched").is_none());
    v["complete"] = serde_json::Value::Bool(false);
    v["fingerprint"] = serde_json::to_value(full_spec.fingerprint(resolver.catalog_digest()).unwrap()).unwrap();
    file_ck.save("test", "trade_db_1.csv", &v.to_string()).unwrap();
    // A record appended after the last commit is dropped on load.
    file_ck.append_rows("test", "trade_db_1.csv", "{\"torn\":").unwrap();

    let resumed = extract(root, Arc::clone(&file_ck), &StreamControl::new());
    assert!(resumed.shards[0].resumed);
    assert_eq!(resumed.counts, fresh.counts);
    assert_eq!(resumed.matched, fresh.matched);
    assert_eq!(resumed.aggregates, fresh.aggregates);
    assert_eq!(resumed.unmatched, fresh.unmatched);
    assert_eq!(file_ck.load_rows("test", "trade_db_1.csv").unwrap().len() as u64, fresh.counts.matched);
}

#[test]
fn unchanged_completed_shard_is_not_reread() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    write_shard(&root.join("source"), "trade_db_1.csv", &[(2020, "Ursus maritimus", 1.0, "CA", "US")]);
    let ck = memory_checkpointer();
    let first = extract(root, Arc::clone(&ck), &StreamControl::new());
    assert!(!first.shards[0].resumed);

    let second = extract(root, Arc::clone(&ck), &StreamControl::new());
    assert!(second.shards[0].resumed);
    assert_eq!(second.counts, first.counts);
    assert_eq!(second.matched, first.matched);

    ck.clear("test").unwrap();
    let third = extract(root, ck, &StreamControl::new());
    assert!(!third.shards[0].resumed);
}

#[test]
fn rewritten_shard_is_reread_despite_completed_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    let src = root.join("source");
    write_shard(&src, "trade_db_1.csv", &[(2020, "Ursus maritimus", 1.0, "CA", "US")]);
    let ck = memory_checkpointer();
    let first = extract(root, Arc::clone(&ck), &StreamControl::new());
    assert_eq!(first.counts.matched, 1);

    write_shard(&src, "trade_db_1.csv", &[(2020, "Ursus maritimus", 1.0, "CA", "US"), (2021, "Ursus maritimus", 1.0, "CA", "US")]);
    let second = extract(root, ck, &StreamControl::new());
    assert!(!second.shards[0].resumed);
    assert_eq!(second.counts.matched, 2);
    assert_eq!(second.matched.len(), 2);
}

#[test]
fn catalog_change_invalidates_completed_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_catalog(root);
    write_shard(&root.join("source"), "trade_db_1.csv", &[(2020, "Panthera leo", 3.0, "ZA", "US")]);
    let ck = memory_checkpointer();
    let first = extract(root, Arc::clone(&ck), &StreamControl::new());
    assert_eq!((first.counts.matched, first.counts.unmatched), (0, 1));

    let catalog = root.join("entities.csv");
    let mut text = std::fs::read_to_string(&catalog).unwrap();
    text.push_str("lion,Panthera leo,,Lion\n");
    std::fs::write(&catalog, text).unwrap();

    let second = extract(root, ck, &StreamControl::new());
    assert!(!second.shards[0].resumed);
    assert_eq!((second.counts.matched, second.counts.unmatched), (1, 0));
    assert_eq!(second.aggregates[0].entity_id, EntityId::new("lion"));
}
