//! Runs against a live MySQL named by DB_HOST/DB_PORT/DB_USER/DB_PASSWORD/DB_NAME.
//! `cargo test -- --ignored` to include.

mod common;

use std::sync::atomic::AtomicBool;

use trade_subset::config::DatabaseConfig;
use trade_subset::cutover::{CutoverController, CutoverMode, CutoverState};
use trade_subset::db::{make_pool, MySqlTradeStore, TradeStore};
use trade_subset::merge::MergePlanner;
use trade_subset::models::NaturalKeySpec;
use trade_subset::staging::{build_staging_records, StagingLoader};

use common::matched;

fn db_from_env() -> DatabaseConfig {
    let var = |k: &str, d: &str| std::env::var(k).unwrap_or_else(|_| d.to_string());
    DatabaseConfig {
        host: var("DB_HOST", "127.0.0.1"),
        port: var("DB_PORT", "3306").parse().unwrap(),
        username: var("DB_USER", "root"),
        password: var("DB_PASSWORD", ""),
        database: var("DB_NAME", "trade_subset_test"),
    }
}

#[tokio::test]
#[ignore]
async fn mysql_stage_plan_cutover_and_rollback() {
    let store = MySqlTradeStore::new(make_pool(&db_from_env()).await.unwrap());
    let (staging, prod) = ("it_trade_staging", "it_trade_records");
    for t in [staging, prod, "it_trade_records_snap_it1"] { store.drop_table(t).await.unwrap(); }
    let spec = NaturalKeySpec::default();
    let rows: Vec<_> = (0..5).map(|i| matched("polar_bear", 1, i, &(2019 + i as i32, "Ursus maritimus", 1.5, "CA", "US"))).collect();

    store.ensure_table(prod).await.unwrap();
    store.insert_batch(prod, &build_staging_records(&rows[..2], &spec, "it").0).await.unwrap();

    let summary = StagingLoader::new(&store, staging, &spec, 2, "it").load(&rows, |_| {}).await.unwrap();
    assert_eq!(summary.written, 5);
    let plan = MergePlanner::new(&store, staging, prod, &spec, 2).plan().await.unwrap();
    assert_eq!((plan.new_count(), plan.duplicate_count()), (3, 2));
    // The default key index comes with the table; a narrower key gets its own.
    store.ensure_key_index(prod, &spec).await.unwrap();
    store.ensure_key_index(prod, &NaturalKeySpec::parse("entity_id,year").unwrap()).await.unwrap();

    let cancel = AtomicBool::new(false);
    let mut c = CutoverController::new(&store, prod, CutoverMode::Append, 2, "it1");
    c.run(&plan.new_rows, &cancel).await.unwrap();
    assert_eq!(store.count(prod).await.unwrap(), 5);
    let per_entity = store.entity_summary(prod).await.unwrap();
    assert_eq!(per_entity.len(), 1);
    assert_eq!((per_entity[0].rows, per_entity[0].min_year, per_entity[0].max_year), (5, Some(2019), Some(2023)));
    c.rollback().await.unwrap();
    assert_eq!(c.state(), CutoverState::RolledBack);
    assert_eq!(store.count(prod).await.unwrap(), 2);

    for t in [staging, prod] { store.drop_table(t).await.unwrap(); }
}
