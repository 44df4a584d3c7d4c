mod common;

use trade_subset::aggregate::{PartialAggregates, Quantity, TrendPolicy};
use trade_subset::models::MatchedRow;

use common::matched;

fn corpus() -> Vec<MatchedRow> {
    let exporters = ["CA", "GL", "RU", "US"];
    (0..40u64)
        .map(|i| {
            let entity = if i % 3 == 0 { "african_elephant" } else { "polar_bear" };
            let year = 2010 + (i % 9) as i32;
            let qty = (i % 7) as f64 / 10.0 + 0.01 * (i % 3) as f64;
            matched(entity, (i % 4) as u32 + 1, i, &(year, "x", qty, exporters[(i % 4) as usize], "US"))
        })
        .collect()
}

fn fold(rows: &[MatchedRow]) -> PartialAggregates {
    let mut p = PartialAggregates::default();
    for r in rows { p.observe(r); }
    p
}

#[test]
fn merge_order_does_not_change_result() {
    let rows = corpus();
    let policy = TrendPolicy::default();
    let whole = fold(&rows).finalize(&policy);

    let parts: Vec<PartialAggregates> = rows.chunks(7).map(fold).collect();
    let mut left = PartialAggregates::default();
    for p in parts.iter().cloned() { left.merge(p); }
    let mut right = PartialAggregates::default();
    for p in parts.iter().rev().cloned() { right.merge(p); }
    let mut nested = PartialAggregates::default();
    for pair in parts.chunks(2) {
        let mut inner = PartialAggregates::default();
        for p in pair.iter().cloned() { inner.merge(p); }
        nested.merge(inner);
    }

    assert_eq!(left.finalize(&policy), whole);
    assert_eq!(right.finalize(&policy), whole);
    assert_eq!(nested.finalize(&policy), whole);
}

#[test]
fn every_chunk_permutation_gives_identical_aggregates() {
    let rows = corpus();
    let policy = TrendPolicy::default();
    let whole = fold(&rows).finalize(&policy);
    let parts: Vec<PartialAggregates> = rows.chunks(9).map(fold).collect();
    assert_eq!(parts.len(), 5);

    // Rotations and strides give a spread of orders over all five chunks.
    for start in 0..parts.len() {
        for stride in [1, 2, 3, 4] {
            let mut acc = PartialAggregates::default();
            for k in 0..parts.len() {
                acc.merge(parts[(start + k * stride) % parts.len()].clone());
            }
            assert_eq!(acc.finalize(&policy), whole, "start {} stride {}", start, stride);
        }
    }
}

#[test]
fn totals_match_inputs() {
    let rows = corpus();
    let aggs = fold(&rows).finalize(&TrendPolicy::default());
    let records: u64 = aggs.iter().map(|a| a.record_count).sum();
    assert_eq!(records, rows.len() as u64);
    let qty: Quantity = aggs.iter().map(|a| a.quantity_sum).sum();
    let expected: Quantity = rows.iter().filter_map(|r| r.row.quantity).map(Quantity::from_f64).sum();
    assert_eq!(qty, expected);
    for a in &aggs {
        assert_eq!(a.year_records.values().sum::<u64>(), a.record_count);
        assert_eq!(a.export_country_counts.values().sum::<u64>(), a.record_count);
        assert!(a.trend_classification.is_some());
    }
}
