pub mod quantity;
pub mod trend;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{EntityId, MatchedRow};

pub use quantity::Quantity;
pub use trend::{Trend, TrendPolicy};

/// Per-entity statistics. Every field except `trend_classification`
/// combines by exact addition or min/max, so partials merge in any order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAggregate {
    pub entity_id: EntityId,
    pub record_count: u64,
    pub quantity_sum: Quantity,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    pub export_country_counts: BTreeMap<String, u64>,
    pub importer_country_counts: BTreeMap<String, u64>,
    pub term_counts: BTreeMap<String, u64>,
    pub year_quantities: BTreeMap<i32, Quantity>,
    pub year_records: BTreeMap<i32, u64>,
    /// Set by [`PartialAggregates::finalize`] only.
    pub trend_classification: Option<Trend>,
}

fn add_counts<K: Ord>(into: &mut BTreeMap<K, u64>, from: BTreeMap<K, u64>) {
    for (k, n) in from { *into.entry(k).or_insert(0) += n; }
}

impl EntityAggregate {
    pub fn empty(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            record_count: 0,
            quantity_sum: Quantity::ZERO,
            min_year: None,
            max_year: None,
            export_country_counts: BTreeMap::new(),
            importer_country_counts: BTreeMap::new(),
            term_counts: BTreeMap::new(),
            year_quantities: BTreeMap::new(),
            year_records: BTreeMap::new(),
            trend_classification: None,
        }
    }

    pub fn observe(&mut self, m: &MatchedRow) {
        let r = &m.row;
        let q = r.quantity.map_or(Quantity::ZERO, Quantity::from_f64);
        self.record_count += 1;
        self.quantity_sum += q;
        self.min_year = Some(self.min_year.map_or(r.year, |y| y.min(r.year)));
        self.max_year = Some(self.max_year.map_or(r.year, |y| y.max(r.year)));
        if !r.exporter.is_empty() { *self.export_country_counts.entry(r.exporter.clone()).or_insert(0) += 1; }
        if !r.importer.is_empty() { *self.importer_country_counts.entry(r.importer.clone()).or_insert(0) += 1; }
        if !r.term.is_empty() { *self.term_counts.entry(r.term.clone()).or_insert(0) += 1; }
        *self.year_quantities.entry(r.year).or_default() += q;
        *self.year_records.entry(r.year).or_insert(0) += 1;
    }

    /// Combines another partial for the same entity into this one.
    pub fn merge(&mut self, other: EntityAggregate) {
        debug_assert_eq!(self.entity_id, other.entity_id);
        self.record_count += other.record_count;
        self.quantity_sum += other.quantity_sum;
        self.min_year = match (self.min_year, other.min_year) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_year = match (self.max_year, other.max_year) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        add_counts(&mut self.export_country_counts, other.export_country_counts);
        add_counts(&mut self.importer_country_counts, other.importer_country_counts);
        add_counts(&mut self.term_counts, other.term_counts);
        add_counts(&mut self.year_records, other.year_records);
        for (y, q) in other.year_quantities { *self.year_quantities.entry(y).or_default() += q; }
        self.trend_classification = None;
    }

    pub fn classify(&mut self, policy: &TrendPolicy) {
        self.trend_classification = match (self.min_year, self.max_year) {
            (Some(lo), Some(hi)) => Some(policy.classify(&self.year_quantities, lo, hi)),
            _ => Some(Trend::Stable),
        };
    }

    /// Exporter with the most records; ties resolved alphabetically.
    pub fn top_exporter(&self) -> Option<(&str, u64)> {
        self.export_country_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(k, n)| (k.as_str(), *n))
    }
}

/// One worker's (or the coordinator's) per-entity map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialAggregates {
    entities: BTreeMap<EntityId, EntityAggregate>,
}

impl PartialAggregates {
    pub fn observe(&mut self, m: &MatchedRow) {
        self.entities
            .entry(m.entity_id.clone())
            .or_insert_with(|| EntityAggregate::empty(m.entity_id.clone()))
            .observe(m);
    }

    pub fn merge(&mut self, other: PartialAggregates) {
        for (id, agg) in other.entities {
            match self.entities.get_mut(&id) {
                Some(existing) => existing.merge(agg),
                None => { self.entities.insert(id, agg); }
            }
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&EntityAggregate> { self.entities.get(id) }

    pub fn len(&self) -> usize { self.entities.len() }

    pub fn is_empty(&self) -> bool { self.entities.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &EntityAggregate> { self.entities.values() }

    /// Derives trend labels once every partial has been merged; the result is ordered by entity id.
    pub fn finalize(self, policy: &TrendPolicy) -> Vec<EntityAggregate> {
        self.entities
            .into_values()
            .map(|mut a| { a.classify(policy); a })
            .collect()
    }
}

impl FromIterator<EntityAggregate> for PartialAggregates {
    fn from_iter<T: IntoIterator<Item = EntityAggregate>>(iter: T) -> Self {
        let mut p = PartialAggregates::default();
        for a in iter {
            p.merge(PartialAggregates { entities: BTreeMap::from([(a.entity_id.clone(), a)]) });
        }
        p
    }
}
