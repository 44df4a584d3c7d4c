use crate::models::{MatchOutcome, MatchResult, MatchedRow, TradeRow};
use crate::normalize::normalize_name;
use crate::resolver::{EntityResolver, UnmatchedNames};

/// Routes each row to its canonical entity by the `Taxon` field. The only
/// side effect is the caller-owned unmatched counter.
pub struct MatchFilter<'a> {
    resolver: &'a EntityResolver,
}

impl<'a> MatchFilter<'a> {
    pub fn new(resolver: &'a EntityResolver) -> Self { Self { resolver } }

    pub fn filter(&self, row: TradeRow, unmatched: &mut UnmatchedNames) -> MatchResult {
        let matched_name = normalize_name(&row.taxon);
        let outcome = match self.resolver.resolve_counted(&row.taxon, unmatched) {
            Some(id) => MatchOutcome::Matched(id.clone()),
            None => MatchOutcome::Unmatched,
        };
        MatchResult { row, outcome, matched_name }
    }

    /// Splits a batch into matched rows (file order kept) and a count of misses.
    pub fn partition(&self, rows: impl IntoIterator<Item = TradeRow>, unmatched: &mut UnmatchedNames) -> (Vec<MatchedRow>, u64) {
        let mut hits = Vec::new();
        let mut misses = 0u64;
        for row in rows {
            match self.filter(row, unmatched).into_matched() {
                Some(m) => hits.push(m),
                None => misses += 1,
            }
        }
        (hits, misses)
    }
}
