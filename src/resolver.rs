use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;

use crate::models::{CanonicalEntity, EntityId};
use crate::normalize::normalize_name;

/// Minimum Jaro-Winkler similarity for a rename hint in the unmatched report.
pub const HINT_MIN_SIMILARITY: f64 = 0.85;

/// A synonym claimed by more than one canonical entity. Such names never resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConflict {
    pub name: String,
    pub entity_ids: Vec<EntityId>,
}

/// Maps current and historical taxon names to canonical entity ids.
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    by_name: HashMap<String, EntityId>,
    ambiguous: BTreeMap<String, BTreeSet<EntityId>>,
    entities: BTreeMap<EntityId, CanonicalEntity>,
    digest: String,
}

/// SHA-256 over every entity id and its synonyms, in id order.
fn catalog_digest(entities: &BTreeMap<EntityId, CanonicalEntity>) -> String {
    let mut hasher = Sha256::new();
    for e in entities.values() {
        hasher.update(e.id.as_str().as_bytes());
        for s in &e.synonyms {
            hasher.update([0x1f]);
            hasher.update(s.as_bytes());
        }
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

impl EntityResolver {
    pub fn new(entities: impl IntoIterator<Item = CanonicalEntity>) -> Self {
        let mut merged: BTreeMap<EntityId, CanonicalEntity> = BTreeMap::new();
        for e in entities {
            match merged.get_mut(&e.id) {
                Some(existing) => {
                    log::warn!("[Resolver] entity {} listed twice; merging synonyms", e.id);
                    existing.synonyms.extend(e.synonyms);
                }
                None => { merged.insert(e.id.clone(), e); }
            }
        }

        let mut claims: HashMap<String, BTreeSet<EntityId>> = HashMap::new();
        for e in merged.values() {
            for s in &e.synonyms {
                let key = normalize_name(s);
                if key.is_empty() { continue; }
                claims.entry(key).or_default().insert(e.id.clone());
            }
        }
        let mut by_name = HashMap::with_capacity(claims.len());
        let mut ambiguous = BTreeMap::new();
        for (name, ids) in claims {
            if ids.len() == 1 {
                if let Some(id) = ids.into_iter().next() { by_name.insert(name, id); }
            } else {
                log::warn!("[Resolver] synonym '{}' claimed by {} entities; it will not resolve", name, ids.len());
                ambiguous.insert(name, ids);
            }
        }
        let digest = catalog_digest(&merged);
        Self { by_name, ambiguous, entities: merged, digest }
    }

    /// Loads `entity_id,primary_name,synonyms[,common_name]` where synonyms are `|` separated.
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        #[derive(Deserialize)]
        struct CatalogRow {
            entity_id: String,
            primary_name: String,
            #[serde(default)]
            synonyms: String,
            #[serde(default)]
            common_name: Option<String>,
        }
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Failed to open entity catalog {}", path.display()))?;
        let mut entities = Vec::new();
        for (i, row) in rdr.deserialize::<CatalogRow>().enumerate() {
            let row = row.with_context(|| format!("Invalid catalog row {} in {}", i + 1, path.display()))?;
            let mut e = CanonicalEntity::new(row.entity_id, row.primary_name, row.synonyms.split('|').map(str::trim));
            if let Some(c) = row.common_name.filter(|c| !c.is_empty()) { e = e.with_common_name(c); }
            entities.push(e);
        }
        let resolver = Self::new(entities);
        log::info!("[Resolver] Loaded {} entities, {} names ({} ambiguous) from {}",
            resolver.entities.len(), resolver.by_name.len(), resolver.ambiguous.len(), path.display());
        Ok(resolver)
    }

    /// Exact lookup on the normalized name. Ambiguous and unknown names are `None`.
    pub fn resolve(&self, name: &str) -> Option<&EntityId> {
        self.by_name.get(&normalize_name(name))
    }

    /// Like [`resolve`](Self::resolve) but records misses under the literal input.
    pub fn resolve_counted(&self, name: &str, unmatched: &mut UnmatchedNames) -> Option<&EntityId> {
        let hit = self.resolve(name);
        if hit.is_none() { unmatched.record(name); }
        hit
    }

    /// Changes whenever an entity or synonym is added, removed or renamed.
    pub fn catalog_digest(&self) -> &str { &self.digest }

    pub fn entity(&self, id: &EntityId) -> Option<&CanonicalEntity> { self.entities.get(id) }

    pub fn entities(&self) -> impl Iterator<Item = &CanonicalEntity> { self.entities.values() }

    pub fn len(&self) -> usize { self.entities.len() }

    pub fn is_empty(&self) -> bool { self.entities.is_empty() }

    pub fn conflicts(&self) -> Vec<CatalogConflict> {
        self.ambiguous
            .iter()
            .map(|(name, ids)| CatalogConflict { name: name.clone(), entity_ids: ids.iter().cloned().collect() })
            .collect()
    }

    /// Closest known synonym for an unresolved name. Only ever used as a hint in reports.
    pub fn nearest_synonym(&self, name: &str) -> Option<(String, f64)> {
        let needle = normalize_name(name);
        if needle.is_empty() { return None; }
        let mut best: Option<(&CanonicalEntity, &String, f64)> = None;
        for e in self.entities.values() {
            for s in &e.synonyms {
                let score = jaro_winkler(&needle, &normalize_name(s));
                if best.map_or(true, |(_, _, b)| score > b) { best = Some((e, s, score)); }
            }
        }
        best.filter(|(_, _, score)| *score >= HINT_MIN_SIMILARITY)
            .map(|(e, s, score)| (format!("{} ({})", s, e.id), score))
    }
}

/// Per-worker counter of names that failed to resolve, keyed by the literal input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedNames {
    counts: BTreeMap<String, u64>,
}

impl UnmatchedNames {
    pub fn record(&mut self, name: &str) { *self.counts.entry(name.to_string()).or_insert(0) += 1; }

    pub fn merge(&mut self, other: UnmatchedNames) {
        for (name, n) in other.counts { *self.counts.entry(name).or_insert(0) += n; }
    }

    pub fn get(&self, name: &str) -> u64 { self.counts.get(name).copied().unwrap_or(0) }

    pub fn total(&self) -> u64 { self.counts.values().sum() }

    pub fn distinct(&self) -> usize { self.counts.len() }

    /// Highest counts first; ties broken by name for stable output.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut v: Vec<(String, u64)> = self.counts.iter().map(|(k, c)| (k.clone(), *c)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        v.truncate(n);
        v
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> { self.counts.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> EntityResolver {
        EntityResolver::new(vec![
            CanonicalEntity::new("goose", "Branta canadensis leucopareia", ["Branta canadensis leucopareia"]),
            CanonicalEntity::new("bear", "Ursus maritimus", ["Thalarctos maritimus"]),
            CanonicalEntity::new("narwhal", "Monodon monoceros", ["Shared name"]),
            CanonicalEntity::new("beluga", "Delphinapterus leucas", ["Shared name"]),
        ])
    }

    #[test]
    fn resolves_primary_and_historical_names() {
        let r = resolver();
        assert_eq!(r.resolve("Ursus maritimus").map(|e| e.as_str()), Some("bear"));
        assert_eq!(r.resolve("  thalarctos   MARITIMUS ").map(|e| e.as_str()), Some("bear"));
    }

    #[test]
    fn unknown_name_is_counted_literally() {
        let r = resolver();
        let mut u = UnmatchedNames::default();
        assert!(r.resolve_counted("Branta hutchinsii leucopareia", &mut u).is_none());
        assert!(r.resolve_counted("Branta hutchinsii leucopareia", &mut u).is_none());
        assert!(r.resolve_counted("Branta canadensis leucopareia", &mut u).is_some());
        assert_eq!(u.get("Branta hutchinsii leucopareia"), 2);
        assert_eq!(u.total(), 2);
    }

    #[test]
    fn accented_spelling_resolves_to_plain_synonym() {
        let r = EntityResolver::new(vec![CanonicalEntity::new("pangolin", "Manis temminckii", ["Smutsia temminckii"])]);
        assert_eq!(r.resolve("Smutsia temminckií").map(|e| e.as_str()), Some("pangolin"));
        assert_eq!(r.resolve("MANIS TEMMÍNCKII").map(|e| e.as_str()), Some("pangolin"));
    }

    #[test]
    fn catalog_digest_follows_synonym_changes() {
        let base = resolver();
        assert_eq!(base.catalog_digest(), resolver().catalog_digest());
        assert_eq!(base.catalog_digest().len(), 64);
        let mut entities: Vec<CanonicalEntity> = base.entities().cloned().collect();
        entities.reverse();
        assert_eq!(EntityResolver::new(entities.clone()).catalog_digest(), base.catalog_digest());
        entities.push(CanonicalEntity::new("lion", "Panthera leo", Vec::<String>::new()));
        assert_ne!(EntityResolver::new(entities).catalog_digest(), base.catalog_digest());
    }

    #[test]
    fn ambiguous_synonym_fails_closed() {
        let r = resolver();
        assert!(r.resolve("Shared name").is_none());
        let conflicts = r.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity_ids.len(), 2);
        assert!(r.resolve("Monodon monoceros").is_some());
    }

    #[test]
    fn nearest_synonym_hint_for_renamed_taxon() {
        let r = resolver();
        let (hint, score) = r.nearest_synonym("Branta hutchinsii leucopareia").unwrap();
        assert!(hint.contains("goose"));
        assert!(score >= HINT_MIN_SIMILARITY);
        assert!(r.nearest_synonym("Homo sapiens").is_none());
    }

    #[test]
    fn unmatched_top_orders_by_count_then_name() {
        let mut a = UnmatchedNames::default();
        a.record("b"); a.record("a"); a.record("c"); a.record("c");
        let mut b = UnmatchedNames::default();
        b.record("a");
        a.merge(b);
        assert_eq!(a.top(2), vec![("a".to_string(), 2), ("c".to_string(), 2)]);
        assert_eq!(a.distinct(), 3);
    }
}
