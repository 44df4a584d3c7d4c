use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A tracked taxon as curated outside the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub primary_name: String,
    pub common_name: Option<String>,
    pub synonyms: BTreeSet<String>,
}

impl CanonicalEntity {
    /// The primary name is always a member of the synonym set.
    pub fn new<I, S>(id: impl Into<String>, primary_name: impl Into<String>, synonyms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let primary_name = primary_name.into();
        let mut set: BTreeSet<String> = synonyms
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
        set.insert(primary_name.clone());
        Self { id: EntityId::new(id), primary_name, common_name: None, synonyms: set }
    }

    pub fn with_common_name(mut self, name: impl Into<String>) -> Self {
        self.common_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: u32,
    pub name: String,
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:02}:{}", self.index, self.name) }
}

/// One validated source row. Shape errors never get this far; they are
/// counted as malformed by the shard reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub source_shard: u32,
    pub source_offset: u64,
    pub year: i32,
    pub appendix: String,
    pub taxon: String,
    pub class: String,
    pub order: String,
    pub family: String,
    pub genus: String,
    pub term: String,
    pub quantity: Option<f64>,
    pub unit: String,
    pub importer: String,
    pub exporter: String,
    pub origin: String,
    pub purpose: String,
    pub source: String,
    pub reporter_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOutcome {
    Matched(EntityId),
    Unmatched,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub row: TradeRow,
    pub outcome: MatchOutcome,
    /// Normalized lookup key the resolver was asked about.
    pub matched_name: String,
}

impl MatchResult {
    pub fn into_matched(self) -> Option<MatchedRow> {
        match self.outcome {
            MatchOutcome::Matched(entity_id) => Some(MatchedRow { entity_id, row: self.row }),
            MatchOutcome::Unmatched => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRow {
    pub entity_id: EntityId,
    pub row: TradeRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NaturalKeyField {
    EntityId,
    Year,
    Taxon,
    Appendix,
    Importer,
    Exporter,
    Origin,
    Term,
    Unit,
    Purpose,
    Source,
}

impl NaturalKeyField {
    pub const ALL: [NaturalKeyField; 11] = [
        Self::EntityId, Self::Year, Self::Taxon, Self::Appendix, Self::Importer, Self::Exporter,
        Self::Origin, Self::Term, Self::Unit, Self::Purpose, Self::Source,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityId => "entity_id",
            Self::Year => "year",
            Self::Taxon => "taxon",
            Self::Appendix => "appendix",
            Self::Importer => "importer",
            Self::Exporter => "exporter",
            Self::Origin => "origin",
            Self::Term => "term",
            Self::Unit => "unit",
            Self::Purpose => "purpose",
            Self::Source => "source",
        }
    }

    /// Column name in the staging/production tables.
    pub fn column(&self) -> &'static str { self.as_str() }

    fn value_of(&self, r: &StagingRecord) -> String {
        match self {
            Self::EntityId => r.entity_id.0.clone(),
            Self::Year => r.year.to_string(),
            Self::Taxon => r.taxon.clone(),
            Self::Appendix => r.appendix.clone(),
            Self::Importer => r.importer.clone(),
            Self::Exporter => r.exporter.clone(),
            Self::Origin => r.origin.clone(),
            Self::Term => r.term.clone(),
            Self::Unit => r.unit.clone(),
            Self::Purpose => r.purpose.clone(),
            Self::Source => r.source.clone(),
        }
    }
}

impl FromStr for NaturalKeyField {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == t || (t == "period" && *f == Self::Year) || (t == "source_code" && *f == Self::Source) || (t == "taxon_label" && *f == Self::Taxon))
            .ok_or(ConfigError::UnknownKeyField(s.to_string()))
    }
}

/// Ordered set of fields that identify one real-world transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalKeySpec {
    pub fields: Vec<NaturalKeyField>,
}

impl Default for NaturalKeySpec {
    fn default() -> Self {
        use NaturalKeyField::*;
        Self { fields: vec![EntityId, Year, Taxon, Importer, Exporter, Term, Purpose, Source] }
    }
}

impl NaturalKeySpec {
    /// Parses a comma separated field list such as `entity_id,year,taxon`.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut fields = Vec::new();
        for part in list.split(',').filter(|p| !p.trim().is_empty()) {
            let f: NaturalKeyField = part.parse()?;
            if fields.contains(&f) {
                return Err(ConfigError::DuplicateKeyField(f.as_str().to_string()));
            }
            fields.push(f);
        }
        if fields.is_empty() {
            return Err(ConfigError::MissingField("natural_key"));
        }
        Ok(Self { fields })
    }

    pub fn key_for(&self, record: &StagingRecord) -> NaturalKey {
        NaturalKey(self.fields.iter().map(|f| f.value_of(record)).collect())
    }

    pub fn describe(&self) -> String {
        self.fields.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(pub Vec<String>);

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "({})", self.0.join("|")) }
}

/// A matched row shaped like a production table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    /// Position in the consolidated (shard, offset) order.
    pub load_seq: u64,
    pub entity_id: EntityId,
    pub year: i32,
    pub appendix: String,
    pub taxon: String,
    pub class: String,
    pub order_name: String,
    pub family: String,
    pub genus: String,
    pub importer: String,
    pub exporter: String,
    pub origin: String,
    pub quantity: Option<f64>,
    pub term: String,
    pub unit: String,
    pub purpose: String,
    pub source: String,
    pub data_source: String,
}

impl StagingRecord {
    pub fn from_matched(load_seq: u64, m: &MatchedRow, data_source: &str) -> Self {
        let r = &m.row;
        Self {
            load_seq,
            entity_id: m.entity_id.clone(),
            year: r.year,
            appendix: r.appendix.clone(),
            taxon: r.taxon.clone(),
            class: r.class.clone(),
            order_name: r.order.clone(),
            family: r.family.clone(),
            genus: r.genus.clone(),
            importer: r.importer.clone(),
            exporter: r.exporter.clone(),
            origin: r.origin.clone(),
            quantity: r.quantity,
            term: r.term.clone(),
            unit: r.unit.clone(),
            purpose: r.purpose.clone(),
            source: r.source.clone(),
            data_source: data_source.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    New,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub load_seq: u64,
    pub natural_key: NaturalKey,
    pub disposition: Disposition,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> StagingRecord {
        StagingRecord {
            load_seq: 0, entity_id: EntityId::new("e1"), year: 2020, appendix: "II".into(), taxon: "Ursus maritimus".into(),
            class: "Mammalia".into(), order_name: "Carnivora".into(), family: "Ursidae".into(), genus: "Ursus".into(),
            importer: "US".into(), exporter: "CA".into(), origin: "".into(), quantity: Some(1.0), term: "skins".into(),
            unit: "".into(), purpose: "T".into(), source: "W".into(), data_source: "test".into(),
        }
    }

    #[test]
    fn canonical_entity_contains_primary_name() {
        let e = CanonicalEntity::new("x", "Branta canadensis leucopareia", ["Branta hutchinsii"]);
        assert!(e.synonyms.contains("Branta canadensis leucopareia"));
        assert_eq!(e.synonyms.len(), 2);
    }

    #[test]
    fn key_spec_parse_accepts_aliases_and_rejects_duplicates() {
        let spec = NaturalKeySpec::parse("entity_id, period, taxon_label, source_code").unwrap();
        assert_eq!(spec.fields, vec![NaturalKeyField::EntityId, NaturalKeyField::Year, NaturalKeyField::Taxon, NaturalKeyField::Source]);
        assert!(matches!(NaturalKeySpec::parse("year,year"), Err(ConfigError::DuplicateKeyField(_))));
        assert!(matches!(NaturalKeySpec::parse("year,colour"), Err(ConfigError::UnknownKeyField(_))));
        assert!(NaturalKeySpec::parse(" , ").is_err());
    }

    #[test]
    fn default_key_ignores_quantity_and_data_source() {
        let spec = NaturalKeySpec::default();
        let a = rec();
        let mut b = rec();
        b.quantity = Some(99.0);
        b.data_source = "other".into();
        b.load_seq = 7;
        assert_eq!(spec.key_for(&a), spec.key_for(&b));
        b.importer = "GB".into();
        assert_ne!(spec.key_for(&a), spec.key_for(&b));
    }
}
