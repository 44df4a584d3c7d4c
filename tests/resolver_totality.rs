mod common;

use trade_subset::resolver::{EntityResolver, UnmatchedNames};

#[test]
fn every_synonym_resolves_like_its_primary_name() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = EntityResolver::from_csv_path(&common::write_catalog(dir.path())).unwrap();
    assert_eq!(resolver.len(), 3);
    for e in resolver.entities() {
        let primary = resolver.resolve(&e.primary_name);
        assert_eq!(primary, Some(&e.id));
        for s in &e.synonyms {
            assert_eq!(resolver.resolve(s), primary, "synonym {}", s);
            assert_eq!(resolver.resolve(&s.to_uppercase()), primary);
        }
    }
    assert!(resolver.conflicts().is_empty());
}

#[test]
fn subspecies_rename_is_not_guessed() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write_raw(
        dir.path(),
        "geese.csv",
        "entity_id,primary_name,synonyms\naleutian_goose,Branta canadensis leucopareia,Branta canadensis leucopareia\n",
    );
    let resolver = EntityResolver::from_csv_path(&path).unwrap();
    let mut unmatched = UnmatchedNames::default();
    assert!(resolver.resolve_counted("Branta hutchinsii leucopareia", &mut unmatched).is_none());
    assert_eq!(
        resolver.resolve_counted("Branta canadensis leucopareia", &mut unmatched).map(|e| e.as_str()),
        Some("aleutian_goose")
    );
    assert_eq!(unmatched.get("Branta hutchinsii leucopareia"), 1);
}

#[test]
fn shared_synonym_in_catalog_file_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write_raw(
        dir.path(),
        "dup.csv",
        "entity_id,primary_name,synonyms\nnarwhal,Monodon monoceros,Sea unicorn\nbeluga,Delphinapterus leucas,Sea unicorn|White whale\n",
    );
    let resolver = EntityResolver::from_csv_path(&path).unwrap();
    assert!(resolver.resolve("Sea unicorn").is_none());
    assert!(resolver.resolve("white whale").is_some());
    assert_eq!(resolver.conflicts()[0].name, "sea unicorn");
}
