use unicode_normalization::UnicodeNormalization;

/// Lookup form of a taxon name: diacritics removed, lowercased, trimmed,
/// inner whitespace runs collapsed to a single space. No other folding is
/// applied; resolution stays an exact match on this form.
pub fn normalize_name(input: &str) -> String {
    let folded: String = input
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Categorical source fields (country, term, purpose codes) are kept as
/// written apart from surrounding whitespace.
pub fn clean_field(input: &str) -> String {
    input.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_name_case_and_whitespace() {
        assert_eq!(normalize_name("  Ursus   maritimus "), "ursus maritimus");
        assert_eq!(normalize_name("BRANTA canadensis\tleucopareia"), "branta canadensis leucopareia");
    }

    #[test]
    fn normalize_name_diacritics() {
        assert_eq!(normalize_name("Phocœna phocœna"), "phocœna phocœna");
        assert_eq!(normalize_name("Rangifer tarandus caribou Gmelin, 1788 É"), "rangifer tarandus caribou gmelin, 1788 e");
    }

    #[test]
    fn normalize_name_keeps_distinct_epithets_distinct() {
        assert_ne!(normalize_name("Branta hutchinsii leucopareia"), normalize_name("Branta canadensis leucopareia"));
    }

    #[test]
    fn clean_field_trims_only() {
        assert_eq!(clean_field(" US "), "US");
        assert_eq!(clean_field("live"), "live");
    }
}
