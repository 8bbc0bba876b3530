//! Channel-list name -> guide display-name matching
//!
//! Playlist names rarely match guide names exactly ("CA: CBC TORONTO" vs
//! "CBC Toronto (CBLT-DT)"), so lookups fall through three tiers:
//! exact, normalized, containment. The first tier that hits wins.
//!
//! Within a tier, candidates are visited in ascending display-name order,
//! so the result is deterministic for a given store.

use crate::epg::store::GuideStore;
use crate::models::Program;

/// Which heuristic tier produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    Exact,
    Normalized,
    Containment,
}

impl MatchTier {
    /// Short label for diagnostics
    pub fn label(&self) -> &'static str {
        match self {
            MatchTier::Exact => "exact",
            MatchTier::Normalized => "normalized",
            MatchTier::Containment => "contains",
        }
    }
}

/// A resolved guide channel for a query name
#[derive(Debug, Clone, Copy)]
pub struct ChannelMatch<'a> {
    pub tier: MatchTier,
    /// Display-name key in the guide
    pub key: &'a str,
    pub programs: &'a [Program],
}

/// Compact alphanumeric matching key for a channel name
pub fn normalize(name: &str) -> String {
    let lowered = name.to_lowercase();

    // Short country/region prefix before a colon, e.g. "ca:" or "uk:"
    let body = match lowered.split_once(':') {
        Some((prefix, rest)) if prefix.chars().count() <= 3 => rest,
        _ => lowered.as_str(),
    };

    let mut key = String::with_capacity(body.len());
    let mut depth = 0usize;
    for c in body.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            // hyphens and underscores become separators, which are dropped below
            '-' | '_' => {}
            c if c.is_alphanumeric() => key.push(c),
            _ => {}
        }
    }
    key
}

/// Resolve `query` against the store's display-name index
pub fn resolve<'a>(query: &str, store: &'a GuideStore) -> Option<ChannelMatch<'a>> {
    let index = store.display_name_index();
    let found = |tier, (key, programs): (&'a String, &'a Vec<Program>)| ChannelMatch {
        tier,
        key: key.as_str(),
        programs: programs.as_slice(),
    };

    if let Some(entry) = index.get_key_value(query).filter(|(_, p)| !p.is_empty()) {
        return Some(found(MatchTier::Exact, entry));
    }

    let target = normalize(query);
    if target.is_empty() {
        return None;
    }

    let candidates: Vec<(String, (&'a String, &'a Vec<Program>))> = index
        .iter()
        .filter(|(_, programs)| !programs.is_empty())
        .map(|entry| (normalize(entry.0), entry))
        .filter(|(norm, _)| !norm.is_empty())
        .collect();

    if let Some((_, entry)) = candidates.iter().find(|(norm, _)| *norm == target) {
        return Some(found(MatchTier::Normalized, *entry));
    }

    candidates
        .iter()
        .find(|(norm, _)| norm.contains(target.as_str()) || target.contains(norm.as_str()))
        .map(|(_, entry)| found(MatchTier::Containment, *entry))
}

/// Resolve every name of a channel list; `None` marks "no guide data"
pub fn resolve_all<'a, I, S>(names: I, store: &'a GuideStore) -> Vec<(S, Option<ChannelMatch<'a>>)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| {
            let matched = resolve(name.as_ref(), store);
            (name, matched)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelCatalog, GuideSnapshot};
    use chrono::{TimeZone, Utc};

    fn store_with(names: &[(&str, &str)]) -> GuideStore {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap();
        let mut catalog = ChannelCatalog::new();
        let mut programs = Vec::new();
        for (id, name) in names {
            catalog.assign_name(id, name);
            programs.push(Program::new(*id, format!("{name} show"), start, end).unwrap());
        }
        GuideStore::from_snapshot(GuideSnapshot::new(catalog, programs, start))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("CA: CBC TORONTO"), "cbctoronto");
        assert_eq!(normalize("cbc-toronto"), "cbctoronto");
        assert_eq!(normalize("CBC Toronto (CBLT-DT)"), "cbctoronto");
        assert_eq!(normalize("UK: BBC_One [HD]"), "bbcone");
        assert_eq!(normalize("News: 24"), "news24");
        assert_eq!(normalize("TF1 ÉVÉNEMENT"), "tf1événement");
        assert_eq!(normalize("(HD)"), "");
    }

    #[test]
    fn test_exact_tier_wins_first() {
        let store = store_with(&[("cbc.ca", "CBC Toronto (CBLT-DT)")]);
        let m = resolve("CBC Toronto (CBLT-DT)", &store).unwrap();
        assert_eq!(m.tier, MatchTier::Exact);
        assert_eq!(m.programs.len(), 1);
    }

    #[test]
    fn test_normalized_before_containment() {
        let store = store_with(&[("cbc.ca", "CBC Toronto (CBLT-DT)")]);

        let m = resolve("CA: CBC TORONTO", &store).unwrap();
        assert_eq!(m.tier, MatchTier::Normalized);
        assert_eq!(m.key, "CBC Toronto (CBLT-DT)");

        let m = resolve("CBC", &store).unwrap();
        assert_eq!(m.tier, MatchTier::Containment);
        assert_eq!(m.key, "CBC Toronto (CBLT-DT)");
    }

    #[test]
    fn test_query_containing_candidate() {
        let store = store_with(&[("tsn", "TSN")]);
        let m = resolve("TSN 4K Backup", &store).unwrap();
        assert_eq!(m.tier, MatchTier::Containment);
        assert_eq!(m.key, "TSN");
    }

    #[test]
    fn test_no_match_is_none() {
        let store = store_with(&[("cbc.ca", "CBC Toronto")]);
        assert!(resolve("Discovery", &store).is_none());
        assert!(resolve("(backup)", &store).is_none());
        assert!(resolve("CBC", &GuideStore::empty()).is_none());
    }

    #[test]
    fn test_tie_break_is_lexicographic() {
        let store = store_with(&[("z", "Sportsnet West"), ("a", "Sportsnet East")]);
        let m = resolve("Sportsnet", &store).unwrap();
        assert_eq!(m.tier, MatchTier::Containment);
        assert_eq!(m.key, "Sportsnet East");
    }

    #[test]
    fn test_resolve_all_preserves_order() {
        let store = store_with(&[("cbc.ca", "CBC Toronto")]);
        let results = resolve_all(["CBC", "Nothing"], &store);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "CBC");
        assert_eq!(results[0].1.map(|m| m.tier), Some(MatchTier::Containment));
        assert!(results[1].1.is_none());
        assert_eq!(MatchTier::Containment.label(), "contains");
    }
}
