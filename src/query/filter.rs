//! src/query/filter.rs
//!
//! Evaluates a query's filter clauses against the local node. A Node filter
//! matches iff the local name is in the list; a Tag filter matches iff the
//! named tag exists and its value matches an anchored regex.

use crate::tags::Tags;
use crate::wire::Filter;
use regex::Regex;

/// Anchors `pattern` with `^...$` unless it is empty, in which case it
/// matches everything — the distilled spec's "empty supplied filter
/// matches all" rule.
pub fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.is_empty() {
        return Regex::new(".*");
    }
    Regex::new(&format!("^{}$", pattern))
}

/// Evaluates every clause in `filters` against the local node; a query
/// matches only if *all* clauses match (conjunctive), mirroring the
/// original's filter stacking.
pub fn matches_local(filters: &[Filter], local_name: &str, local_tags: &Tags) -> bool {
    filters
        .iter()
        .all(|filter| matches_one(filter, local_name, local_tags))
}

fn matches_one(filter: &Filter, local_name: &str, local_tags: &Tags) -> bool {
    match filter {
        Filter::Node(names) => names.iter().any(|n| n == local_name),
        Filter::Tag { tag, regex } => match (local_tags.get(tag), anchored(regex)) {
            (Some(value), Ok(re)) => re.is_match(value),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn node_filter_matches_listed_name() {
        let filters = vec![Filter::Node(vec!["a".into(), "b".into()])];
        assert!(matches_local(&filters, "b", &Tags::new()));
        assert!(!matches_local(&filters, "c", &Tags::new()));
    }

    #[test]
    fn tag_filter_requires_anchored_match() {
        let filters = vec![Filter::Tag {
            tag: "role".into(),
            regex: "web".into(),
        }];
        assert!(matches_local(&filters, "n", &tags(&[("role", "web")])));
        assert!(!matches_local(&filters, "n", &tags(&[("role", "webserver")])));
    }

    #[test]
    fn tag_filter_fails_when_tag_missing() {
        let filters = vec![Filter::Tag {
            tag: "role".into(),
            regex: ".*".into(),
        }];
        assert!(!matches_local(&filters, "n", &Tags::new()));
    }

    #[test]
    fn empty_pattern_matches_any_value() {
        let filters = vec![Filter::Tag {
            tag: "role".into(),
            regex: "".into(),
        }];
        assert!(matches_local(&filters, "n", &tags(&[("role", "anything")])));
    }

    #[test]
    fn multiple_clauses_are_conjunctive() {
        let filters = vec![
            Filter::Node(vec!["n".into()]),
            Filter::Tag {
                tag: "role".into(),
                regex: "^web$".into(),
            },
        ];
        assert!(!matches_local(&filters, "n", &Tags::new()));
        assert!(matches_local(&filters, "n", &tags(&[("role", "web")])));
    }
}
