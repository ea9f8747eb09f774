//! Keyword search semantics and tag normalization.
//!
//! Every backend answers `shops_with_keyword` with the same rule:
//!
//! - one term: a tag equals it, the district equals it, or the shop name
//!   contains it (case-insensitive substring);
//! - several whitespace-separated terms: every term must be a tag.
//!
//! Unlisted shops (no address and no URL) and closed shops never match.
//! Keyword suggestions use character-level edit distance over the tag
//! vocabulary.

use crate::error::{StoreError, StoreResult};
use crate::models::Shop;

/// Lowercase and trim a tag. Blank tags are dropped.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let t = tag.trim().to_lowercase();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

/// Normalize, deduplicate and sort a set of tags.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = tags
        .into_iter()
        .filter_map(|t| normalize_tag(t.as_ref()))
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Tags a shop gets when it has none: its district and type.
pub fn default_tags(shop: &Shop) -> Vec<String> {
    normalize_tags([shop.district.as_str(), shop.kind.as_str()])
}

/// A parsed free-text keyword query.
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordQuery {
    Single(String),
    AllTags(Vec<String>),
}

impl KeywordQuery {
    pub fn parse(text: &str) -> StoreResult<Self> {
        let mut terms: Vec<String> = Vec::new();
        for word in text.split_whitespace() {
            if let Some(t) = normalize_tag(word) {
                if !terms.contains(&t) {
                    terms.push(t);
                }
            }
        }
        match terms.len() {
            0 => Err(StoreError::validation("empty keyword")),
            1 => Ok(KeywordQuery::Single(terms.remove(0))),
            _ => Ok(KeywordQuery::AllTags(terms)),
        }
    }

    /// Evaluate against a shop, including the listed/open filter.
    pub fn matches(&self, shop: &Shop) -> bool {
        if shop.is_closed() || !shop.is_listed() {
            return false;
        }
        match self {
            KeywordQuery::Single(term) => {
                shop.tags.iter().any(|t| t == term)
                    || shop.district.to_lowercase() == *term
                    || shop.name.to_lowercase().contains(term.as_str())
            }
            KeywordQuery::AllTags(terms) => terms.iter().all(|term| shop.tags.contains(term)),
        }
    }
}

/// Levenshtein distance counted in chars, not bytes.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Suggest vocabulary terms close to `key`.
///
/// A single-character key matches terms containing that character. Longer
/// keys match terms within `len(key) - 1` edits. Results are ordered by
/// distance, then alphabetically.
pub fn suggest<I, S>(key: &str, vocabulary: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let Some(key) = normalize_tag(key) else {
        return Vec::new();
    };
    let key_len = key.chars().count();

    let mut scored: Vec<(usize, String)> = vocabulary
        .into_iter()
        .filter_map(|term| normalize_tag(term.as_ref()))
        .filter_map(|term| {
            if key_len == 1 {
                term.contains(key.as_str()).then_some((0, term))
            } else {
                let d = edit_distance(&key, &term);
                (d < key_len).then_some((d, term))
            }
        })
        .collect();
    scored.sort();
    scored.dedup_by(|a, b| a.1 == b.1);
    scored.into_iter().map(|(_, term)| term).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listed(name: &str, tags: &[&str]) -> Shop {
        let mut shop = Shop::new(name, "咖啡", "中環");
        shop.address = Some("somewhere".into());
        shop.tags = normalize_tags(tags);
        shop
    }

    #[test]
    fn tags_are_normalized() {
        assert_eq!(
            normalize_tags(["Coffee ", "coffee", "", " 咖啡"]),
            vec!["coffee".to_string(), "咖啡".to_string()]
        );
    }

    #[test]
    fn single_term_matches_name_substring_or_tag() {
        let q = KeywordQuery::parse("sabi").unwrap();
        assert!(q.matches(&listed("侘寂珈琲 WabiSabi", &[])));
        assert!(!q.matches(&listed("Kiss Cafe", &["coffee"])));
        let q = KeywordQuery::parse("Coffee").unwrap();
        assert!(q.matches(&listed("Kiss Cafe", &["coffee"])));
        let q = KeywordQuery::parse("中環").unwrap();
        assert!(q.matches(&listed("Kiss Cafe", &[])));
    }

    #[test]
    fn multiple_terms_require_every_tag() {
        let q = KeywordQuery::parse("咖啡  甜品").unwrap();
        assert_eq!(
            q,
            KeywordQuery::AllTags(vec!["咖啡".into(), "甜品".into()])
        );
        assert!(q.matches(&listed("X", &["咖啡", "甜品", "中環"])));
        // a name hit is not enough once there are several terms
        assert!(!q.matches(&listed("咖啡甜品", &["咖啡"])));
    }

    #[test]
    fn unlisted_and_closed_shops_never_match() {
        let q = KeywordQuery::parse("咖啡").unwrap();
        let mut shop = listed("咖啡店", &["咖啡"]);
        shop.address = None;
        assert!(!q.matches(&shop));
        shop.url = Some("https://example.com".into());
        assert!(q.matches(&shop));
        shop.status = crate::models::ShopStatus::Closed;
        assert!(!q.matches(&shop));
    }

    #[test]
    fn blank_keyword_is_rejected() {
        assert!(matches!(
            KeywordQuery::parse("   "),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn edit_distance_counts_chars() {
        assert_eq!(edit_distance("珈啡", "咖啡"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", "abc"), 0);
    }

    #[test]
    fn suggests_close_terms() {
        let vocab = ["咖啡", "甜品", "書店", "coffee", "咖哩"];
        let got = suggest("珈啡", vocab);
        assert_eq!(got, vec!["咖啡".to_string()]);
        let got = suggest("cofee", vocab);
        assert_eq!(got, vec!["coffee".to_string()]);
    }

    #[test]
    fn single_char_key_is_substring_match() {
        let vocab = ["咖啡", "咖哩", "甜品", "啡"];
        assert_eq!(
            suggest("咖", vocab),
            vec!["咖哩".to_string(), "咖啡".to_string()]
        );
        assert_eq!(suggest("啡", vocab), vec!["咖啡".to_string(), "啡".to_string()]);
        assert!(suggest(" ", vocab).is_empty());
    }
}
