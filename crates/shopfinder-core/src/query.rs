//! Advanced query grammar shared by every backend.
//!
//! ```text
//! 咖啡 -連鎖           required term, excluded term
//! name:"wabi sabi"     phrase on one field
//! 中環 OR 上環 咖啡     optional group plus a required term
//! ```
//!
//! Bare terms and phrases are required. `-term` excludes. Terms joined by
//! `OR` form an optional group that only affects ranking. Field prefixes
//! are `name:`, `district:`, `type:` and `tag:`; an unqualified term matches
//! a tag, the district or the type exactly, or the name as a substring.
//!
//! A query with no required term would match the whole corpus, so
//! [`AdvQuery::parse`] rejects it before any store sees it.

use std::str::FromStr;

use crate::error::{StoreError, StoreResult};
use crate::models::Shop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Any,
    Name,
    District,
    Type,
    Tag,
}

impl Field {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "name" => Some(Field::Name),
            "district" => Some(Field::District),
            "type" => Some(Field::Type),
            "tag" | "tags" => Some(Field::Tag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    Must,
    MustNot,
    Should,
}

/// One term or phrase, lowercased.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub field: Field,
    pub text: String,
}

impl Term {
    pub fn matches(&self, shop: &Shop) -> bool {
        let name = || shop.name.to_lowercase().contains(self.text.as_str());
        let district = || shop.district.to_lowercase() == self.text;
        let kind = || shop.kind.to_lowercase() == self.text;
        let tag = || shop.tags.iter().any(|t| *t == self.text);
        match self.field {
            Field::Any => tag() || name() || district() || kind(),
            Field::Name => name(),
            Field::District => district(),
            Field::Type => kind(),
            Field::Tag => tag(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub occur: Occur,
    pub term: Term,
}

/// A validated advanced query.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvQuery {
    clauses: Vec<Clause>,
}

impl AdvQuery {
    pub fn parse(input: &str) -> StoreResult<Self> {
        let tokens = split_tokens(input)?;
        let mut clauses: Vec<Clause> = Vec::new();
        let mut or_pending = false;

        for token in tokens {
            if token == "OR" {
                if clauses.is_empty() || or_pending {
                    return Err(StoreError::validation("dangling OR"));
                }
                or_pending = true;
                if let Some(prev) = clauses.last_mut() {
                    if prev.occur == Occur::Must {
                        prev.occur = Occur::Should;
                    }
                }
                continue;
            }

            let mut clause = parse_clause(&token)?;
            if or_pending && clause.occur == Occur::Must {
                clause.occur = Occur::Should;
            }
            or_pending = false;
            clauses.push(clause);
        }

        if or_pending {
            return Err(StoreError::validation("dangling OR"));
        }
        if !clauses.iter().any(|c| c.occur == Occur::Must) {
            return Err(StoreError::validation(
                "query needs at least one required term",
            ));
        }
        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn terms(&self, occur: Occur) -> impl Iterator<Item = &Term> {
        self.clauses
            .iter()
            .filter(move |c| c.occur == occur)
            .map(|c| &c.term)
    }

    /// Filter semantics: every required term matches and no excluded one does.
    pub fn matches(&self, shop: &Shop) -> bool {
        self.terms(Occur::Must).all(|t| t.matches(shop))
            && !self.terms(Occur::MustNot).any(|t| t.matches(shop))
    }

    /// Number of optional terms the shop matches. Used for ranking.
    pub fn should_hits(&self, shop: &Shop) -> usize {
        self.terms(Occur::Should).filter(|t| t.matches(shop)).count()
    }
}

impl FromStr for AdvQuery {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AdvQuery::parse(s)
    }
}

// Whitespace-separated tokens; quoted sections keep their spaces.
fn split_tokens(input: &str) -> StoreResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(StoreError::validation("unterminated quote"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_clause(token: &str) -> StoreResult<Clause> {
    let (occur, body) = if let Some(rest) = token.strip_prefix('-') {
        (Occur::MustNot, rest)
    } else if let Some(rest) = token.strip_prefix('+') {
        (Occur::Must, rest)
    } else {
        (Occur::Must, token)
    };

    let (field, body) = match body.split_once(':') {
        Some((prefix, rest)) => match Field::from_prefix(prefix) {
            Some(field) => (field, rest),
            None => (Field::Any, body),
        },
        None => (Field::Any, body),
    };

    let text = body.replace('"', "").trim().to_lowercase();
    if text.is_empty() {
        return Err(StoreError::validation(format!("empty term in {token:?}")));
    }
    Ok(Clause {
        occur,
        term: Term { field, text },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occurs(q: &AdvQuery) -> Vec<(Occur, Field, &str)> {
        q.clauses()
            .iter()
            .map(|c| (c.occur, c.term.field, c.term.text.as_str()))
            .collect()
    }

    #[test]
    fn bare_terms_are_required() {
        let q = AdvQuery::parse("咖啡 Central").unwrap();
        assert_eq!(
            occurs(&q),
            vec![
                (Occur::Must, Field::Any, "咖啡"),
                (Occur::Must, Field::Any, "central"),
            ]
        );
    }

    #[test]
    fn or_groups_become_optional() {
        let q = AdvQuery::parse("中環 OR 上環 咖啡 -連鎖").unwrap();
        assert_eq!(
            occurs(&q),
            vec![
                (Occur::Should, Field::Any, "中環"),
                (Occur::Should, Field::Any, "上環"),
                (Occur::Must, Field::Any, "咖啡"),
                (Occur::MustNot, Field::Any, "連鎖"),
            ]
        );
    }

    #[test]
    fn fields_and_phrases() {
        let q = AdvQuery::parse(r#"name:"Wabi Sabi" type:咖啡 foo:bar"#).unwrap();
        assert_eq!(
            occurs(&q),
            vec![
                (Occur::Must, Field::Name, "wabi sabi"),
                (Occur::Must, Field::Type, "咖啡"),
                (Occur::Must, Field::Any, "foo:bar"),
            ]
        );
    }

    #[test]
    fn negation_only_queries_are_rejected() {
        for q in ["-a OR -b", "-a", "a OR b", "", "   "] {
            assert!(
                matches!(AdvQuery::parse(q), Err(StoreError::Validation(_))),
                "{q:?}"
            );
        }
    }

    #[test]
    fn malformed_queries_are_rejected() {
        for q in ["OR a", "a OR", "a OR OR b", "name:", r#"name:"open"#] {
            assert!(AdvQuery::parse(q).is_err(), "{q:?}");
        }
    }

    #[test]
    fn filter_semantics() {
        let mut shop = Shop::new("侘寂珈琲 WabiSabi", "咖啡", "上環");
        shop.tags = vec!["咖啡".into(), "手沖".into()];

        assert!(AdvQuery::parse("手沖").unwrap().matches(&shop));
        assert!(AdvQuery::parse(r#"name:"珈琲 wabi""#).unwrap().matches(&shop));
        assert!(!AdvQuery::parse("咖啡 -上環").unwrap().matches(&shop));
        assert!(AdvQuery::parse("district:上環 tag:咖啡").unwrap().matches(&shop));
        assert!(!AdvQuery::parse("tag:上環").unwrap().matches(&shop));

        let q = AdvQuery::parse("咖啡 中環 OR 上環").unwrap();
        assert!(q.matches(&shop));
        assert_eq!(q.should_hits(&shop), 1);
    }
}
