//! Interpretation of the full-text statements issued by the search strategies.
//!
//! Two statement shapes are understood, one per dialect:
//!
//! ```text
//! SELECT <fields> FROM <table> WHERE MATCH (<cols>) AGAINST (:search)
//!     [AND <col> = :<param>] [ORDER BY <expr> LIMIT :limit OFFSET :offset]
//! SELECT <fields> FROM <shadow> WHERE <shadow> MATCH :search
//!     [AND <col> = :<param>] [ORDER BY <expr> LIMIT :limit OFFSET :offset]
//! ```

use crate::core::{RegistryError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref STATEMENT: Regex = Regex::new(
        r"(?is)^\s*SELECT\s+(?P<fields>.+?)\s+FROM\s+(?P<table>\w+)\s+WHERE\s+(?P<predicate>.+?)(?P<order>\s+ORDER\s+BY\s+.+?\s+LIMIT\s+:limit\s+OFFSET\s+:offset)?\s*$"
    )
    .expect("statement pattern is valid");
    static ref NATIVE_MATCH: Regex = Regex::new(
        r"(?is)^MATCH\s*\((?P<columns>[^)]*)\)\s*AGAINST\s*\(\s*:search\s*\)(?P<rest>.*)$"
    )
    .expect("native match pattern is valid");
    static ref SHADOW_MATCH: Regex =
        Regex::new(r"(?is)^(?P<shadow>\w+)\s+MATCH\s+:search(?P<rest>.*)$")
            .expect("shadow match pattern is valid");
    static ref EQUALITY_FILTER: Regex =
        Regex::new(r"(?is)^\s*AND\s+(?P<column>\w+)\s*=\s*:(?P<param>\w+)\s*$")
            .expect("filter pattern is valid");
    static ref IDENTIFIER: Regex = Regex::new(r"^\w+$").expect("identifier pattern is valid");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSyntax {
    /// `MATCH (cols) AGAINST (:search)` over a regular table.
    Native { columns: Vec<String> },
    /// `<shadow> MATCH :search` over a full-text shadow table.
    Shadow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTextStatement {
    /// `None` selects every column.
    pub fields: Option<Vec<String>>,
    pub table: String,
    pub syntax: MatchSyntax,
    /// Column compared against a named replacement.
    pub filter: Option<(String, String)>,
    pub paginated: bool,
}

impl FullTextStatement {
    pub fn parse(sql: &str) -> Result<Self> {
        let caps = STATEMENT
            .captures(sql)
            .ok_or_else(|| RegistryError::InvalidQuery(format!("unsupported statement: {}", sql.trim())))?;

        let fields = parse_fields(&caps["fields"])?;
        let table = caps["table"].to_string();
        let predicate = caps["predicate"].trim();
        let paginated = caps.name("order").is_some();

        let (syntax, rest) = if let Some(m) = NATIVE_MATCH.captures(predicate) {
            let columns = split_identifiers(&m["columns"])?;
            if columns.is_empty() {
                return Err(RegistryError::InvalidQuery(
                    "MATCH requires at least one column".to_string(),
                ));
            }
            (MatchSyntax::Native { columns }, m["rest"].to_string())
        } else if let Some(m) = SHADOW_MATCH.captures(predicate) {
            if !m["shadow"].eq_ignore_ascii_case(&table) {
                return Err(RegistryError::InvalidQuery(format!(
                    "MATCH target '{}' differs from source table '{}'",
                    &m["shadow"], table
                )));
            }
            (MatchSyntax::Shadow, m["rest"].to_string())
        } else {
            return Err(RegistryError::InvalidQuery(format!(
                "unsupported predicate: {}",
                predicate
            )));
        };

        let filter = if rest.trim().is_empty() {
            None
        } else {
            let f = EQUALITY_FILTER.captures(&rest).ok_or_else(|| {
                RegistryError::InvalidQuery(format!("unsupported filter: {}", rest.trim()))
            })?;
            Some((f["column"].to_string(), f["param"].to_string()))
        };

        Ok(Self {
            fields,
            table,
            syntax,
            filter,
            paginated,
        })
    }
}

fn parse_fields(raw: &str) -> Result<Option<Vec<String>>> {
    if raw.trim() == "*" {
        return Ok(None);
    }
    split_identifiers(raw).map(Some)
}

fn split_identifiers(raw: &str) -> Result<Vec<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if IDENTIFIER.is_match(s) {
                Ok(s.to_string())
            } else {
                Err(RegistryError::InvalidQuery(format!("invalid identifier '{}'", s)))
            }
        })
        .collect()
}

/// Lowercased alphanumeric runs, the unit the indexes match on.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Natural-language relevance: occurrences of any query word.
/// Zero means no match.
pub fn natural_language_score(query: &str, haystack: &[String]) -> usize {
    let words: HashSet<String> = tokenize(query).into_iter().collect();
    haystack.iter().filter(|t| words.contains(*t)).count()
}

#[derive(Debug)]
struct PhraseToken {
    text: String,
    prefix: bool,
}

impl PhraseToken {
    fn matches(&self, token: &str) -> bool {
        if self.prefix {
            token.starts_with(&self.text)
        } else {
            token == self.text
        }
    }
}

fn parse_phrase(term: &str) -> Vec<PhraseToken> {
    let mut phrase = Vec::new();
    for part in term.split('+').filter(|p| !p.is_empty()) {
        let prefix = part.ends_with('*');
        let tokens = tokenize(part.trim_end_matches('*'));
        let last = tokens.len().saturating_sub(1);
        for (i, text) in tokens.into_iter().enumerate() {
            phrase.push(PhraseToken {
                text,
                prefix: prefix && i == last,
            });
        }
    }
    phrase
}

fn phrase_occurrences(phrase: &[PhraseToken], haystack: &[String]) -> usize {
    if phrase.is_empty() || phrase.len() > haystack.len() {
        return 0;
    }
    haystack
        .windows(phrase.len())
        .filter(|window| phrase.iter().zip(window.iter()).all(|(p, t)| p.matches(t)))
        .count()
}

/// Shadow-index match: every whitespace-separated term must occur, where a
/// term is a `+`-joined phrase and a trailing `*` makes its last token a
/// prefix. Returns the rank (total occurrences) or `None` when not matched.
pub fn shadow_match_score(query: &str, haystack: &[String]) -> Result<Option<usize>> {
    let mut total = 0;
    let mut terms = 0;
    for term in query.split_whitespace() {
        let phrase = parse_phrase(term);
        if phrase.is_empty() {
            return Err(RegistryError::InvalidQuery(format!(
                "fts5: syntax error near \"{}\"",
                term
            )));
        }
        terms += 1;
        let hits = phrase_occurrences(&phrase, haystack);
        if hits == 0 {
            return Ok(None);
        }
        total += hits;
    }
    if terms == 0 {
        return Err(RegistryError::InvalidQuery(
            "fts5: empty match expression".to_string(),
        ));
    }
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_native_statement() {
        let stmt = FullTextStatement::parse(
            "SELECT serialNumberBlock, unitStatus FROM units WHERE MATCH (unitStatus, marketplace) AGAINST (:search) AND orgUid = :orgUid ORDER BY MATCH (unitStatus, marketplace) AGAINST (:search) DESC LIMIT :limit OFFSET :offset",
        )
        .unwrap();
        assert_eq!(
            stmt.fields,
            Some(vec!["serialNumberBlock".to_string(), "unitStatus".to_string()])
        );
        assert_eq!(stmt.table, "units");
        assert_eq!(
            stmt.syntax,
            MatchSyntax::Native {
                columns: vec!["unitStatus".to_string(), "marketplace".to_string()]
            }
        );
        assert_eq!(stmt.filter, Some(("orgUid".to_string(), "orgUid".to_string())));
        assert!(stmt.paginated);
    }

    #[test]
    fn test_parse_shadow_statement() {
        let stmt =
            FullTextStatement::parse("SELECT * FROM units_fts WHERE units_fts MATCH :search").unwrap();
        assert_eq!(stmt.fields, None);
        assert_eq!(stmt.syntax, MatchSyntax::Shadow);
        assert_eq!(stmt.filter, None);
        assert!(!stmt.paginated);
    }

    #[test]
    fn test_reject_unsupported_statements() {
        assert!(FullTextStatement::parse("DELETE FROM units").is_err());
        assert!(FullTextStatement::parse("SELECT * FROM units WHERE orgUid = :orgUid").is_err());
        assert!(
            FullTextStatement::parse("SELECT * FROM units_fts WHERE units MATCH :search").is_err()
        );
        assert!(
            FullTextStatement::parse("SELECT a;b FROM units_fts WHERE units_fts MATCH :search")
                .is_err()
        );
    }

    #[test]
    fn test_shadow_phrase_and_prefix() {
        let haystack = tokenize("ABC-100 held by Acme Corp");
        assert_eq!(shadow_match_score("abc+100", &haystack).unwrap(), Some(1));
        assert_eq!(shadow_match_score("ac*", &haystack).unwrap(), Some(1));
        assert_eq!(shadow_match_score("held acme", &haystack).unwrap(), Some(2));
        assert_eq!(shadow_match_score("held missing", &haystack).unwrap(), None);
        assert!(shadow_match_score("*", &haystack).is_err());
    }

    #[test]
    fn test_natural_language_any_word() {
        let haystack = tokenize("Retired units in Brazil");
        assert_eq!(natural_language_score("brazil chile", &haystack), 1);
        assert_eq!(natural_language_score("chile", &haystack), 0);
    }
}
