use super::sanitize::{WILDCARD, sanitize_fts_query};
use super::{Pagination, PreparedQuery};
use crate::core::{Record, Result, Value};
use crate::storage::{Dialect, Persistence, Replacements, UNITS_FTS_TABLE, UNITS_TABLE};
use crate::units::{FULL_TEXT_COLUMNS, OWNER_COLUMN, PRIMARY_KEY};
use async_trait::async_trait;
use std::sync::Arc;

/// One dialect's way of running a full-text unit search.
#[async_trait]
pub trait FullTextStrategy: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn store(&self) -> &dyn Persistence;

    /// Match text for the raw query, or `None` when nothing can match.
    fn prepare(&self, raw: &str) -> Option<String>;

    /// Statement over `fields` (empty selects every column).
    fn statement(&self, fields: &[String], scoped: bool, paginated: bool) -> String;

    /// Size of the whole match set.
    async fn count(&self, query: &PreparedQuery) -> Result<usize> {
        let sql = self.statement(
            &[PRIMARY_KEY.to_string()],
            query.organization.is_some(),
            false,
        );
        let rows = self
            .store()
            .raw_query(&sql, &replacements(query, None))
            .await?;
        Ok(rows.len())
    }

    /// Matching rows; ranked and windowed only when paginated.
    async fn page(
        &self,
        query: &PreparedQuery,
        pagination: Option<Pagination>,
    ) -> Result<Vec<Record>> {
        let sql = self.statement(
            &query.fields,
            query.organization.is_some(),
            pagination.is_some(),
        );
        self.store()
            .raw_query(&sql, &replacements(query, pagination))
            .await
    }
}

fn replacements(query: &PreparedQuery, pagination: Option<Pagination>) -> Replacements {
    let mut replacements = Replacements::new();
    replacements.insert("search".to_string(), Value::from(query.search.as_str()));
    if let Some(org) = &query.organization {
        replacements.insert(OWNER_COLUMN.to_string(), Value::from(org.as_str()));
    }
    if let Some(page) = pagination {
        replacements.insert("limit".to_string(), Value::Integer(page_bound(page.limit)));
        replacements.insert("offset".to_string(), Value::Integer(page_bound(page.offset)));
    }
    replacements
}

/// Bounds past `i64::MAX` saturate rather than wrap negative.
fn page_bound(bound: usize) -> i64 {
    i64::try_from(bound).unwrap_or(i64::MAX)
}

fn select_list(fields: &[String]) -> String {
    if fields.is_empty() {
        "*".to_string()
    } else {
        fields.join(", ")
    }
}

fn scope_clause(scoped: bool) -> String {
    if scoped {
        format!(" AND {} = :{}", OWNER_COLUMN, OWNER_COLUMN)
    } else {
        String::new()
    }
}

/// `MATCH ... AGAINST` over the units table, ranked by relevance.
pub struct NativeFullText {
    store: Arc<dyn Persistence>,
}

impl NativeFullText {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    fn match_expression() -> String {
        format!("MATCH ({}) AGAINST (:search)", FULL_TEXT_COLUMNS.join(", "))
    }
}

#[async_trait]
impl FullTextStrategy for NativeFullText {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn store(&self) -> &dyn Persistence {
        self.store.as_ref()
    }

    fn prepare(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn statement(&self, fields: &[String], scoped: bool, paginated: bool) -> String {
        let matching = Self::match_expression();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}{}",
            select_list(fields),
            UNITS_TABLE,
            matching,
            scope_clause(scoped)
        );
        if paginated {
            sql.push_str(&format!(
                " ORDER BY {} DESC LIMIT :limit OFFSET :offset",
                matching
            ));
        }
        sql
    }
}

/// `units_fts MATCH` over the shadow index, ranked by the index.
pub struct ShadowFullText {
    store: Arc<dyn Persistence>,
}

impl ShadowFullText {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FullTextStrategy for ShadowFullText {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn store(&self) -> &dyn Persistence {
        self.store.as_ref()
    }

    fn prepare(&self, raw: &str) -> Option<String> {
        let sanitized = sanitize_fts_query(raw);
        if sanitized == WILDCARD {
            return None;
        }
        let anchored = sanitized.strip_prefix('+').unwrap_or(&sanitized);
        Some(anchored.to_string())
    }

    fn statement(&self, fields: &[String], scoped: bool, paginated: bool) -> String {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {} MATCH :search{}",
            select_list(fields),
            UNITS_FTS_TABLE,
            UNITS_FTS_TABLE,
            scope_clause(scoped)
        );
        if paginated {
            sql.push_str(" ORDER BY rank LIMIT :limit OFFSET :offset");
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::storage::fulltext::{FullTextStatement, MatchSyntax};

    fn store(dialect: Dialect) -> Arc<dyn Persistence> {
        Arc::new(InMemoryStorage::for_registry(dialect).unwrap())
    }

    #[test]
    fn test_shadow_prepare() {
        let shadow = ShadowFullText::new(store(Dialect::Sqlite));
        assert_eq!(shadow.prepare("*"), None);
        assert_eq!(shadow.prepare("()"), None);
        assert_eq!(shadow.prepare("-held").as_deref(), Some("held"));
        assert_eq!(shadow.prepare("ABC100-ABC149").as_deref(), Some("ABC100+ABC149"));
    }

    #[test]
    fn test_native_prepare_keeps_text() {
        let native = NativeFullText::new(store(Dialect::MySql));
        assert_eq!(native.prepare("  "), None);
        assert_eq!(native.prepare(" held \"x\" ").as_deref(), Some("held \"x\""));
    }

    #[test]
    fn test_statements_parse_as_emitted() {
        let fields = vec!["serialNumberBlock".to_string(), "unitStatus".to_string()];

        let native = NativeFullText::new(store(Dialect::MySql)).statement(&fields, true, true);
        let parsed = FullTextStatement::parse(&native).unwrap();
        assert!(matches!(parsed.syntax, MatchSyntax::Native { ref columns } if columns.len() == FULL_TEXT_COLUMNS.len()));
        assert_eq!(parsed.filter, Some(("orgUid".to_string(), "orgUid".to_string())));
        assert!(parsed.paginated);

        let shadow = ShadowFullText::new(store(Dialect::Sqlite)).statement(&[], false, false);
        let parsed = FullTextStatement::parse(&shadow).unwrap();
        assert_eq!(parsed.syntax, MatchSyntax::Shadow);
        assert_eq!(parsed.fields, None);
        assert!(!parsed.paginated);
    }
}
