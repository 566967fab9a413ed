//! Full-text unit search.
//!
//! The dispatcher owns exactly one strategy, chosen from the storage
//! dialect when it is built. Requested columns are checked against the unit
//! catalogue, derived columns are swapped for their backing column, and
//! count and page run over the same prepared match text.

pub mod sanitize;
pub mod strategy;

pub use sanitize::{WILDCARD, sanitize_fts_query};
pub use strategy::{FullTextStrategy, NativeFullText, ShadowFullText};

use crate::config::DEFAULT_CALL_TIMEOUT;
use crate::core::{Record, RegistryError, Result, bounded};
use crate::storage::{Dialect, Persistence};
use crate::units::{
    SERIAL_NUMBER_BLOCK, TIMESTAMP_FIELDS, derive_block_fields, is_derived, is_known_column,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Pagination {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Pagination applies only when both bounds are given.
    pub fn from_parts(offset: Option<usize>, limit: Option<usize>) -> Option<Self> {
        Some(Self::new(offset?, limit?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub count: usize,
    pub rows: Vec<Record>,
}

/// A search ready to run: match text, scope and stored columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    pub search: String,
    pub organization: Option<String>,
    pub fields: Vec<String>,
}

/// Columns actually sent to the query engine for a requested projection.
///
/// Unknown columns are rejected. Requesting any derived column pulls in
/// `serialNumberBlock`; derived and timestamp columns never reach the query.
pub fn query_columns(columns: &[String]) -> Result<Vec<String>> {
    if let Some(unknown) = columns.iter().find(|c| !is_known_column(c)) {
        return Err(RegistryError::InvalidColumn(unknown.clone()));
    }

    let mut fields: Vec<String> = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        let pseudo = is_derived(column) || TIMESTAMP_FIELDS.contains(&column.as_str());
        if !pseudo && !fields.contains(column) {
            fields.push(column.clone());
        }
    }
    if columns.iter().any(|c| is_derived(c)) && !fields.iter().any(|c| c == SERIAL_NUMBER_BLOCK) {
        fields.push(SERIAL_NUMBER_BLOCK.to_string());
    }
    Ok(fields)
}

pub struct SearchDispatcher {
    strategy: Box<dyn FullTextStrategy>,
    call_timeout: Duration,
}

impl SearchDispatcher {
    /// Picks the strategy matching the store's dialect.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        let strategy: Box<dyn FullTextStrategy> = match store.dialect() {
            Dialect::MySql => Box::new(NativeFullText::new(store)),
            Dialect::Sqlite => Box::new(ShadowFullText::new(store)),
        };
        Self {
            strategy,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound on each count and page query.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Like [`SearchDispatcher::new`], but fails unless the store speaks
    /// the configured dialect.
    pub fn for_dialect(dialect: Dialect, store: Arc<dyn Persistence>) -> Result<Self> {
        if store.dialect() != dialect {
            return Err(RegistryError::Configuration(format!(
                "search configured for {} but the store speaks {}",
                dialect,
                store.dialect()
            )));
        }
        Ok(Self::new(store))
    }

    pub fn dialect(&self) -> Dialect {
        self.strategy.dialect()
    }

    pub async fn search(
        &self,
        query: &str,
        organization: Option<&str>,
        pagination: Option<Pagination>,
        columns: &[String],
    ) -> Result<SearchResult> {
        let fields = query_columns(columns)?;
        let Some(search) = self.strategy.prepare(query) else {
            event!(Level::DEBUG, query, "search has nothing to match");
            return Ok(SearchResult::default());
        };

        let prepared = PreparedQuery {
            search,
            organization: organization.map(str::to_string),
            fields,
        };
        let count = bounded(
            self.call_timeout,
            "search count",
            self.strategy.count(&prepared),
        )
        .await?;
        let mut rows = bounded(
            self.call_timeout,
            "search page",
            self.strategy.page(&prepared, pagination),
        )
        .await?;
        rows.iter_mut().for_each(derive_block_fields);

        event!(
            Level::DEBUG,
            dialect = %self.dialect(),
            count,
            returned = rows.len(),
            "unit search"
        );
        Ok(SearchResult { count, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Criteria, Value};
    use crate::storage::{InMemoryStorage, Replacements, UNITS_TABLE};
    use crate::units::{UNIT_BLOCK_START, UNIT_COUNT};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Delegates to in-memory storage and records every raw statement.
    /// A stalled store never answers a raw statement.
    struct RecordingStore {
        inner: InMemoryStorage,
        statements: Mutex<Vec<String>>,
        stalled: bool,
    }

    impl RecordingStore {
        fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Persistence for RecordingStore {
        fn dialect(&self) -> Dialect {
            self.inner.dialect()
        }
        async fn create(&self, table: &str, values: Record) -> Result<Record> {
            self.inner.create(table, values).await
        }
        async fn find_one(&self, table: &str, criteria: &Criteria) -> Result<Option<Record>> {
            self.inner.find_one(table, criteria).await
        }
        async fn find_all(&self, table: &str, criteria: &Criteria) -> Result<Vec<Record>> {
            self.inner.find_all(table, criteria).await
        }
        async fn update(&self, table: &str, changes: &Record, criteria: &Criteria) -> Result<usize> {
            self.inner.update(table, changes, criteria).await
        }
        async fn destroy(&self, table: &str, criteria: &Criteria) -> Result<usize> {
            self.inner.destroy(table, criteria).await
        }
        async fn raw_query(&self, sql: &str, replacements: &Replacements) -> Result<Vec<Record>> {
            self.statements.lock().unwrap().push(sql.to_string());
            if self.stalled {
                std::future::pending::<()>().await;
            }
            self.inner.raw_query(sql, replacements).await
        }
    }

    async fn recording(dialect: Dialect) -> Arc<RecordingStore> {
        recording_with(dialect, false).await
    }

    async fn recording_with(dialect: Dialect, stalled: bool) -> Arc<RecordingStore> {
        let inner = InMemoryStorage::for_registry(dialect).unwrap();
        for (i, (org, block, status)) in [
            ("org-a", "ABC100-ABC149", "Held"),
            ("org-a", "ABC150-ABC199", "Held"),
            ("org-b", "XYZ1-XYZ9", "Held"),
            ("org-b", "XYZ10-XYZ19", "Retired"),
        ]
        .into_iter()
        .enumerate()
        {
            let unit = Record::new()
                .with("warehouseUnitId", format!("u{}", i))
                .with("orgUid", org)
                .with("serialNumberBlock", block)
                .with("unitStatus", status);
            inner.create(UNITS_TABLE, unit).await.unwrap();
        }
        Arc::new(RecordingStore {
            inner,
            statements: Mutex::new(Vec::new()),
            stalled,
        })
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_derived_column_expands_to_backing_column() {
        let fields = query_columns(&cols(&["unitBlockStart", "unitStatus"])).unwrap();
        assert_eq!(fields, cols(&["unitStatus", "serialNumberBlock"]));

        let fields = query_columns(&cols(&["serialNumberBlock", "unitCount", "createdAt"])).unwrap();
        assert_eq!(fields, cols(&["serialNumberBlock"]));
    }

    #[test]
    fn test_unknown_column_is_rejected() {
        let err = query_columns(&cols(&["unitStatus", "1=1; --"])).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidColumn(c) if c == "1=1; --"));
    }

    #[test]
    fn test_pagination_requires_both_bounds() {
        assert_eq!(Pagination::from_parts(Some(0), Some(10)), Some(Pagination::new(0, 10)));
        assert_eq!(Pagination::from_parts(None, Some(10)), None);
        assert_eq!(Pagination::from_parts(Some(5), None), None);
    }

    #[tokio::test]
    async fn test_wildcard_short_circuits() {
        let store = recording(Dialect::Sqlite).await;
        let dispatcher = SearchDispatcher::new(store.clone());
        for query in ["*", "\"*\"", "()", ""] {
            let result = dispatcher.search(query, None, None, &[]).await.unwrap();
            assert_eq!(result, SearchResult::default());
        }
        assert!(store.statements().is_empty());
    }

    #[tokio::test]
    async fn test_executed_projection_strips_derived_columns() {
        let store = recording(Dialect::Sqlite).await;
        let dispatcher = SearchDispatcher::new(store.clone());
        let result = dispatcher
            .search("abc*", None, None, &cols(&["unitBlockStart", "unitStatus"]))
            .await
            .unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.rows[0].get(UNIT_BLOCK_START), Some(&Value::Integer(100)));

        let page = store.statements().pop().unwrap();
        assert!(page.starts_with("SELECT unitStatus, serialNumberBlock FROM units_fts"));
        assert!(!page.contains("unitBlockStart"));
    }

    #[tokio::test]
    async fn test_count_is_independent_of_pagination() {
        for dialect in [Dialect::Sqlite, Dialect::MySql] {
            let dispatcher = SearchDispatcher::new(recording(dialect).await);
            let all = dispatcher.search("held", None, None, &[]).await.unwrap();
            let page = dispatcher
                .search("held", None, Some(Pagination::new(0, 1)), &[])
                .await
                .unwrap();
            assert_eq!(all.count, 3);
            assert_eq!(page.count, all.count);
            assert_eq!(all.rows.len(), 3);
            assert_eq!(page.rows.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unbounded_page_returns_every_match() {
        let dispatcher = SearchDispatcher::new(recording(Dialect::Sqlite).await);
        let result = dispatcher
            .search("held", None, Some(Pagination::new(0, usize::MAX)), &[])
            .await
            .unwrap();
        assert_eq!(result.count, 3);
        assert_eq!(result.rows.len(), 3);

        let past_end = dispatcher
            .search("held", None, Some(Pagination::new(usize::MAX, usize::MAX)), &[])
            .await
            .unwrap();
        assert_eq!(past_end.count, 3);
        assert!(past_end.rows.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_query_times_out() {
        let dispatcher = SearchDispatcher::new(recording_with(Dialect::Sqlite, true).await)
            .with_call_timeout(std::time::Duration::from_millis(50));
        let err = dispatcher.search("held", None, None, &[]).await.unwrap_err();
        assert!(matches!(err, RegistryError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_organization_scope() {
        let dispatcher = SearchDispatcher::new(recording(Dialect::MySql).await);
        let result = dispatcher
            .search("held", Some("org-b"), None, &cols(&["unitCount"]))
            .await
            .unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.rows[0].get(UNIT_COUNT), Some(&Value::Integer(8)));
        assert!(!result.rows[0].contains("unitStatus"));
    }

    #[tokio::test]
    async fn test_dialect_mismatch_is_configuration_error() {
        let store: Arc<dyn Persistence> = recording(Dialect::Sqlite).await;
        assert!(matches!(
            SearchDispatcher::for_dialect(Dialect::MySql, store.clone()),
            Err(RegistryError::Configuration(_))
        ));
        assert_eq!(
            SearchDispatcher::for_dialect(Dialect::Sqlite, store).unwrap().dialect(),
            Dialect::Sqlite
        );
    }
}
