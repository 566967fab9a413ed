pub mod dialect;
pub mod fulltext;
pub mod memory;
pub mod table;

pub use dialect::Dialect;
pub use memory::InMemoryStorage;
pub use table::{Table, TableSchema, UniqueConstraint};

use crate::core::{Criteria, Record, RegistryError, Result, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Named parameters bound into a raw statement (`:name`).
pub type Replacements = BTreeMap<String, Value>;

pub const ORGANIZATIONS_TABLE: &str = "organizations";
pub const UNITS_TABLE: &str = "units";
pub const UNITS_FTS_TABLE: &str = "units_fts";

/// Record persistence used for both the primary and the mirror database.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Dialect of the backing engine; selects the full-text strategy.
    fn dialect(&self) -> Dialect;

    /// Inserts a row and returns it as stored.
    async fn create(&self, table: &str, values: Record) -> Result<Record>;

    async fn find_one(&self, table: &str, criteria: &Criteria) -> Result<Option<Record>>;

    async fn find_all(&self, table: &str, criteria: &Criteria) -> Result<Vec<Record>>;

    /// Applies `changes` to every matching row; returns the affected count.
    async fn update(&self, table: &str, changes: &Record, criteria: &Criteria) -> Result<usize>;

    /// Deletes every matching row; returns the affected count.
    async fn destroy(&self, table: &str, criteria: &Criteria) -> Result<usize>;

    /// Escape hatch for dialect-specific statements.
    async fn raw_query(&self, sql: &str, replacements: &Replacements) -> Result<Vec<Record>>;

    /// Update the row keyed by `key_column` when present, insert otherwise.
    async fn upsert(&self, table: &str, key_column: &str, values: Record) -> Result<Record> {
        let key = values
            .get(key_column)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                RegistryError::ConstraintViolation(format!(
                    "upsert into '{}' requires a value for '{}'",
                    table, key_column
                ))
            })?;
        let criteria = Criteria::new().eq(key_column, key);

        if self.update(table, &values, &criteria).await? == 0 {
            return self.create(table, values).await;
        }
        self.find_one(table, &criteria)
            .await?
            .ok_or_else(|| RegistryError::NotFound(table.to_string(), criteria.to_string()))
    }
}
