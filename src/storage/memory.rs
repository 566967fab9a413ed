use super::fulltext::{
    FullTextStatement, MatchSyntax, natural_language_score, shadow_match_score, tokenize,
};
use super::{
    Dialect, Persistence, Replacements, Table, TableSchema, UNITS_FTS_TABLE,
    UNITS_TABLE,
};
use crate::core::{Criteria, Record, RegistryError, Result, Value};
use crate::registry::organizations_schema;
use crate::units::{PERSISTED_COLUMNS, units_schema};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;

const CREATED_AT: &str = "createdAt";
const UPDATED_AT: &str = "updatedAt";

/// Full-text shadow table kept over a source table.
#[derive(Debug, Clone)]
struct FullTextShadow {
    source: String,
    columns: Vec<String>,
}

/// In-memory persistence backend.
///
/// Each table sits behind its own async lock; the table catalogue is only
/// locked for the short lookups that resolve a handle.
pub struct InMemoryStorage {
    dialect: Dialect,
    tables: StdRwLock<HashMap<String, Arc<RwLock<Table>>>>,
    shadows: StdRwLock<HashMap<String, FullTextShadow>>,
    offline: AtomicBool,
}

impl InMemoryStorage {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            tables: StdRwLock::new(HashMap::new()),
            shadows: StdRwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Storage with the organization and unit tables installed. The sqlite
    /// dialect also gets the `units_fts` shadow index.
    pub fn for_registry(dialect: Dialect) -> Result<Self> {
        let storage = Self::new(dialect);
        storage.create_table(organizations_schema())?;
        storage.create_table(units_schema())?;
        if dialect == Dialect::Sqlite {
            storage.register_shadow(
                UNITS_FTS_TABLE,
                UNITS_TABLE,
                PERSISTED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            )?;
        }
        Ok(storage)
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        let mut tables = self.tables.write()?;
        let name = schema.name().to_string();
        if tables.contains_key(&name) {
            return Err(RegistryError::Storage(format!("Table '{}' already exists", name)));
        }
        tables.insert(name, Arc::new(RwLock::new(Table::new(schema))));
        Ok(())
    }

    /// Registers `shadow` as a full-text index over `columns` of `source`.
    pub fn register_shadow(&self, shadow: &str, source: &str, columns: Vec<String>) -> Result<()> {
        if !self.table_exists(source)? {
            return Err(RegistryError::Storage(format!("Table '{}' not found", source)));
        }
        self.shadows.write()?.insert(
            shadow.to_string(),
            FullTextShadow {
                source: source.to_string(),
                columns,
            },
        );
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.tables.read()?.contains_key(name))
    }

    /// Makes every subsequent call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn row_count(&self, table: &str) -> Result<usize> {
        let handle = self.get_table(table)?;
        let table = handle.read().await;
        Ok(table.row_count())
    }

    fn get_table(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RegistryError::Storage("storage is offline".to_string()));
        }
        self.tables
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::Storage(format!("Table '{}' not found", name)))
    }

    fn shadow(&self, name: &str) -> Result<FullTextShadow> {
        self.shadows
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::Storage(format!("no such table: {}", name)))
    }

    fn search_text(replacements: &Replacements) -> Result<&str> {
        replacements
            .get("search")
            .and_then(Value::as_str)
            .ok_or_else(|| RegistryError::InvalidQuery("missing :search replacement".to_string()))
    }

    fn page_bound(replacements: &Replacements, name: &str) -> Result<usize> {
        replacements
            .get(name)
            .and_then(Value::as_i64)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| RegistryError::InvalidQuery(format!("missing :{} replacement", name)))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new(Dialect::Sqlite)
    }
}

fn timestamp() -> Value {
    Value::Text(chrono::Utc::now().to_rfc3339())
}

#[async_trait]
impl Persistence for InMemoryStorage {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn create(&self, table: &str, mut values: Record) -> Result<Record> {
        let handle = self.get_table(table)?;
        let now = timestamp();
        if !values.contains(CREATED_AT) {
            values.set(CREATED_AT, now.clone());
        }
        values.set(UPDATED_AT, now);

        let mut table = handle.write().await;
        table.insert(values.clone())?;
        Ok(values)
    }

    async fn find_one(&self, table: &str, criteria: &Criteria) -> Result<Option<Record>> {
        let handle = self.get_table(table)?;
        let table = handle.read().await;
        Ok(table
            .scan_matching(criteria)
            .into_iter()
            .next()
            .map(|(_, row)| row.clone()))
    }

    async fn find_all(&self, table: &str, criteria: &Criteria) -> Result<Vec<Record>> {
        let handle = self.get_table(table)?;
        let table = handle.read().await;
        Ok(table
            .scan_matching(criteria)
            .into_iter()
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn update(&self, table: &str, changes: &Record, criteria: &Criteria) -> Result<usize> {
        let handle = self.get_table(table)?;
        let mut table = handle.write().await;

        let targets: Vec<(usize, Record)> = table
            .scan_matching(criteria)
            .into_iter()
            .map(|(id, row)| {
                let mut updated = row.clone();
                updated.merge(changes);
                updated.set(UPDATED_AT, timestamp());
                (id, updated)
            })
            .collect();

        let mut affected = 0;
        for (id, row) in targets {
            if table.update(id, row)? {
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn destroy(&self, table: &str, criteria: &Criteria) -> Result<usize> {
        let handle = self.get_table(table)?;
        let mut table = handle.write().await;

        let ids: Vec<usize> = table
            .scan_matching(criteria)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        Ok(ids.into_iter().filter_map(|id| table.delete(id)).count())
    }

    async fn raw_query(&self, sql: &str, replacements: &Replacements) -> Result<Vec<Record>> {
        let statement = FullTextStatement::parse(sql)?;
        let search = Self::search_text(replacements)?;

        let (source, indexed, visible) = match &statement.syntax {
            MatchSyntax::Native { columns } => {
                if self.dialect != Dialect::MySql {
                    return Err(RegistryError::InvalidQuery(format!(
                        "MATCH ... AGAINST is not supported by the {} dialect",
                        self.dialect
                    )));
                }
                (statement.table.clone(), columns.clone(), None)
            }
            MatchSyntax::Shadow => {
                if self.dialect != Dialect::Sqlite {
                    return Err(RegistryError::InvalidQuery(format!(
                        "shadow MATCH is not supported by the {} dialect",
                        self.dialect
                    )));
                }
                let shadow = self.shadow(&statement.table)?;
                (shadow.source, shadow.columns.clone(), Some(shadow.columns))
            }
        };

        if let (Some(visible), Some(fields)) = (&visible, &statement.fields)
            && let Some(unknown) = fields.iter().find(|f| !visible.contains(f))
        {
            return Err(RegistryError::InvalidQuery(format!("no such column: {}", unknown)));
        }

        let filter = match &statement.filter {
            Some((column, param)) => {
                let value = replacements.get(param).cloned().ok_or_else(|| {
                    RegistryError::InvalidQuery(format!("missing :{} replacement", param))
                })?;
                Some(Criteria::new().eq(column.clone(), value))
            }
            None => None,
        };

        let handle = self.get_table(&source)?;
        let table = handle.read().await;

        let mut scored: Vec<(usize, &Record)> = Vec::new();
        for row in table.rows() {
            if let Some(filter) = &filter
                && !filter.matches(row)
            {
                continue;
            }
            let haystack: Vec<String> = indexed
                .iter()
                .filter_map(|c| row.get(c).and_then(Value::searchable_text))
                .flat_map(|text| tokenize(&text))
                .collect();
            let score = match statement.syntax {
                MatchSyntax::Native { .. } => Some(natural_language_score(search, &haystack))
                    .filter(|s| *s > 0),
                MatchSyntax::Shadow => shadow_match_score(search, &haystack)?,
            };
            if let Some(score) = score {
                scored.push((score, row));
            }
        }

        if statement.paginated {
            let limit = Self::page_bound(replacements, "limit")?;
            let offset = Self::page_bound(replacements, "offset")?;
            // Stable sort keeps insertion order among equal ranks.
            scored.sort_by(|a, b| b.0.cmp(&a.0));
            scored = scored.into_iter().skip(offset).take(limit).collect();
        }

        let projection: Vec<String> = match (&statement.fields, visible) {
            (Some(fields), _) => fields.clone(),
            (None, Some(visible)) => visible,
            (None, None) => Vec::new(),
        };
        Ok(scored
            .into_iter()
            .map(|(_, row)| row.project(&projection))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ORGANIZATIONS_TABLE;

    fn unit(id: &str, org: &str, block: &str, status: &str) -> Record {
        Record::new()
            .with("warehouseUnitId", id)
            .with("orgUid", org)
            .with("serialNumberBlock", block)
            .with("unitStatus", status)
    }

    async fn seeded(dialect: Dialect) -> InMemoryStorage {
        let storage = InMemoryStorage::for_registry(dialect).unwrap();
        storage.create(UNITS_TABLE, unit("u1", "org-a", "ABC100-ABC149", "Held")).await.unwrap();
        storage.create(UNITS_TABLE, unit("u2", "org-b", "XYZ1-XYZ9", "Held")).await.unwrap();
        storage.create(UNITS_TABLE, unit("u3", "org-a", "ABC150-ABC199", "Retired")).await.unwrap();
        storage
    }

    fn search(term: &str) -> Replacements {
        let mut replacements = Replacements::new();
        replacements.insert("search".to_string(), Value::from(term));
        replacements
    }

    #[tokio::test]
    async fn test_crud_by_criteria() {
        let storage = seeded(Dialect::Sqlite).await;
        let held = Criteria::new().eq("unitStatus", "Held");
        assert_eq!(storage.find_all(UNITS_TABLE, &held).await.unwrap().len(), 2);

        let changes = Record::new().with("unitStatus", "Cancelled");
        let affected = storage
            .update(UNITS_TABLE, &changes, &Criteria::new().eq("warehouseUnitId", "u1"))
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(storage.find_all(UNITS_TABLE, &held).await.unwrap().len(), 1);

        let removed = storage.destroy(UNITS_TABLE, &Criteria::new().eq("orgUid", "org-a")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.row_count(UNITS_TABLE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_stamps_timestamps() {
        let storage = seeded(Dialect::Sqlite).await;
        let row = storage
            .find_one(UNITS_TABLE, &Criteria::new().eq("warehouseUnitId", "u2"))
            .await
            .unwrap()
            .unwrap();
        assert!(row.get_str(CREATED_AT).is_some());
        assert!(row.get_str(UPDATED_AT).is_some());
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let storage = InMemoryStorage::for_registry(Dialect::Sqlite).unwrap();
        let org = Record::new().with("orgUid", "o1").with("name", "First");
        storage.upsert(ORGANIZATIONS_TABLE, "orgUid", org).await.unwrap();
        let org = Record::new().with("orgUid", "o1").with("name", "Second");
        let stored = storage.upsert(ORGANIZATIONS_TABLE, "orgUid", org).await.unwrap();
        assert_eq!(stored.get_str("name"), Some("Second"));
        assert_eq!(storage.row_count(ORGANIZATIONS_TABLE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shadow_match_with_scope_and_page() {
        let storage = seeded(Dialect::Sqlite).await;
        let sql = "SELECT warehouseUnitId FROM units_fts WHERE units_fts MATCH :search AND orgUid = :orgUid";
        let mut replacements = search("abc*");
        replacements.insert("orgUid".to_string(), Value::from("org-a"));
        let rows = storage.raw_query(sql, &replacements).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 1);

        let paged = format!("{} ORDER BY rank LIMIT :limit OFFSET :offset", sql);
        replacements.insert("limit".to_string(), Value::Integer(1));
        replacements.insert("offset".to_string(), Value::Integer(1));
        let rows = storage.raw_query(&paged, &replacements).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_native_match_requires_mysql() {
        let sql = "SELECT * FROM units WHERE MATCH (unitStatus) AGAINST (:search)";
        let sqlite = seeded(Dialect::Sqlite).await;
        assert!(sqlite.raw_query(sql, &search("held")).await.is_err());

        let mysql = seeded(Dialect::MySql).await;
        let rows = mysql.raw_query(sql, &search("held")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains("serialNumberBlock"));
    }

    #[tokio::test]
    async fn test_shadow_rejects_unknown_column() {
        let storage = seeded(Dialect::Sqlite).await;
        let sql = "SELECT nope FROM units_fts WHERE units_fts MATCH :search";
        assert!(storage.raw_query(sql, &search("held")).await.is_err());
    }

    #[tokio::test]
    async fn test_offline_storage_fails() {
        let storage = seeded(Dialect::Sqlite).await;
        storage.set_offline(true);
        assert!(storage.find_all(UNITS_TABLE, &Criteria::new()).await.is_err());
        storage.set_offline(false);
        assert_eq!(storage.find_all(UNITS_TABLE, &Criteria::new()).await.unwrap().len(), 3);
    }
}
