use crate::core::{Criteria, Record, RegistryError, Result, Value};
use std::collections::{BTreeMap, HashMap};

/// Uniqueness rule on one column.
///
/// With `when` set, only rows holding exactly that value take part in the
/// check (a partial unique index, e.g. "at most one `isHome = true`").
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueConstraint {
    pub column: String,
    pub when: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    primary_key: Option<String>,
    unique: Vec<UniqueConstraint>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            unique: Vec::new(),
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn unique(mut self, column: impl Into<String>) -> Self {
        self.unique.push(UniqueConstraint {
            column: column.into(),
            when: None,
        });
        self
    }

    pub fn unique_when(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.unique.push(UniqueConstraint {
            column: column.into(),
            when: Some(value.into()),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key_column(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<usize, Record>,
    next_row_id: usize,
    primary_index: HashMap<Value, usize>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_row_id: 0,
            primary_index: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn insert(&mut self, record: Record) -> Result<usize> {
        self.check_uniqueness(&record, None)?;

        let id = self.next_row_id;
        self.next_row_id += 1;

        if let Some(key) = self.primary_value(&record) {
            self.primary_index.insert(key, id);
        }
        self.rows.insert(id, record);
        Ok(id)
    }

    /// Replaces the row stored under `id`. Returns `false` when it is gone.
    pub fn update(&mut self, id: usize, record: Record) -> Result<bool> {
        self.check_uniqueness(&record, Some(id))?;

        let Some(old) = self.rows.get(&id) else {
            return Ok(false);
        };
        if let Some(old_key) = self.primary_value(old) {
            self.primary_index.remove(&old_key);
        }
        if let Some(key) = self.primary_value(&record) {
            self.primary_index.insert(key, id);
        }
        self.rows.insert(id, record);
        Ok(true)
    }

    pub fn delete(&mut self, id: usize) -> Option<Record> {
        let removed = self.rows.remove(&id)?;
        if let Some(key) = self.primary_value(&removed) {
            self.primary_index.remove(&key);
        }
        Some(removed)
    }

    /// Row ids and rows matching `criteria`, in insertion order.
    pub fn scan_matching(&self, criteria: &Criteria) -> Vec<(usize, &Record)> {
        // Point lookup when the criteria pins the primary key.
        if let Some(pk) = self.schema.primary_key_column()
            && let Some((_, key)) = criteria.terms().iter().find(|(c, _)| c == pk)
        {
            return self
                .primary_index
                .get(key)
                .and_then(|id| self.rows.get(id).map(|row| (*id, row)))
                .filter(|(_, row)| criteria.matches(row))
                .into_iter()
                .collect();
        }

        self.rows
            .iter()
            .filter(|(_, row)| criteria.matches(row))
            .map(|(id, row)| (*id, row))
            .collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Record> {
        self.rows.values()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn primary_value(&self, record: &Record) -> Option<Value> {
        let pk = self.schema.primary_key_column()?;
        record.get(pk).filter(|v| !v.is_null()).cloned()
    }

    fn check_uniqueness(&self, record: &Record, ignore_id: Option<usize>) -> Result<()> {
        if let Some(pk) = self.schema.primary_key_column() {
            let Some(key) = self.primary_value(record) else {
                return Err(RegistryError::ConstraintViolation(format!(
                    "Primary key '{}' of table '{}' cannot be NULL",
                    pk,
                    self.schema.name()
                )));
            };
            if let Some(existing) = self.primary_index.get(&key)
                && Some(*existing) != ignore_id
            {
                return Err(RegistryError::ConstraintViolation(format!(
                    "Unique constraint violation: Column '{}' already contains value {}",
                    pk, key
                )));
            }
        }

        for constraint in &self.schema.unique {
            let value = match record.get(&constraint.column) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };
            if let Some(when) = &constraint.when
                && value != when
            {
                continue;
            }

            let clash = self.rows.iter().any(|(id, row)| {
                Some(*id) != ignore_id && row.get(&constraint.column) == Some(value)
            });
            if clash {
                return Err(RegistryError::ConstraintViolation(format!(
                    "Unique constraint violation: Column '{}' already contains value {}",
                    constraint.column, value
                )));
            }
        }
        Ok(())
    }
}
