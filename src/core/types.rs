use super::{RegistryError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A stored row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Text value of a column; `None` for absent, NULL and non-text values.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(Value::as_str)
    }

    pub fn get_bool(&self, column: &str) -> bool {
        self.fields.get(column).map(Value::as_bool).unwrap_or(false)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.fields.remove(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Overwrites every column present in `changes`.
    pub fn merge(&mut self, changes: &Record) {
        for (column, value) in &changes.fields {
            self.fields.insert(column.clone(), value.clone());
        }
    }

    /// Keeps only the listed columns. An empty list keeps everything.
    pub fn project(&self, columns: &[String]) -> Record {
        if columns.is_empty() {
            return self.clone();
        }
        let fields = columns
            .iter()
            .filter_map(|c| self.fields.get(c).map(|v| (c.clone(), v.clone())))
            .collect();
        Record { fields }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            RegistryError::Serialization(format!("expected a JSON object, got {}", value))
        })?;
        let fields = object
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        Ok(Record { fields })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Record {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Conjunction of column equalities used to address records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    terms: Vec<(String, Value)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((column.into(), value.into()));
        self
    }

    pub fn terms(&self) -> &[(String, Value)] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// An empty criteria matches every record.
    pub fn matches(&self, record: &Record) -> bool {
        self.terms.iter().all(|(column, expected)| {
            record.get(column).unwrap_or(&Value::Null) == expected
        })
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "<all>");
        }
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|(c, v)| format!("{} = '{}'", c, v))
            .collect();
        write!(f, "{}", parts.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_matches() {
        let record = Record::new().with("orgUid", "org-1").with("unitStatus", "Held");
        assert!(Criteria::new().eq("orgUid", "org-1").matches(&record));
        assert!(!Criteria::new().eq("orgUid", "org-2").matches(&record));
        assert!(Criteria::new().matches(&record));
        assert!(Criteria::new().eq("missing", Value::Null).matches(&record));
    }

    #[test]
    fn test_project_keeps_requested_columns() {
        let record = Record::new().with("a", 1i64).with("b", 2i64).with("c", 3i64);
        let projected = record.project(&["c".to_string(), "a".to_string()]);
        assert_eq!(projected.len(), 2);
        assert!(!projected.contains("b"));
        assert_eq!(record.project(&[]), record);
    }

    #[test]
    fn test_json_round_trip_of_object() {
        let json = serde_json::json!({"name": "Org", "isHome": true});
        let record = Record::from_json(&json).unwrap();
        assert!(record.get_bool("isHome"));
        assert_eq!(record.to_json(), json);
        assert!(Record::from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_criteria_display() {
        let criteria = Criteria::new().eq("orgUid", "x").eq("isHome", true);
        assert_eq!(criteria.to_string(), "orgUid = 'x' AND isHome = 'true'");
    }
}
