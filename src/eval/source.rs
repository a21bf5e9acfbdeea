//! Row data read by policy subqueries

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{EvalError, EvalResult};

/// A row: column name to value, JSON `null` being SQL NULL
pub type Row = Map<String, Value>;

/// Convert a JSON value into a row
pub fn row_from_value(value: Value) -> EvalResult<Row> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(EvalError::invalid(format!(
            "row must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "numeric",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "jsonb",
    }
}

/// Tables visible to policy subqueries
pub trait TableSource: Send + Sync {
    /// All rows of `table`, or `None` if the table does not exist
    fn rows(&self, table: &str) -> Option<&[Row]>;
}

/// A source with no tables
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTables;

impl TableSource for NoTables {
    fn rows(&self, _table: &str) -> Option<&[Row]> {
        None
    }
}

/// In-memory tables, typically loaded from a fixture
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryTables {
    tables: BTreeMap<String, Vec<Row>>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>, rows: Vec<Row>) -> Self {
        self.insert(table, rows);
        self
    }

    pub fn insert(&mut self, table: impl Into<String>, rows: Vec<Row>) {
        self.tables.insert(table.into(), rows);
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

impl TableSource for MemoryTables {
    fn rows(&self, table: &str) -> Option<&[Row]> {
        self.tables.get(table).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_from_value() {
        let row = row_from_value(json!({"id": 1})).unwrap();
        assert_eq!(row["id"], 1);

        let err = row_from_value(json!([1, 2])).unwrap_err();
        assert_eq!(
            err,
            EvalError::InvalidRequest("row must be a JSON object, got array".to_string())
        );
    }

    #[test]
    fn test_memory_tables_deserialize() {
        let tables: MemoryTables = serde_json::from_value(json!({
            "members": [{"team_id": 1, "user_id": "u1"}]
        }))
        .unwrap();

        assert_eq!(tables.rows("members").map(<[Row]>::len), Some(1));
        assert!(tables.rows("missing").is_none());
        assert!(NoTables.rows("members").is_none());
    }
}
