//! Connection Layer
//!
//! Provides the trait every backend and every composition implements. A
//! sharded or replicated composition is itself a `Connection`, so it can be
//! used anywhere a single database connection is expected.

pub mod dialect;
pub mod sqlite;

pub use dialect::{DialectGenerator, RenderedQuery, SqlDialect};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::error::{FederationError, Result};
use super::query::Query;

/// One result row, columns in select order
pub type Row = serde_json::Map<String, Value>;

/// Core connection trait, implemented by backends and compositions alike
pub trait Connection: Send + Sync {
    fn connect(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Which SQL dialect this connection speaks
    fn dialect(&self) -> Result<SqlDialect>;

    /// Detailed schema for a table
    fn table_info(&self, table: &str) -> Result<TableSchema>;

    fn has_sequences(&self) -> bool {
        false
    }

    /// Next value of a named sequence
    fn obtain_sequence(&self, sequence: &str) -> Result<i64> {
        Err(FederationError::Unsupported(format!("sequence '{}'", sequence)))
    }

    /// Execute a raw statement string; statements without a result set yield no rows
    fn query_raw(&self, sql: &str) -> Result<Vec<Row>>;

    /// Single result resource for a query
    fn query(&self, query: &Query) -> Result<RowCursor> {
        Ok(RowCursor::new(self.query_set(query)?))
    }

    fn query_row(&self, query: &Query) -> Result<Option<Row>> {
        Ok(self.query_set(query)?.into_iter().next())
    }

    fn query_set(&self, query: &Query) -> Result<Vec<Row>>;

    /// First column of every row
    fn query_column(&self, query: &Query) -> Result<Vec<Value>> {
        Ok(first_column(self.query_set(query)?))
    }

    /// Number of rows the query would return
    fn query_num_rows(&self, query: &Query) -> Result<u64> {
        Ok(self.query_set(query)?.len() as u64)
    }

    /// Execute a write and return the affected row count
    fn query_count(&self, query: &Query) -> Result<u64>;

    /// Execute a write, discarding the outcome
    fn query_null(&self, query: &Query) -> Result<()> {
        self.query_count(query).map(|_| ())
    }

    fn begin(&self, level: Option<IsolationLevel>, mode: Option<AccessMode>) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    fn has_queue(&self) -> bool {
        false
    }

    fn queue_start(&self) -> Result<()> {
        Err(FederationError::Unsupported("write-ahead queue".into()))
    }

    fn queue_stop(&self) -> Result<()> {
        Err(FederationError::Unsupported("write-ahead queue".into()))
    }

    fn queue_drop(&self) -> Result<()> {
        Err(FederationError::Unsupported("write-ahead queue".into()))
    }

    fn queue_flush(&self) -> Result<()> {
        Err(FederationError::Unsupported("write-ahead queue".into()))
    }

    fn is_queue_active(&self) -> bool {
        false
    }
}

/// Take the first column value out of each row
pub fn first_column(rows: Vec<Row>) -> Vec<Value> {
    rows.into_iter()
        .map(|row| row.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null))
        .collect()
}

/// Forward-only cursor over a result set
#[derive(Debug)]
pub struct RowCursor {
    rows: std::vec::IntoIter<Row>,
}

impl RowCursor {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into_iter() }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl Iterator for RowCursor {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "READ ONLY"),
            AccessMode::ReadWrite => write!(f, "READ WRITE"),
        }
    }
}

/// SQL value for parameterized queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            // Nested structures travel as JSON text
            other => SqlValue::Text(other.to_string()),
        }
    }
}

/// Detailed table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexInfo>,
}

impl TableSchema {
    /// Name of the first primary-key column, if any
    pub fn primary_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
    }
}

/// Column schema information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub is_auto_increment: bool,
    pub foreign_key: Option<ForeignKeyRef>,
}

/// Foreign key reference on a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// Index information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_value_from_json() {
        assert_eq!(SqlValue::from(&json!(null)), SqlValue::Null);
        assert_eq!(SqlValue::from(&json!(7)), SqlValue::Integer(7));
        assert_eq!(SqlValue::from(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(SqlValue::from(&json!("x")), SqlValue::Text("x".into()));
        assert_eq!(SqlValue::from(&json!([1, 2])), SqlValue::Text("[1,2]".into()));
    }

    #[test]
    fn test_first_column_and_cursor() {
        let mut row = Row::new();
        row.insert("a".into(), json!(1));
        row.insert("b".into(), json!(2));
        assert_eq!(first_column(vec![row.clone(), Row::new()]), vec![json!(1), Value::Null]);

        let mut cursor = RowCursor::new(vec![row.clone(), row]);
        assert_eq!(cursor.remaining(), 2);
        assert!(cursor.next().is_some());
        assert_eq!(cursor.remaining(), 1);
    }

    #[test]
    fn test_queue_controls_default_to_unsupported() {
        let log = crate::engine::testing::CallLog::default();
        let conn = crate::engine::testing::MockConnection::new("a", &log);
        assert!(!conn.has_queue());
        assert!(!conn.is_queue_active());
        assert!(matches!(conn.queue_start(), Err(FederationError::Unsupported(_))));
        assert!(matches!(conn.queue_flush(), Err(FederationError::Unsupported(_))));
    }
}
