//! Scripted connection for unit tests

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::adapter::{
    AccessMode, ColumnSchema, Connection, IsolationLevel, Row, SqlDialect, TableSchema,
};
use super::error::{FederationError, Result};
use super::query::Query;

/// Call log shared by several mocks so tests can assert dispatch order
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Clones share state, so a test can keep one handle and box another
#[derive(Clone)]
pub struct MockConnection {
    name: String,
    log: CallLog,
    rows: Arc<Vec<Row>>,
    affected: u64,
    fail_commit: bool,
    connected: Arc<AtomicBool>,
    in_tx: Arc<AtomicBool>,
    queries: Arc<Mutex<Vec<Query>>>,
}

impl MockConnection {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            rows: Arc::new(Vec::new()),
            affected: 1,
            fail_commit: false,
            connected: Arc::new(AtomicBool::new(false)),
            in_tx: Arc::new(AtomicBool::new(false)),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = Arc::new(rows);
        self
    }

    pub fn with_affected(mut self, affected: u64) -> Self {
        self.affected = affected;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn boxed(&self) -> Box<dyn Connection> {
        Box::new(self.clone())
    }

    /// Queries received so far, as dispatched
    pub fn queries(&self) -> Vec<Query> {
        self.queries.lock().unwrap().clone()
    }

    fn record(&self, op: &str, query: Option<&Query>) {
        self.log.push(format!("{}:{}", self.name, op));
        if let Some(q) = query {
            self.queries.lock().unwrap().push(q.clone());
        }
    }
}

/// Build a row from (column, value) pairs
pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

impl Connection for MockConnection {
    fn connect(&self) -> Result<()> {
        self.record("connect", None);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.record("disconnect", None);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn dialect(&self) -> Result<SqlDialect> {
        Ok(SqlDialect::Sqlite)
    }

    fn table_info(&self, table: &str) -> Result<TableSchema> {
        self.record("table_info", None);
        Ok(TableSchema {
            name: table.to_string(),
            columns: vec![ColumnSchema {
                name: "id".into(),
                col_type: "INTEGER".into(),
                nullable: false,
                default_value: None,
                is_primary_key: true,
                is_unique: false,
                is_auto_increment: true,
                foreign_key: None,
            }],
            indexes: Vec::new(),
        })
    }

    fn query_raw(&self, sql: &str) -> Result<Vec<Row>> {
        self.record(&format!("raw:{}", sql), None);
        Ok(Vec::new())
    }

    fn query_set(&self, query: &Query) -> Result<Vec<Row>> {
        self.record("set", Some(query));
        let rows = self.rows.as_ref().clone();
        Ok(match query {
            Query::Select(s) => match s.limit {
                Some(limit) => rows.into_iter().take(limit as usize).collect(),
                None => rows,
            },
            _ => rows,
        })
    }

    fn query_count(&self, query: &Query) -> Result<u64> {
        self.record("count", Some(query));
        Ok(self.affected)
    }

    fn begin(&self, _level: Option<IsolationLevel>, _mode: Option<AccessMode>) -> Result<()> {
        self.record("begin", None);
        self.in_tx.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.record("commit", None);
        if self.fail_commit {
            return Err(FederationError::Query(format!("{} refused commit", self.name)));
        }
        self.in_tx.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.record("rollback", None);
        self.in_tx.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::SeqCst)
    }
}
