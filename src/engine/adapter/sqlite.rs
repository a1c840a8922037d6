//! SQLite Connection
//!
//! Implements `Connection` for SQLite using rusqlite + r2d2 connection pooling.
//! The pool is created on `connect` and dropped on `disconnect`. An open
//! transaction pins one pooled connection until commit or rollback, and every
//! statement issued meanwhile runs on it.

use base64::Engine;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSql, ValueRef};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::dialect::{DialectGenerator, SqlDialect};
use super::{
    AccessMode, ColumnSchema, Connection, ForeignKeyRef, IndexInfo, IsolationLevel, Row,
    SqlValue, TableSchema,
};
use crate::engine::error::{FederationError, Result};
use crate::engine::query::Query;

type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    File(PathBuf),
    Memory,
}

pub struct SqliteConnection {
    target: Target,
    pool: Mutex<Option<DbPool>>,
    tx: Mutex<Option<DbConn>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| FederationError::Connection("sqlite connection state poisoned".into()))
}

fn query_err(e: rusqlite::Error) -> FederationError {
    FederationError::Query(e.to_string())
}

fn schema_err(e: rusqlite::Error) -> FederationError {
    FederationError::Schema(e.to_string())
}

impl SqliteConnection {
    /// File-backed database; nothing is opened until `connect`
    pub fn file(db_path: &Path) -> Self {
        Self {
            target: Target::File(db_path.to_path_buf()),
            pool: Mutex::new(None),
            tx: Mutex::new(None),
        }
    }

    /// Private in-memory database. Its contents live as long as the connection
    /// stays connected.
    pub fn memory() -> Self {
        Self {
            target: Target::Memory,
            pool: Mutex::new(None),
            tx: Mutex::new(None),
        }
    }

    /// Display string for status output
    pub fn location(&self) -> String {
        match &self.target {
            Target::File(path) => format!("sqlite://{}", path.display()),
            Target::Memory => "sqlite://:memory:".to_string(),
        }
    }

    fn build_pool(&self) -> Result<DbPool> {
        match &self.target {
            Target::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                let manager = SqliteConnectionManager::file(path)
                    .with_init(|c| c.execute_batch("PRAGMA foreign_keys=ON"));
                let pool = Pool::builder()
                    .max_size(10)
                    .build(manager)
                    .map_err(|e| FederationError::Connection(e.to_string()))?;

                let conn = pool
                    .get()
                    .map_err(|e| FederationError::Connection(e.to_string()))?;
                let _: String = conn
                    .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                    .map_err(schema_err)?;
                Ok(pool)
            }
            // Every pooled connection to :memory: is a separate database, so a
            // single connection that is never recycled
            Target::Memory => Pool::builder()
                .max_size(1)
                .max_lifetime(None)
                .idle_timeout(None)
                .build(SqliteConnectionManager::memory())
                .map_err(|e| FederationError::Connection(e.to_string())),
        }
    }

    fn get_pool(&self) -> Result<DbPool> {
        lock(&self.pool)?
            .clone()
            .ok_or_else(|| FederationError::Connection(format!("{} is not connected", self.location())))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let tx = lock(&self.tx)?;
        if let Some(conn) = tx.as_ref() {
            return f(conn);
        }
        drop(tx);

        let conn = self
            .get_pool()?
            .get()
            .map_err(|e| FederationError::Connection(e.to_string()))?;
        f(&conn)
    }

    fn bind_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql>> {
        params
            .iter()
            .map(|p| -> Box<dyn ToSql> {
                match p {
                    SqlValue::Null => Box::new(rusqlite::types::Null),
                    SqlValue::Integer(i) => Box::new(*i),
                    SqlValue::Real(f) => Box::new(*f),
                    SqlValue::Text(s) => Box::new(s.clone()),
                    SqlValue::Bool(b) => Box::new(*b as i64),
                    SqlValue::Blob(b) => Box::new(b.clone()),
                }
            })
            .collect()
    }

    fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        tracing::trace!(sql, "sqlite fetch");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(query_err)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();

            let bound = Self::bind_params(params);
            let refs: Vec<&dyn ToSql> = bound.iter().map(|p| p.as_ref()).collect();

            let rows = stmt
                .query_map(refs.as_slice(), |row| {
                    let mut map = Row::new();
                    for (i, name) in column_names.iter().enumerate() {
                        map.insert(name.clone(), Self::value_ref_to_json(row.get_ref(i)?));
                    }
                    Ok(map)
                })
                .map_err(query_err)?
                .collect::<std::result::Result<Vec<Row>, _>>()
                .map_err(query_err)?;
            Ok(rows)
        })
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        tracing::trace!(sql, "sqlite execute");
        self.with_conn(|conn| {
            let bound = Self::bind_params(params);
            let refs: Vec<&dyn ToSql> = bound.iter().map(|p| p.as_ref()).collect();
            let affected = conn.execute(sql, refs.as_slice()).map_err(query_err)?;
            Ok(affected as u64)
        })
    }

    /// Convert a rusqlite ValueRef to serde_json Value
    fn value_ref_to_json(val: ValueRef<'_>) -> Value {
        match val {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => json!(i),
            ValueRef::Real(f) => json!(f),
            ValueRef::Text(t) => json!(String::from_utf8_lossy(t).to_string()),
            ValueRef::Blob(b) => json!(base64::engine::general_purpose::STANDARD.encode(b)),
        }
    }

    fn render(&self, query: &Query) -> Result<super::RenderedQuery> {
        DialectGenerator::new(SqlDialect::Sqlite).render(query)
    }

    fn index_columns(conn: &rusqlite::Connection, index_name: &str) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_info('{}')", index_name.replace('\'', "''")))
            .map_err(schema_err)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(2))
            .map_err(schema_err)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(schema_err)?;
        Ok(columns)
    }
}

impl Connection for SqliteConnection {
    fn connect(&self) -> Result<()> {
        let mut pool = lock(&self.pool)?;
        if pool.is_some() {
            return Ok(());
        }
        *pool = Some(self.build_pool()?);
        tracing::debug!(target = %self.location(), "sqlite connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        // Dropping a pinned connection with an open transaction rolls it back
        lock(&self.tx)?.take();
        if lock(&self.pool)?.take().is_some() {
            tracing::debug!(target = %self.location(), "sqlite disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    fn dialect(&self) -> Result<SqlDialect> {
        Ok(SqlDialect::Sqlite)
    }

    fn table_info(&self, table: &str) -> Result<TableSchema> {
        self.with_conn(|conn| {
            let quoted = table.replace('\'', "''");

            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info('{}')", quoted))
                .map_err(schema_err)?;
            let mut columns: Vec<ColumnSchema> = stmt
                .query_map([], |row| {
                    let name: String = row.get(1)?;
                    let col_type: String = row.get(2)?;
                    let not_null: i32 = row.get(3)?;
                    let default: Option<String> = row.get(4)?;
                    let pk: i32 = row.get(5)?;
                    Ok(ColumnSchema {
                        name,
                        col_type,
                        nullable: not_null == 0,
                        default_value: default,
                        is_primary_key: pk > 0,
                        is_unique: false,
                        is_auto_increment: false,
                        foreign_key: None,
                    })
                })
                .map_err(schema_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(schema_err)?;

            if columns.is_empty() {
                return Err(FederationError::Schema(format!("table \"{}\" not found", table)));
            }

            // Only the CREATE text tells a rowid alias from an AUTOINCREMENT key
            let create_sql: Option<String> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .optional()
                .map_err(schema_err)?
                .flatten();
            let autoincrement = create_sql
                .map(|sql| sql.to_uppercase().contains("AUTOINCREMENT"))
                .unwrap_or(false);
            if autoincrement {
                for col in columns.iter_mut() {
                    col.is_auto_increment =
                        col.is_primary_key && col.col_type.eq_ignore_ascii_case("INTEGER");
                }
            }

            let mut fk_stmt = conn
                .prepare(&format!("PRAGMA foreign_key_list('{}')", quoted))
                .map_err(schema_err)?;
            let fks = fk_stmt
                .query_map([], |row| {
                    let to_table: String = row.get(2)?;
                    let from_column: String = row.get(3)?;
                    let to_column: String = row.get(4)?;
                    Ok((from_column, to_table, to_column))
                })
                .map_err(schema_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(schema_err)?;
            for (from_column, to_table, to_column) in fks {
                if let Some(col) = columns.iter_mut().find(|c| c.name == from_column) {
                    col.foreign_key = Some(ForeignKeyRef { table: to_table, column: to_column });
                }
            }

            let mut idx_stmt = conn
                .prepare(&format!("PRAGMA index_list('{}')", quoted))
                .map_err(schema_err)?;
            let index_heads = idx_stmt
                .query_map([], |row| {
                    let name: String = row.get(1)?;
                    let unique: i32 = row.get(2)?;
                    Ok((name, unique > 0))
                })
                .map_err(schema_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(schema_err)?;

            let mut indexes = Vec::new();
            for (name, unique) in index_heads {
                // Implicit indexes for PRIMARY KEY / UNIQUE constraints
                if name.starts_with("sqlite_") {
                    continue;
                }
                let cols = Self::index_columns(conn, &name)?;
                indexes.push(IndexInfo { name, columns: cols, unique });
            }

            for idx in &indexes {
                if idx.unique && idx.columns.len() == 1 {
                    if let Some(col) = columns.iter_mut().find(|c| c.name == idx.columns[0]) {
                        col.is_unique = true;
                    }
                }
            }

            Ok(TableSchema { name: table.to_string(), columns, indexes })
        })
    }

    fn query_raw(&self, sql: &str) -> Result<Vec<Row>> {
        let head = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase();
        match head.as_str() {
            "SELECT" | "PRAGMA" | "WITH" | "VALUES" | "EXPLAIN" => self.fetch(sql, &[]),
            _ => {
                self.with_conn(|conn| conn.execute_batch(sql).map_err(query_err))?;
                Ok(Vec::new())
            }
        }
    }

    fn query_set(&self, query: &Query) -> Result<Vec<Row>> {
        let rendered = self.render(query)?;
        self.fetch(&rendered.sql, &rendered.params)
    }

    fn query_num_rows(&self, query: &Query) -> Result<u64> {
        let rendered = self.render(query)?;
        let sql = format!("SELECT COUNT(*) AS n FROM ({})", rendered.sql);
        let rows = self.fetch(&sql, &rendered.params)?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    fn query_count(&self, query: &Query) -> Result<u64> {
        let rendered = self.render(query)?;
        self.execute(&rendered.sql, &rendered.params)
    }

    fn begin(&self, level: Option<IsolationLevel>, mode: Option<AccessMode>) -> Result<()> {
        let mut tx = lock(&self.tx)?;
        if tx.is_some() {
            return Err(FederationError::Query("transaction already in progress".into()));
        }
        let conn = self
            .get_pool()?
            .get()
            .map_err(|e| FederationError::Connection(e.to_string()))?;

        // SQLite has no isolation levels; take the write lock up front when asked
        // for serializable or read-write access
        let sql = match (level, mode) {
            (Some(IsolationLevel::Serializable), _) | (_, Some(AccessMode::ReadWrite)) => {
                "BEGIN IMMEDIATE"
            }
            _ => "BEGIN DEFERRED",
        };
        conn.execute_batch(sql).map_err(query_err)?;
        *tx = Some(conn);
        tracing::debug!(target = %self.location(), "transaction started");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let conn = lock(&self.tx)?
            .take()
            .ok_or_else(|| FederationError::Query("no transaction in progress".into()))?;
        if let Err(e) = conn.execute_batch("COMMIT") {
            // Never hand a connection with a dangling transaction back to the pool
            let _ = conn.execute_batch("ROLLBACK");
            return Err(query_err(e));
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let conn = lock(&self.tx)?
            .take()
            .ok_or_else(|| FederationError::Query("no transaction in progress".into()))?;
        conn.execute_batch("ROLLBACK").map_err(query_err)
    }

    fn in_transaction(&self) -> bool {
        self.tx.lock().map(|t| t.is_some()).unwrap_or(false)
    }
}
