//! Shared fixtures for integration tests
#![allow(dead_code)]

use dbfed::engine::adapter::sqlite::SqliteConnection;
use dbfed::engine::adapter::{Connection, Row};
use serde_json::Value;
use std::path::Path;

/// Connected in-memory database with `ddl` applied
pub fn memory_db(ddl: &str) -> SqliteConnection {
    let conn = SqliteConnection::memory();
    conn.connect().unwrap();
    conn.query_raw(ddl).unwrap();
    conn
}

/// File database with `ddl` applied, left disconnected
pub fn file_db(path: &Path, ddl: &str) {
    let conn = SqliteConnection::file(path);
    conn.connect().unwrap();
    conn.query_raw(ddl).unwrap();
    conn.disconnect().unwrap();
}

pub fn row(fields: &[(&str, Value)]) -> Row {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Single-column `n` count through raw SQL
pub fn count_rows(conn: &dyn Connection, table: &str) -> i64 {
    let rows = conn
        .query_raw(&format!("SELECT COUNT(*) AS n FROM \"{}\"", table))
        .unwrap();
    rows[0]["n"].as_i64().unwrap()
}
