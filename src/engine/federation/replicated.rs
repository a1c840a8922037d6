//! Replicated composition
//!
//! One primary plus mirrors. Writes go to every endpoint, primary first; reads
//! go to a single endpoint picked by the read policy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::MultiConnection;
use crate::engine::adapter::{
    AccessMode, Connection, DialectGenerator, IsolationLevel, Row, RowCursor, SqlDialect,
    TableSchema,
};
use crate::engine::error::{FederationError, Result};
use crate::engine::locks::ScopedLock;
use crate::engine::query::{FieldRef, InsertQuery, OrderBy, Query, SelectQuery};

pub const DEFAULT_SYNC_BLOCK_SIZE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPolicy {
    /// Primary and mirrors
    #[default]
    Any,
    PrimaryOnly,
    MirrorsOnly,
}

/// Outcome of a table resync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub table: String,
    pub mirrors: usize,
    pub rows: u64,
    pub blocks: u64,
    pub schema_only: bool,
}

pub struct ReplicatedConnection {
    primary: Option<Box<dyn Connection>>,
    mirrors: Vec<Box<dyn Connection>>,
    policy: ReadPolicy,
    /// Index into the current read pool; out of range means "pick again"
    cursor: AtomicUsize,
    table_lock: Option<ScopedLock>,
    sync_block_size: u64,
}

impl Default for ReplicatedConnection {
    fn default() -> Self {
        Self {
            primary: None,
            mirrors: Vec::new(),
            policy: ReadPolicy::Any,
            cursor: AtomicUsize::new(usize::MAX),
            table_lock: None,
            sync_block_size: DEFAULT_SYNC_BLOCK_SIZE,
        }
    }
}

impl ReplicatedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_primary(&mut self, conn: Box<dyn Connection>) {
        self.primary = Some(conn);
    }

    pub fn add_mirror(&mut self, conn: Box<dyn Connection>) {
        self.mirrors.push(conn);
    }

    /// Detach a mirror and hand it back to the caller
    pub fn remove_mirror(&mut self, index: usize) -> Result<Box<dyn Connection>> {
        if index >= self.mirrors.len() {
            return Err(FederationError::Config(format!(
                "no mirror at index {} ({} configured)",
                index,
                self.mirrors.len()
            )));
        }
        Ok(self.mirrors.remove(index))
    }

    pub fn set_read_policy(&mut self, policy: ReadPolicy) {
        self.policy = policy;
    }

    pub fn read_policy(&self) -> ReadPolicy {
        self.policy
    }

    pub fn set_table_lock(&mut self, lock: ScopedLock) {
        self.table_lock = Some(lock);
    }

    pub fn set_sync_block_size(&mut self, size: u64) {
        self.sync_block_size = size.max(1);
    }

    pub fn primary(&self) -> Result<&dyn Connection> {
        self.primary.as_deref().ok_or(FederationError::NoEndpoints)
    }

    pub fn mirrors(&self) -> Vec<&dyn Connection> {
        self.mirrors.iter().map(|m| m.as_ref()).collect()
    }

    /// Endpoint for the next read
    pub fn next_endpoint(&self) -> Result<&dyn Connection> {
        self.assert_endpoints()?;
        match self.policy {
            ReadPolicy::PrimaryOnly => self.primary(),
            ReadPolicy::Any => self.rotate(self.endpoints()),
            ReadPolicy::MirrorsOnly => self.rotate(self.mirrors()),
        }
    }

    /// Use the cursor if it fits the pool, then re-roll it for the next call
    fn rotate<'a>(&self, pool: Vec<&'a dyn Connection>) -> Result<&'a dyn Connection> {
        if pool.is_empty() {
            return Err(FederationError::NoEndpoints);
        }
        let mut rng = rand::thread_rng();
        let mut index = self.cursor.load(Ordering::Relaxed);
        if index >= pool.len() {
            index = rng.gen_range(0..pool.len());
        }
        self.cursor.store(rng.gen_range(0..pool.len()), Ordering::Relaxed);
        Ok(pool[index])
    }

    /// Reads to one endpoint, anything else to all of them keeping the last result
    fn proxy<T>(&self, query: &Query, op: impl Fn(&dyn Connection) -> Result<T>) -> Result<T> {
        self.assert_endpoints()?;
        if query.is_select() {
            return op(self.next_endpoint()?);
        }
        let mut last = None;
        for conn in self.endpoints() {
            last = Some(op(conn)?);
        }
        last.ok_or(FederationError::NoEndpoints)
    }

    /// Rebuild a table on every mirror from the primary's copy
    pub fn fullsync_table(&self, table: &str, schema_only: bool) -> Result<SyncReport> {
        let lock = self.table_lock.as_ref().ok_or_else(|| {
            FederationError::Config("a table lock must be set before resync".into())
        })?;
        let Some(_guard) = lock.guard(table)? else {
            return Err(FederationError::AlreadyReplicating(table.to_string()));
        };

        let primary = self.primary()?;
        let mirrors = self.mirrors();
        let schema = primary.table_info(table)?;

        for mirror in &mirrors {
            let generator = DialectGenerator::new(mirror.dialect()?);
            mirror.query_raw(&generator.drop_table(table, true))?;
            mirror.query_raw(&generator.create_table(&schema))?;
            for index in &schema.indexes {
                mirror.query_raw(&generator.create_index(
                    table,
                    &index.name,
                    &index.columns,
                    index.unique,
                ))?;
            }
        }
        tracing::info!(table, mirrors = mirrors.len(), "recreated table on mirrors");

        let mut report = SyncReport {
            table: table.to_string(),
            mirrors: mirrors.len(),
            rows: 0,
            blocks: 0,
            schema_only,
        };
        if schema_only {
            return Ok(report);
        }

        let key = schema.primary_key().unwrap_or("id").to_string();
        let count_query: Query = SelectQuery::from(table).count_all("count").into();
        let total = primary
            .query_row(&count_query)?
            .and_then(|row| row.get("count").and_then(Value::as_u64))
            .unwrap_or(0);

        let mut block_query = SelectQuery::from(table)
            .order_by(OrderBy::asc(FieldRef::new(&key)))
            .limit(self.sync_block_size);
        for column in &schema.columns {
            block_query = block_query.column(FieldRef::new(&column.name));
        }
        // Blobs are read back as base64 text
        let blob_columns: Vec<&str> = schema
            .columns
            .iter()
            .filter(|c| c.col_type.to_uppercase().contains("BLOB"))
            .map(|c| c.name.as_str())
            .collect();

        let mut offset = 0;
        while offset < total {
            tracing::info!(
                table,
                from = offset,
                to = offset + self.sync_block_size,
                total,
                "mirroring block"
            );
            let block = primary.query_set(&Query::Select(block_query.clone().offset(offset)))?;
            if block.is_empty() {
                break;
            }
            tracing::debug!(table, fetched = block.len(), "fetched block");

            for row in block {
                let insert: Query = blob_columns
                    .iter()
                    .fold(InsertQuery::into_table(table), |q, c| q.blob_column(c))
                    .row(row)
                    .into();
                for mirror in &mirrors {
                    let affected = mirror.query_count(&insert)?;
                    if affected != 1 {
                        tracing::error!(table, affected, "unexpected insert result during resync");
                        return Err(FederationError::RacyInsert {
                            table: table.to_string(),
                            affected,
                        });
                    }
                }
                report.rows += 1;
            }
            report.blocks += 1;
            offset += self.sync_block_size;
        }

        tracing::info!(table, rows = report.rows, blocks = report.blocks, "resync finished");
        Ok(report)
    }
}

impl MultiConnection for ReplicatedConnection {
    fn endpoints(&self) -> Vec<&dyn Connection> {
        self.primary
            .iter()
            .chain(self.mirrors.iter())
            .map(|c| c.as_ref())
            .collect()
    }

    fn default_endpoint(&self) -> Result<&dyn Connection> {
        self.primary()
    }

    fn table_lock(&self) -> Option<&ScopedLock> {
        self.table_lock.as_ref()
    }
}

impl Connection for ReplicatedConnection {
    fn connect(&self) -> Result<()> {
        self.connect_endpoints()
    }

    fn disconnect(&self) -> Result<()> {
        self.disconnect_endpoints()
    }

    fn is_connected(&self) -> bool {
        self.is_connected_where(false)
    }

    fn dialect(&self) -> Result<SqlDialect> {
        self.default_dialect()
    }

    fn table_info(&self, table: &str) -> Result<TableSchema> {
        self.default_table_info(table)
    }

    fn has_sequences(&self) -> bool {
        self.default_endpoint().map(|c| c.has_sequences()).unwrap_or(false)
    }

    fn obtain_sequence(&self, sequence: &str) -> Result<i64> {
        self.default_sequence(sequence)
    }

    fn query_raw(&self, sql: &str) -> Result<Vec<Row>> {
        self.assert_endpoints()?;
        let is_select = sql
            .trim_start()
            .get(..6)
            .map_or(false, |p| p.eq_ignore_ascii_case("select"));
        if is_select {
            return self.next_endpoint()?.query_raw(sql);
        }
        let mut last = Vec::new();
        for conn in self.endpoints() {
            last = conn.query_raw(sql)?;
        }
        Ok(last)
    }

    fn query(&self, query: &Query) -> Result<RowCursor> {
        self.proxy(query, |c| c.query(query))
    }

    fn query_row(&self, query: &Query) -> Result<Option<Row>> {
        self.proxy(query, |c| c.query_row(query))
    }

    fn query_set(&self, query: &Query) -> Result<Vec<Row>> {
        self.proxy(query, |c| c.query_set(query))
    }

    fn query_column(&self, query: &Query) -> Result<Vec<Value>> {
        self.proxy(query, |c| c.query_column(query))
    }

    fn query_num_rows(&self, query: &Query) -> Result<u64> {
        self.proxy(query, |c| c.query_num_rows(query))
    }

    /// Affected rows summed over every endpoint
    fn query_count(&self, query: &Query) -> Result<u64> {
        self.assert_endpoints()?;
        if query.is_select() {
            return self.next_endpoint()?.query_count(query);
        }
        let mut total = 0;
        for conn in self.endpoints() {
            total += conn.query_count(query)?;
        }
        Ok(total)
    }

    fn query_null(&self, query: &Query) -> Result<()> {
        self.proxy(query, |c| c.query_null(query))
    }

    fn begin(&self, level: Option<IsolationLevel>, mode: Option<AccessMode>) -> Result<()> {
        self.begin_endpoints(level, mode)
    }

    fn commit(&self) -> Result<()> {
        self.commit_endpoints()
    }

    fn rollback(&self) -> Result<()> {
        self.rollback_endpoints()
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction_where(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::locks::MemoryLockStore;
    use crate::engine::query::UpdateQuery;
    use crate::engine::testing::{row, CallLog, MockConnection};
    use serde_json::json;
    use std::sync::Arc;

    fn replica(log: &CallLog, mirrors: usize) -> (ReplicatedConnection, Vec<MockConnection>) {
        let mut db = ReplicatedConnection::new();
        let primary = MockConnection::new("p", log);
        db.set_primary(primary.boxed());
        let mut handles = vec![primary];
        for i in 0..mirrors {
            let m = MockConnection::new(&format!("m{}", i), log);
            db.add_mirror(m.boxed());
            handles.push(m);
        }
        (db, handles)
    }

    fn reads(handle: &MockConnection) -> usize {
        handle.queries().len()
    }

    #[test]
    fn test_writes_fan_out_in_order() {
        let log = CallLog::default();
        let (db, _) = replica(&log, 2);
        let q: Query = UpdateQuery::table("t").set("a", 1).into();
        assert_eq!(db.query_count(&q).unwrap(), 3);
        assert_eq!(log.entries(), vec!["p:count", "m0:count", "m1:count"]);
    }

    #[test]
    fn test_read_goes_to_one_endpoint() {
        let log = CallLog::default();
        let (db, _) = replica(&log, 2);
        db.query_set(&SelectQuery::from("t").into()).unwrap();
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn test_primary_only_policy() {
        let log = CallLog::default();
        let (mut db, _) = replica(&log, 2);
        db.set_read_policy(ReadPolicy::PrimaryOnly);
        for _ in 0..20 {
            db.query_set(&SelectQuery::from("t").into()).unwrap();
        }
        assert!(log.entries().iter().all(|e| e == "p:set"));
    }

    #[test]
    fn test_mirrors_only_never_reads_primary() {
        let log = CallLog::default();
        let (mut db, handles) = replica(&log, 2);
        db.set_read_policy(ReadPolicy::MirrorsOnly);
        for _ in 0..50 {
            db.query_set(&SelectQuery::from("t").into()).unwrap();
        }
        assert_eq!(reads(&handles[0]), 0);
        assert_eq!(reads(&handles[1]) + reads(&handles[2]), 50);
    }

    #[test]
    fn test_mirrors_only_without_mirrors() {
        let log = CallLog::default();
        let (mut db, _) = replica(&log, 0);
        db.set_read_policy(ReadPolicy::MirrorsOnly);
        let err = db.query_set(&SelectQuery::from("t").into()).unwrap_err();
        assert!(matches!(err, FederationError::NoEndpoints));
    }

    #[test]
    fn test_rotation_after_mirror_removal() {
        let log = CallLog::default();
        let (mut db, handles) = replica(&log, 3);
        let q: Query = SelectQuery::from("t").into();
        for _ in 0..30 {
            db.query_set(&q).unwrap();
        }

        // Cursor may point at index 3, which no longer exists
        db.remove_mirror(2).unwrap();
        let before = reads(&handles[3]);
        for _ in 0..100 {
            db.query_set(&q).unwrap();
        }
        assert_eq!(reads(&handles[3]), before);
        assert_eq!(reads(&handles[0]) + reads(&handles[1]) + reads(&handles[2]) + before, 130);
        assert!(db.remove_mirror(5).is_err());
    }

    #[test]
    fn test_no_endpoints() {
        let db = ReplicatedConnection::new();
        assert!(matches!(db.begin(None, None), Err(FederationError::NoEndpoints)));
        assert!(matches!(db.query_raw("SELECT 1"), Err(FederationError::NoEndpoints)));
    }

    #[test]
    fn test_raw_routing() {
        let log = CallLog::default();
        let (db, _) = replica(&log, 1);
        db.query_raw("select 1").unwrap();
        assert_eq!(log.entries().len(), 1);
        log.clear();
        db.query_raw("DELETE FROM t").unwrap();
        assert_eq!(log.entries(), vec!["p:raw:DELETE FROM t", "m0:raw:DELETE FROM t"]);
    }

    #[test]
    fn test_fullsync_requires_lock() {
        let log = CallLog::default();
        let (db, _) = replica(&log, 1);
        assert!(matches!(db.fullsync_table("t", false), Err(FederationError::Config(_))));
    }

    #[test]
    fn test_fullsync_contention_leaves_mirrors_untouched() {
        let log = CallLog::default();
        let (mut db, _) = replica(&log, 1);
        let lock = ScopedLock::new(Arc::new(MemoryLockStore::new()), "replica");
        db.set_table_lock(lock.clone());

        let _held = lock.guard("users").unwrap().unwrap();
        let err = db.fullsync_table("users", false).unwrap_err();
        assert!(matches!(err, FederationError::AlreadyReplicating(_)));
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_fullsync_schema_only_releases_lock() {
        let log = CallLog::default();
        let (mut db, _) = replica(&log, 1);
        let lock = ScopedLock::new(Arc::new(MemoryLockStore::new()), "replica");
        db.set_table_lock(lock.clone());

        let report = db.fullsync_table("users", true).unwrap();
        assert!(report.schema_only);
        assert_eq!(report.mirrors, 1);
        assert_eq!(
            log.entries(),
            vec![
                "p:table_info",
                "m0:raw:DROP TABLE IF EXISTS \"users\";",
                "m0:raw:CREATE TABLE \"users\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT\n);",
            ]
        );
        assert!(lock.acquire("users").unwrap());
    }

    #[test]
    fn test_fullsync_racy_insert() {
        let log = CallLog::default();
        let mut db = ReplicatedConnection::new();
        let primary = MockConnection::new("p", &log).with_rows(vec![row(&[("count", json!(1))])]);
        let mirror = MockConnection::new("m", &log).with_affected(0);
        db.set_primary(primary.boxed());
        db.add_mirror(mirror.boxed());
        let lock = ScopedLock::new(Arc::new(MemoryLockStore::new()), "replica");
        db.set_table_lock(lock.clone());

        let err = db.fullsync_table("users", false).unwrap_err();
        assert_eq!(err.to_string(), "0 rows affected: racy or insane insert into \"users\"");
        // released on the error path too
        assert!(lock.acquire("users").unwrap());
    }
}
