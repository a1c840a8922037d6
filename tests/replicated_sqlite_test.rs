mod common;

use common::{count_rows, memory_db, row};
use dbfed::engine::adapter::sqlite::SqliteConnection;
use dbfed::engine::adapter::Connection;
use dbfed::engine::federation::{ReadPolicy, ReplicatedConnection};
use dbfed::engine::locks::{MemoryLockStore, ScopedLock};
use dbfed::engine::query::{InsertQuery, OrderBy, Query, SelectQuery};
use dbfed::FederationError;
use serde_json::json;
use std::sync::Arc;

const ACCOUNTS_DDL: &str = "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER);
CREATE INDEX idx_accounts_owner ON accounts (owner);";

fn replicated_accounts(rows: i64, block_size: u64) -> (ReplicatedConnection, ScopedLock) {
    let primary = memory_db(ACCOUNTS_DDL);
    for id in 1..=rows {
        let insert: Query = InsertQuery::into_table("accounts")
            .row(row(&[
                ("id", json!(id)),
                ("owner", json!(format!("owner-{}", id))),
                ("balance", json!(id * 10)),
            ]))
            .into();
        primary.query_count(&insert).unwrap();
    }

    // Mirrors start out of date: one empty, one missing the table entirely
    let stale = memory_db("CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT);");
    let blank = SqliteConnection::memory();

    let lock = ScopedLock::new(Arc::new(MemoryLockStore::new()), "test:accounts");
    let mut db = ReplicatedConnection::new();
    db.set_primary(Box::new(primary));
    db.add_mirror(Box::new(stale));
    db.add_mirror(Box::new(blank));
    db.set_table_lock(lock.clone());
    db.set_sync_block_size(block_size);
    db.connect().unwrap();
    (db, lock)
}

#[test]
fn test_fullsync_copies_rows_in_blocks() {
    let (db, _) = replicated_accounts(7, 3);

    let report = db.fullsync_table("accounts", false).unwrap();
    assert_eq!(report.rows, 7);
    assert_eq!(report.blocks, 3);
    assert_eq!(report.mirrors, 2);

    for mirror in db.mirrors() {
        assert_eq!(count_rows(mirror, "accounts"), 7);
        let schema = mirror.table_info("accounts").unwrap();
        assert_eq!(schema.primary_key(), Some("id"));
        assert!(schema.indexes.iter().any(|i| i.name == "idx_accounts_owner"));

        let last: Query = SelectQuery::from("accounts")
            .column("balance")
            .order_by(OrderBy::desc("id"))
            .limit(1)
            .into();
        assert_eq!(mirror.query_row(&last).unwrap().unwrap()["balance"], json!(70));
    }
}

#[test]
fn test_schema_only_sync_leaves_mirrors_empty() {
    let (db, _) = replicated_accounts(4, 10);
    let report = db.fullsync_table("accounts", true).unwrap();
    assert!(report.schema_only);
    assert_eq!(report.rows, 0);
    for mirror in db.mirrors() {
        assert_eq!(count_rows(mirror, "accounts"), 0);
    }
}

#[test]
fn test_held_lock_blocks_resync() {
    let (db, lock) = replicated_accounts(2, 10);
    assert!(lock.acquire("accounts").unwrap());

    let err = db.fullsync_table("accounts", false).unwrap_err();
    assert!(matches!(err, FederationError::AlreadyReplicating(_)));

    lock.force_drop("accounts").unwrap();
    assert_eq!(db.fullsync_table("accounts", false).unwrap().rows, 2);
    // Released after the run
    assert!(lock.acquire("accounts").unwrap());
}

#[test]
fn test_fullsync_keeps_blobs_binary() {
    let primary = memory_db(
        "CREATE TABLE files (id INTEGER PRIMARY KEY, name TEXT, data BLOB);
         INSERT INTO files VALUES (1, 'a', X'0102FF'), (2, 'b', NULL), (3, 'c', 'plain');",
    );
    let mut db = ReplicatedConnection::new();
    db.set_primary(Box::new(primary));
    db.add_mirror(Box::new(SqliteConnection::memory()));
    db.set_table_lock(ScopedLock::new(Arc::new(MemoryLockStore::new()), "test:files"));
    db.connect().unwrap();

    assert_eq!(db.fullsync_table("files", false).unwrap().rows, 3);

    let mirror = db.mirrors()[0];
    let rows = mirror
        .query_raw("SELECT typeof(data) AS kind, hex(data) AS hex FROM files ORDER BY id")
        .unwrap();
    assert_eq!((&rows[0]["kind"], &rows[0]["hex"]), (&json!("blob"), &json!("0102FF")));
    assert_eq!(rows[1]["kind"], json!("null"));
    assert_eq!(rows[2]["kind"], json!("text"));
}

#[test]
fn test_writes_fan_out_after_sync() {
    let (mut db, _) = replicated_accounts(3, 10);
    db.fullsync_table("accounts", false).unwrap();
    db.set_read_policy(ReadPolicy::MirrorsOnly);

    let insert: Query = InsertQuery::into_table("accounts")
        .row(row(&[("id", json!(4)), ("owner", json!("late")), ("balance", json!(1))]))
        .into();
    assert_eq!(db.query_count(&insert).unwrap(), 3);

    assert_eq!(count_rows(db.primary().unwrap(), "accounts"), 4);
    for mirror in db.mirrors() {
        assert_eq!(count_rows(mirror, "accounts"), 4);
    }

    let read: Query = SelectQuery::from("accounts").column("owner").into();
    assert_eq!(db.query_set(&read).unwrap().len(), 4);
}
