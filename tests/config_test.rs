mod common;

use common::{count_rows, file_db, row};
use dbfed::engine::adapter::Connection;
use dbfed::engine::config::FederationConfig;
use dbfed::engine::locks::{FileLockStore, ScopedLock};
use dbfed::engine::query::{InsertQuery, Query, SelectQuery};
use dbfed::FederationError;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const USERS_DDL: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);";

fn write_config(dir: &Path) -> std::path::PathBuf {
    file_db(&dir.join("low.db"), USERS_DDL);
    file_db(&dir.join("high.db"), USERS_DDL);
    file_db(&dir.join("primary.db"), USERS_DDL);

    let config = json!({
        "links": {
            "low": { "type": "sqlite", "path": "low.db" },
            "high": { "type": "sqlite", "path": "high.db" },
            "primary": { "type": "sqlite", "path": "primary.db" },
            "mirror": { "type": "sqlite", "path": "mirror.db" },
            "scratch": { "type": "sqliteMemory" }
        },
        "default": "users",
        "sharded": [{
            "name": "users",
            "shards": [{ "id": 1, "link": "low" }, { "id": 2, "link": "high" }],
            "tables": [{
                "table": "users",
                "key": "id",
                "ranges": [
                    { "shard": 1, "min": null, "max": 99 },
                    { "shard": 2, "min": 100, "max": null }
                ]
            }]
        }],
        "replicated": [{
            "name": "accounts",
            "primary": "primary",
            "mirrors": ["mirror"],
            "readPolicy": "primaryOnly",
            "syncBlockSize": 2
        }],
        "locks": { "type": "file", "dir": "locks", "namespace": "it" }
    });
    let path = dir.join("federation.json");
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

#[test]
fn test_config_builds_registry() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = write_config(dir.path());

    let config = FederationConfig::load(&FederationConfig::locate(Some(path.as_path()))?)?;
    let mut ctx = config.build()?;
    let registry = &ctx.registry;

    assert_eq!(registry.names(), vec!["accounts", "scratch", "users"]);
    assert_eq!(registry.default_name(), Some("users"));
    assert_eq!(registry.get("accounts")?.kind(), "replicated");

    // Default link is the sharded composition
    let users = registry.resolve(None, true)?;
    let insert: Query = InsertQuery::into_table("users")
        .row(row(&[("id", json!(5)), ("name", json!("a"))]))
        .row(row(&[("id", json!(500)), ("name", json!("b"))]))
        .into();
    assert_eq!(users.query_count(&insert)?, 2);

    let sharded = registry.sharded("users")?;
    assert_eq!(count_rows(sharded.shard(1)?, "users"), 1);
    assert_eq!(count_rows(sharded.shard(2)?, "users"), 1);

    let count: Query = SelectQuery::from("users").count_all("n").into();
    assert_eq!(users.query_row(&count)?.unwrap()["n"], json!(2));

    ctx.registry.shutdown_all()?;
    Ok(())
}

#[test]
fn test_file_locks_are_shared_between_stores() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = write_config(dir.path());
    let ctx = FederationConfig::load(&path)?.build()?;

    let accounts = ctx.registry.replicated("accounts")?;
    accounts.connect()?;
    let primary = accounts.primary()?;
    primary.query_count(
        &InsertQuery::into_table("users")
            .row(row(&[("id", json!(1)), ("name", json!("x"))]))
            .row(row(&[("id", json!(2)), ("name", json!("y"))]))
            .row(row(&[("id", json!(3)), ("name", json!("z"))]))
            .into(),
    )?;

    // Another process would open its own store over the same directory
    let other = ScopedLock::new(Arc::new(FileLockStore::new(&dir.path().join("locks"))), "it:accounts");
    assert!(other.acquire("users")?);
    assert!(matches!(
        accounts.fullsync_table("users", false),
        Err(FederationError::AlreadyReplicating(_))
    ));

    ctx.table_lock("accounts").force_drop("users")?;
    let report = accounts.fullsync_table("users", false)?;
    assert_eq!((report.rows, report.blocks), (3, 2));
    assert_eq!(count_rows(accounts.mirrors()[0], "users"), 3);
    Ok(())
}

#[test]
fn test_disconnect_keeps_locks_of_other_stores() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = write_config(dir.path());
    let ctx = FederationConfig::load(&path)?.build()?;

    let other = ScopedLock::new(Arc::new(FileLockStore::new(&dir.path().join("locks"))), "it:accounts");
    let held = other.guard("users")?;
    assert!(held.is_some());

    let accounts = ctx.registry.replicated("accounts")?;
    accounts.connect()?;
    accounts.disconnect()?;
    accounts.connect()?;

    assert!(matches!(
        accounts.fullsync_table("users", true),
        Err(FederationError::AlreadyReplicating(_))
    ));
    assert!(!ctx.table_lock("accounts").acquire("users")?);
    Ok(())
}

#[test]
fn test_unknown_shard_link_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("federation.json");
    fs::write(
        &path,
        r#"{ "sharded": [{ "name": "s", "shards": [{ "id": 1, "link": "nope" }] }] }"#,
    )?;
    let err = FederationConfig::load(&path)?.build().err().map(|e| e.kind());
    assert_eq!(err, Some(dbfed::engine::error::ErrorKind::Configuration));
    Ok(())
}
