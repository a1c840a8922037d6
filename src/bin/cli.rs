//! dbfed CLI - entry point for the `dbfed` binary
//!
//! Loads a federation config and runs operator commands against it.

use anyhow::{bail, Context};
use clap::Parser;
use dbfed::engine::{
    adapter::Connection,
    cli::formatter::{format_duration, format_ids, format_state, CliFormatter},
    cli::{Cli, Commands, OutputFormat},
    config::{FederationConfig, FederationContext},
    connections::Link,
    query::{Predicate, Query, SelectQuery},
    sharding::ShardId,
};
use serde_json::json;
use std::time::Instant;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let json_output = cli.format == OutputFormat::Json;
    let config_path = FederationConfig::locate(cli.config.as_deref())?;
    let config = FederationConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let mut ctx = config.build().context("building links")?;

    let result = match cli.command {
        Commands::Status => cmd_status(&ctx, json_output),
        Commands::Route { link, table, value, min, max } => {
            cmd_route(&ctx, &link, &table, value, min, max, json_output)
        }
        Commands::Count { link, table } => cmd_count(&ctx, link.as_deref(), &table, json_output),
        Commands::Sync { link, table, schema_only } => {
            cmd_sync(&ctx, &link, &table, schema_only, json_output)
        }
        Commands::Unlock { link, table, all } => {
            cmd_unlock(&ctx, &link, table.as_deref(), all, json_output)
        }
    };

    ctx.registry.shutdown_all()?;
    result
}

fn cmd_status(ctx: &FederationContext, json: bool) -> anyhow::Result<()> {
    let registry = &ctx.registry;
    let mut links = Vec::new();

    for name in registry.names() {
        let link = registry.get(name)?;
        let connected = link.as_connection().is_connected();
        let detail = match link {
            Link::Single(_) => json!({}),
            Link::Sharded(sharded) => json!({
                "shards": sharded.shard_ids(),
                "tables": sharded.tables(),
            }),
            Link::Replicated(replicated) => json!({
                "mirrors": replicated.mirrors().len(),
                "readPolicy": replicated.read_policy(),
            }),
        };
        links.push(json!({
            "name": name,
            "kind": link.kind(),
            "connected": connected,
            "default": registry.default_name() == Some(name),
            "detail": detail,
        }));
    }

    if json {
        CliFormatter::json(&json!({ "links": links, "lockNamespace": ctx.lock.namespace() }));
        return Ok(());
    }

    CliFormatter::header("Federation");
    CliFormatter::kv("Lock namespace", ctx.lock.namespace());
    CliFormatter::kv("Default", registry.default_name().unwrap_or("(none)"));
    if links.is_empty() {
        CliFormatter::warning("No links configured");
        return Ok(());
    }

    println!();
    CliFormatter::table_header(&["Name", "Kind", "State", "Detail"]);
    for name in registry.names() {
        let link = registry.get(name)?;
        let detail = match link {
            Link::Single(_) => String::new(),
            Link::Sharded(sharded) => format!(
                "shards [{}] tables [{}]",
                format_ids(&sharded.shard_ids()),
                sharded.tables().join(", ")
            ),
            Link::Replicated(replicated) => format!(
                "{} mirror(s), {:?}",
                replicated.mirrors().len(),
                replicated.read_policy()
            ),
        };
        let state = format_state(link.as_connection().is_connected());
        CliFormatter::table_row(&[name, link.kind(), state.as_str(), detail.as_str()]);
    }
    Ok(())
}

fn cmd_route(
    ctx: &FederationContext,
    link: &str,
    table: &str,
    value: Option<i64>,
    min: Option<i64>,
    max: Option<i64>,
    json: bool,
) -> anyhow::Result<()> {
    let sharded = ctx.registry.sharded(link)?;
    let strategy = sharded.strategy_for(table)?;
    let key = strategy.key();

    let predicate = match (value, min, max) {
        (Some(v), _, _) => Some(Predicate::eq(key, v)),
        (None, None, None) => None,
        (None, min, max) => {
            let bounds: Vec<Predicate> = min
                .map(|m| Predicate::gte(key, m))
                .into_iter()
                .chain(max.map(|m| Predicate::lte(key, m)))
                .collect();
            Some(Predicate::and(bounds))
        }
    };
    let shards: Vec<ShardId> = strategy.route_by_predicate(predicate.as_ref());

    if json {
        let targets: Vec<_> = shards
            .iter()
            .map(|id| json!({ "shard": id, "table": strategy.physical_table(*id) }))
            .collect();
        CliFormatter::json(&json!({ "table": table, "key": key, "shards": targets }));
        return Ok(());
    }

    if shards.is_empty() {
        CliFormatter::warning(&format!("No shard of '{}' covers that key", table));
        return Ok(());
    }
    CliFormatter::info(&format!("{}.{} routes to shard(s) {}", table, key, format_ids(&shards)));
    for id in &shards {
        CliFormatter::item(&format!("shard {} → {}", id, strategy.physical_table(*id)));
    }
    Ok(())
}

fn cmd_count(
    ctx: &FederationContext,
    link: Option<&str>,
    table: &str,
    json: bool,
) -> anyhow::Result<()> {
    let conn = ctx.registry.resolve(link, true)?;
    let query: Query = SelectQuery::from(table).count_all("count").into();
    let row = conn.query_row(&query)?.unwrap_or_default();
    let count = row.get("count").and_then(|v| v.as_u64()).unwrap_or(0);

    if json {
        CliFormatter::json(&json!({ "table": table, "count": count }));
    } else {
        CliFormatter::kv(table, &count.to_string());
    }
    Ok(())
}

fn cmd_sync(
    ctx: &FederationContext,
    link: &str,
    table: &str,
    schema_only: bool,
    json: bool,
) -> anyhow::Result<()> {
    let replicated = ctx.registry.replicated(link)?;
    replicated.connect()?;

    let started = Instant::now();
    let report = replicated
        .fullsync_table(table, schema_only)
        .with_context(|| format!("resyncing '{}' on '{}'", table, link))?;
    let elapsed = started.elapsed().as_secs();

    if json {
        CliFormatter::json(&json!({ "report": report, "elapsedSecs": elapsed }));
        return Ok(());
    }

    if schema_only {
        CliFormatter::success(&format!(
            "Recreated '{}' on {} mirror(s)",
            report.table, report.mirrors
        ));
    } else {
        CliFormatter::success(&format!(
            "Copied {} row(s) of '{}' to {} mirror(s) in {} block(s)",
            report.rows, report.table, report.mirrors, report.blocks
        ));
    }
    CliFormatter::kv("Elapsed", &format_duration(elapsed));
    Ok(())
}

fn cmd_unlock(
    ctx: &FederationContext,
    link: &str,
    table: Option<&str>,
    all: bool,
    json: bool,
) -> anyhow::Result<()> {
    if !ctx.registry.has(link) {
        bail!("no link named '{}'", link);
    }
    let lock = ctx.table_lock(link);

    let dropped = match (table, all) {
        (_, true) => lock.clean()?,
        (Some(table), false) => {
            lock.force_drop(table)?;
            1
        }
        (None, false) => bail!("pass --table or --all"),
    };

    if json {
        CliFormatter::json(&json!({ "namespace": lock.namespace(), "dropped": dropped }));
    } else {
        CliFormatter::success(&format!("Dropped {} lock(s) in '{}'", dropped, lock.namespace()));
    }
    Ok(())
}
