//! Sharded composition
//!
//! Routes each query through the sharding strategy of its table. A query that
//! lands on one shard runs there unchanged (apart from the physical table
//! name). Reads that span shards are rewritten, run on every shard in
//! registration order and merged.

use serde_json::Value;
use std::collections::HashMap;

use super::merge;
use super::MultiConnection;
use crate::engine::adapter::{
    first_column, AccessMode, Connection, IsolationLevel, Row, RowCursor, SqlDialect, TableSchema,
};
use crate::engine::error::{FederationError, Result};
use crate::engine::locks::ScopedLock;
use crate::engine::query::{InsertQuery, Query};
use crate::engine::sharding::{ShardId, ShardingStrategy};

/// Per-shard dispatch list, in shard registration order
pub type ShardPlan = Vec<(ShardId, Query)>;

#[derive(Default)]
pub struct ShardedConnection {
    shards: Vec<(ShardId, Box<dyn Connection>)>,
    strategies: HashMap<String, Box<dyn ShardingStrategy>>,
    table_lock: Option<ScopedLock>,
}

impl ShardedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_shard(&mut self, id: ShardId, conn: Box<dyn Connection>) -> Result<()> {
        if self.shards.iter().any(|(s, _)| *s == id) {
            return Err(FederationError::DuplicateShard(id));
        }
        self.shards.push((id, conn));
        Ok(())
    }

    /// Register the strategy for its table, replacing any previous one
    pub fn set_sharded_table(&mut self, strategy: Box<dyn ShardingStrategy>) {
        self.strategies.insert(strategy.table().to_string(), strategy);
    }

    pub fn set_table_lock(&mut self, lock: ScopedLock) {
        self.table_lock = Some(lock);
    }

    pub fn shard(&self, id: ShardId) -> Result<&dyn Connection> {
        self.shards
            .iter()
            .find(|(s, _)| *s == id)
            .map(|(_, c)| c.as_ref())
            .ok_or(FederationError::ShardNotFound(id))
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|(id, _)| *id).collect()
    }

    pub fn strategy_for(&self, table: &str) -> Result<&dyn ShardingStrategy> {
        self.strategies
            .get(table)
            .map(|s| s.as_ref())
            .ok_or_else(|| FederationError::NoStrategy(table.to_string()))
    }

    /// Sharded table names, sorted
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        tables.sort_unstable();
        tables
    }

    fn position(&self, id: ShardId) -> usize {
        self.shards.iter().position(|(s, _)| *s == id).unwrap_or(usize::MAX)
    }

    /// Resolve target shards and rewrite the query for each of them
    pub fn plan(&self, query: &Query) -> Result<ShardPlan> {
        let strategy = self.strategy_for(query.table())?;

        let mut routed: ShardPlan = match query {
            Query::Select(_) | Query::Delete(_) => strategy
                .route_by_predicate(query.predicate())
                .into_iter()
                .map(|id| (id, query.clone()))
                .collect(),
            Query::Insert(insert) => {
                let mut split: Vec<(ShardId, InsertQuery)> = Vec::new();
                for row in &insert.rows {
                    let id = strategy.route_by_field_value(row)?;
                    match split.iter_mut().find(|(s, _)| *s == id) {
                        Some((_, part)) => part.rows.push(row.clone()),
                        None => split.push((id, InsertQuery::into_table(&insert.table).row(row.clone()))),
                    }
                }
                split.into_iter().map(|(id, q)| (id, Query::Insert(q))).collect()
            }
            Query::Update(update) => match strategy.route_by_field_value(&update.set) {
                Ok(id) => vec![(id, query.clone())],
                Err(FederationError::MissingShardingKey { .. }) => strategy
                    .route_by_predicate(query.predicate())
                    .into_iter()
                    .map(|id| (id, query.clone()))
                    .collect(),
                Err(e) => return Err(e),
            },
        };

        if routed.is_empty() {
            return Err(FederationError::Unroutable(query.table().to_string()));
        }
        for (id, _) in &routed {
            self.shard(*id)?;
        }
        routed.sort_by_key(|(id, _)| self.position(*id));

        tracing::debug!(
            table = %query.table(),
            kind = query.kind(),
            shards = ?routed.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            "routed query"
        );

        Ok(routed
            .into_iter()
            .map(|(id, q)| {
                let physical = strategy.physical_table(id);
                (id, q.retarget(&physical))
            })
            .collect())
    }

    fn select_set(&self, query: &Query) -> Result<Vec<Row>> {
        let Query::Select(select) = query else {
            return Err(FederationError::Unsupported("only SELECT queries are supported".into()));
        };
        let plan = self.plan(query)?;
        if let [(id, single)] = plan.as_slice() {
            return self.shard(*id)?.query_set(single);
        }

        let mut rows = Vec::new();
        for (id, shard_query) in &plan {
            if let Query::Select(shard_select) = shard_query {
                let rewritten = Query::Select(merge::shard_select(shard_select));
                rows.extend(self.shard(*id)?.query_set(&rewritten)?);
            }
        }
        merge::merge_rows(select, rows)
    }

    fn reject_select(query: &Query) -> Result<()> {
        if query.is_select() {
            return Err(FederationError::Unsupported(
                "only INSERT, UPDATE and DELETE queries are supported".into(),
            ));
        }
        Ok(())
    }
}

impl MultiConnection for ShardedConnection {
    fn endpoints(&self) -> Vec<&dyn Connection> {
        self.shards.iter().map(|(_, c)| c.as_ref()).collect()
    }

    fn default_endpoint(&self) -> Result<&dyn Connection> {
        self.shards
            .first()
            .map(|(_, c)| c.as_ref())
            .ok_or(FederationError::NoEndpoints)
    }

    fn table_lock(&self) -> Option<&ScopedLock> {
        self.table_lock.as_ref()
    }
}

impl Connection for ShardedConnection {
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

    /// Only session-level `SET` statements, sent to every shard
    fn query_raw(&self, sql: &str) -> Result<Vec<Row>> {
        let is_set = sql.get(..4).map_or(false, |p| p.eq_ignore_ascii_case("set "));
        if !is_set {
            return Err(FederationError::Unsupported("can not parse raw query string".into()));
        }
        self.assert_endpoints()?;
        for (_, shard) in &self.shards {
            shard.query_raw(sql)?;
        }
        Ok(Vec::new())
    }

    fn query(&self, query: &Query) -> Result<RowCursor> {
        let plan = self.plan(query)?;
        match plan.as_slice() {
            [(id, single)] => self.shard(*id)?.query(single),
            _ => Err(FederationError::SingleResource),
        }
    }

    fn query_row(&self, query: &Query) -> Result<Option<Row>> {
        Ok(self.select_set(query)?.into_iter().next())
    }

    fn query_set(&self, query: &Query) -> Result<Vec<Row>> {
        self.select_set(query)
    }

    fn query_column(&self, query: &Query) -> Result<Vec<Value>> {
        Ok(first_column(self.select_set(query)?))
    }

    fn query_num_rows(&self, query: &Query) -> Result<u64> {
        if !query.is_select() {
            return Err(FederationError::Unsupported("only SELECT queries are supported".into()));
        }
        let plan = self.plan(query)?;
        // Grouped, aggregated or paged results only have a count after merging
        let merged = match query {
            Query::Select(select) => {
                select.has_aggregates()
                    || !select.group_by.is_empty()
                    || select.limit.is_some()
                    || select.offset.is_some()
            }
            _ => false,
        };
        if merged && plan.len() > 1 {
            return Ok(self.select_set(query)?.len() as u64);
        }
        let mut total = 0;
        for (id, q) in plan {
            total += self.shard(id)?.query_num_rows(&q)?;
        }
        Ok(total)
    }

    fn query_count(&self, query: &Query) -> Result<u64> {
        Self::reject_select(query)?;
        let mut total = 0;
        for (id, q) in self.plan(query)? {
            total += self.shard(id)?.query_count(&q)?;
        }
        Ok(total)
    }

    fn query_null(&self, query: &Query) -> Result<()> {
        Self::reject_select(query)?;
        for (id, q) in self.plan(query)? {
            self.shard(id)?.query_null(&q)?;
        }
        Ok(())
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
