//! Range-based sharding
//!
//! Each shard owns a closed integer interval of the sharding key. Ranges may
//! overlap; reads go to every intersecting shard and writes to the first shard
//! whose range contains the key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Range, ShardId, ShardingStrategy};
use crate::engine::adapter::Row;
use crate::engine::error::{FederationError, Result};
use crate::engine::query::{CompareOp, FieldRef, Logic, Predicate};

/// One entry of the shard map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardRange {
    pub shard: ShardId,
    #[serde(flatten)]
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_table: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RangeSharding {
    table: String,
    key: String,
    shards: Vec<ShardRange>,
}

impl RangeSharding {
    pub fn new(table: &str, key: &str) -> Self {
        Self { table: table.to_string(), key: key.to_string(), shards: Vec::new() }
    }

    /// Append a shard range; order of calls is the lookup order for writes
    pub fn add_range(&mut self, shard: ShardId, range: Range) -> Result<()> {
        if self.shards.iter().any(|s| s.shard == shard) {
            return Err(FederationError::DuplicateShard(shard));
        }
        let range = Range::try_new(range.min, range.max)?;
        self.shards.push(ShardRange { shard, range, physical_table: None });
        Ok(())
    }

    pub fn with_range(mut self, shard: ShardId, min: Option<i64>, max: Option<i64>) -> Result<Self> {
        self.add_range(shard, Range { min, max })?;
        Ok(self)
    }

    /// Store this shard's slice of the table under another name
    pub fn with_physical_table(mut self, shard: ShardId, physical: &str) -> Result<Self> {
        let entry = self
            .shards
            .iter_mut()
            .find(|s| s.shard == shard)
            .ok_or(FederationError::ShardNotFound(shard))?;
        entry.physical_table = Some(physical.to_string());
        Ok(self)
    }

    pub fn ranges(&self) -> &[ShardRange] {
        &self.shards
    }

    /// First configured shard whose range contains the value
    pub fn choose_shard(&self, value: i64) -> Result<ShardId> {
        self.shards
            .iter()
            .find(|s| s.range.contains(value))
            .map(|s| s.shard)
            .ok_or_else(|| FederationError::NoShardForValue {
                key: self.key.clone(),
                value: value.to_string(),
            })
    }

    /// Every shard whose range intersects the given one
    pub fn choose_shards(&self, range: &Range) -> Vec<ShardId> {
        if range.is_empty() {
            return Vec::new();
        }
        self.shards
            .iter()
            .filter(|s| s.range.intersects(range))
            .map(|s| s.shard)
            .collect()
    }

    fn binds_key(&self, field: &FieldRef) -> bool {
        field.name == self.key && field.table.as_deref().map_or(true, |t| t == self.table)
    }

    /// Key range implied by a predicate tree
    pub fn derive_range(&self, predicate: &Predicate) -> Range {
        match predicate {
            Predicate::Comparison { field, op, value } => {
                if !self.binds_key(field) {
                    return Range::UNBOUNDED;
                }
                let Some(v) = value.as_i64() else {
                    return Range::UNBOUNDED;
                };
                match op {
                    CompareOp::Eq => Range::point(v),
                    CompareOp::Gt => Range::at_least(v.saturating_add(1)),
                    CompareOp::Gte => Range::at_least(v),
                    CompareOp::Lt => Range::at_most(v.saturating_sub(1)),
                    CompareOp::Lte => Range::at_most(v),
                    _ => Range::UNBOUNDED,
                }
            }
            Predicate::Conjunction { logic: Logic::And, children } => children
                .iter()
                .fold(Range::UNBOUNDED, |acc, child| acc.intersect(&self.derive_range(child))),
            Predicate::Conjunction { logic: Logic::Or, children } => {
                let derived: Vec<Range> = children.iter().map(|c| self.derive_range(c)).collect();
                let mut live = derived.iter().filter(|r| !r.is_empty());
                match live.next() {
                    Some(first) => live.fold(*first, |acc, r| acc.hull(r)),
                    // Every branch contradictory, or no branches at all
                    None => derived.first().copied().unwrap_or(Range::UNBOUNDED),
                }
            }
        }
    }

    fn key_value(&self, value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl ShardingStrategy for RangeSharding {
    fn table(&self) -> &str {
        &self.table
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.shard).collect()
    }

    fn route_by_predicate(&self, predicate: Option<&Predicate>) -> Vec<ShardId> {
        match predicate {
            None => self.shard_ids(),
            Some(p) => {
                let range = self.derive_range(p);
                let shards = self.choose_shards(&range);
                tracing::debug!(table = %self.table, %range, ?shards, "routed by predicate");
                shards
            }
        }
    }

    fn route_by_field_value(&self, fields: &Row) -> Result<ShardId> {
        let value = match fields.get(&self.key) {
            None | Some(Value::Null) => {
                return Err(FederationError::MissingShardingKey {
                    table: self.table.clone(),
                    key: self.key.clone(),
                })
            }
            Some(v) => v,
        };
        let key = self.key_value(value).ok_or_else(|| FederationError::NoShardForValue {
            key: self.key.clone(),
            value: value.to_string(),
        })?;
        self.choose_shard(key)
    }

    fn physical_table(&self, shard: ShardId) -> String {
        self.shards
            .iter()
            .find(|s| s.shard == shard)
            .and_then(|s| s.physical_table.clone())
            .unwrap_or_else(|| self.table.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_shards() -> RangeSharding {
        RangeSharding::new("users", "id")
            .with_range(1, Some(0), Some(1000))
            .unwrap()
            .with_range(2, Some(1001), Some(9999))
            .unwrap()
    }

    fn fields(id: Value) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), id);
        row.insert("name".into(), json!("x"));
        row
    }

    #[test]
    fn test_point_routing() {
        let s = two_shards();
        assert_eq!(s.route_by_predicate(Some(&Predicate::eq("id", 500))), vec![1]);
        assert_eq!(s.route_by_predicate(Some(&Predicate::eq("id", 1500))), vec![2]);
        assert_eq!(s.route_by_predicate(Some(&Predicate::eq("id", 20000))), Vec::<ShardId>::new());
    }

    #[test]
    fn test_range_spanning_both() {
        let s = two_shards();
        let p = Predicate::and(vec![Predicate::gte("id", 900), Predicate::lte("id", 1100)]);
        assert_eq!(s.route_by_predicate(Some(&p)), vec![1, 2]);
        assert_eq!(s.choose_shards(&Range { min: Some(900), max: Some(1100) }), vec![1, 2]);
    }

    #[test]
    fn test_strict_bounds_are_exact() {
        let s = two_shards();
        assert_eq!(s.route_by_predicate(Some(&Predicate::gt("id", 1000))), vec![2]);
        assert_eq!(s.route_by_predicate(Some(&Predicate::lt("id", 1001))), vec![1]);
    }

    #[test]
    fn test_and_bounds_take_tightest() {
        let s = two_shards();
        let p = Predicate::and(vec![
            Predicate::gte("id", 10),
            Predicate::gte("id", 1200),
            Predicate::lte("id", 5000),
            Predicate::eq("name", "x"),
        ]);
        assert_eq!(s.derive_range(&p), Range { min: Some(1200), max: Some(5000) });
    }

    #[test]
    fn test_or_with_unbound_branch_hits_all() {
        let s = two_shards();
        let p = Predicate::or(vec![Predicate::eq("id", 5), Predicate::eq("name", "x")]);
        assert_eq!(s.route_by_predicate(Some(&p)), vec![1, 2]);
    }

    #[test]
    fn test_or_covers_both_branches() {
        let s = two_shards();
        let p = Predicate::or(vec![Predicate::eq("id", 5), Predicate::eq("id", 5000)]);
        assert_eq!(s.route_by_predicate(Some(&p)), vec![1, 2]);
        let p = Predicate::or(vec![Predicate::eq("id", 5), Predicate::eq("id", 7)]);
        assert_eq!(s.route_by_predicate(Some(&p)), vec![1]);
    }

    #[test]
    fn test_foreign_qualifier_does_not_bind() {
        let s = two_shards();
        assert_eq!(s.route_by_predicate(Some(&Predicate::eq("orders.id", 5))), vec![1, 2]);
        assert_eq!(s.route_by_predicate(Some(&Predicate::eq("users.id", 5))), vec![1]);
        assert_eq!(s.route_by_predicate(Some(&Predicate::ne("id", 5))), vec![1, 2]);
    }

    #[test]
    fn test_contradiction_routes_nowhere() {
        let s = two_shards();
        let p = Predicate::and(vec![Predicate::gt("id", 50), Predicate::lt("id", 10)]);
        assert!(s.route_by_predicate(Some(&p)).is_empty());
    }

    #[test]
    fn test_route_by_field_value() {
        let s = two_shards();
        assert_eq!(s.route_by_field_value(&fields(json!(1500))).unwrap(), 2);
        assert_eq!(s.route_by_field_value(&fields(json!("42"))).unwrap(), 1);

        let err = s.route_by_field_value(&Row::new()).unwrap_err();
        assert!(matches!(err, FederationError::MissingShardingKey { .. }));
        let err = s.route_by_field_value(&fields(json!(-1))).unwrap_err();
        assert_eq!(err.to_string(), "no shard for id=-1");
    }

    #[test]
    fn test_overlap_first_wins_for_writes() {
        let s = RangeSharding::new("t", "id")
            .with_range(7, Some(0), Some(100))
            .unwrap()
            .with_range(3, Some(50), None)
            .unwrap();
        assert_eq!(s.choose_shard(60).unwrap(), 7);
        assert_eq!(s.route_by_predicate(Some(&Predicate::eq("id", 60))), vec![7, 3]);
    }

    #[test]
    fn test_physical_table_and_duplicates() {
        let s = two_shards().with_physical_table(2, "users_b").unwrap();
        assert_eq!(s.physical_table(1), "users");
        assert_eq!(s.physical_table(2), "users_b");
        assert!(two_shards().with_range(1, None, None).is_err());
        assert!(two_shards().with_physical_table(9, "x").is_err());
    }
}
