//! Sharding strategies
//!
//! A strategy maps a table plus a predicate tree (reads, deletes) or a set of
//! written fields (inserts, updates) onto shard ids.

pub mod range;

pub use range::{RangeSharding, ShardRange};

use serde::{Deserialize, Serialize};
use std::fmt;

use super::adapter::Row;
use super::error::{FederationError, Result};
use super::query::Predicate;

pub type ShardId = u32;

/// Closed interval over the integer key domain. `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Range {
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
}

impl Range {
    pub const UNBOUNDED: Range = Range { min: None, max: None };

    /// Validated constructor for configured shard ranges
    pub fn try_new(min: Option<i64>, max: Option<i64>) -> Result<Self> {
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(FederationError::Config(format!(
                    "range min {} is greater than max {}",
                    lo, hi
                )));
            }
        }
        Ok(Self { min, max })
    }

    pub fn point(value: i64) -> Self {
        Self { min: Some(value), max: Some(value) }
    }

    pub fn at_least(value: i64) -> Self {
        Self { min: Some(value), max: None }
    }

    pub fn at_most(value: i64) -> Self {
        Self { min: None, max: Some(value) }
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Derived ranges can be contradictory (`id > 10 AND id < 5`)
    pub fn is_empty(&self) -> bool {
        matches!((self.min, self.max), (Some(lo), Some(hi)) if lo > hi)
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min.map_or(true, |lo| value >= lo) && self.max.map_or(true, |hi| value <= hi)
    }

    pub fn intersects(&self, other: &Range) -> bool {
        if let (Some(hi), Some(lo)) = (self.max, other.min) {
            if hi < lo {
                return false;
            }
        }
        if let (Some(lo), Some(hi)) = (self.min, other.max) {
            if lo > hi {
                return false;
            }
        }
        true
    }

    /// Tightest range satisfying both, unbounded sides ignored
    pub fn intersect(&self, other: &Range) -> Range {
        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Range { min, max }
    }

    /// Smallest range covering both; an unbounded side stays unbounded
    pub fn hull(&self, other: &Range) -> Range {
        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Range { min, max }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.min {
            Some(v) => write!(f, "[{}, ", v)?,
            None => write!(f, "[-inf, ")?,
        }
        match self.max {
            Some(v) => write!(f, "{}]", v),
            None => write!(f, "+inf]"),
        }
    }
}

/// Maps one logical table onto shards
pub trait ShardingStrategy: Send + Sync + fmt::Debug {
    /// Logical table this strategy is registered for
    fn table(&self) -> &str;

    /// Sharding key column
    fn key(&self) -> &str;

    /// Every shard id, in configured order
    fn shard_ids(&self) -> Vec<ShardId>;

    /// Shards that may hold rows matching the predicate; `None` means all shards
    fn route_by_predicate(&self, predicate: Option<&Predicate>) -> Vec<ShardId>;

    /// Shard that owns a row with these written fields
    fn route_by_field_value(&self, fields: &Row) -> Result<ShardId>;

    /// Table name to use on a given shard
    fn physical_table(&self, _shard: ShardId) -> String {
        self.table().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_new_rejects_inverted() {
        assert!(Range::try_new(Some(5), Some(1)).is_err());
        assert!(Range::try_new(None, Some(1)).is_ok());
    }

    #[test]
    fn test_intersect_ignores_unbounded() {
        let r = Range::at_least(10).intersect(&Range::at_least(20)).intersect(&Range::at_most(50));
        assert_eq!(r, Range { min: Some(20), max: Some(50) });
        assert!(Range::at_least(10).intersect(&Range::at_most(5)).is_empty());
    }

    #[test]
    fn test_hull_and_intersects() {
        let h = Range::point(3).hull(&Range::point(9));
        assert_eq!(h, Range { min: Some(3), max: Some(9) });
        assert!(Range::point(3).hull(&Range::at_least(9)).max.is_none());

        let a = Range { min: Some(0), max: Some(1000) };
        assert!(a.intersects(&Range::point(1000)));
        assert!(!a.intersects(&Range::point(1001)));
        assert!(a.intersects(&Range::UNBOUNDED));
        assert_eq!(a.to_string(), "[0, 1000]");
    }
}
