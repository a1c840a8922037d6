//! Fan-in for multi-shard reads
//!
//! Shards receive a rewritten select (limit widened, offset dropped, averages
//! split into sum and count). Their concatenated rows are folded per group,
//! sorted, then sliced here.

use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::engine::adapter::Row;
use crate::engine::error::{FederationError, Result};
use crate::engine::query::{AggregateFunc, OrderBy, SelectExpr, SelectField, SelectQuery};

/// Name of the hidden per-shard row count carried next to an average
pub fn hidden_count_name(output: &str) -> String {
    format!("{}__count", output)
}

/// Select to send to each shard of a multi-shard read
pub fn shard_select(select: &SelectQuery) -> SelectQuery {
    let mut q = select.clone();

    let mut counts = Vec::new();
    for field in &mut q.fields {
        if let SelectExpr::Aggregate { func: AggregateFunc::Avg, column } = &field.expr {
            let output = field.output_name();
            let column = column.clone();
            counts.push(SelectField::aggregate(
                AggregateFunc::Count,
                column.clone(),
                &hidden_count_name(&output),
            ));
            field.expr = SelectExpr::Aggregate { func: AggregateFunc::Sum, column };
            field.alias = Some(output);
        }
    }
    q.fields.extend(counts);

    // A group may span shards, so grouped reads fetch everything
    q.limit = if q.has_aggregates() || !q.group_by.is_empty() {
        None
    } else {
        q.limit.map(|l| l.saturating_add(q.offset.unwrap_or(0)))
    };
    q.offset = None;
    q
}

/// Fold, sort and paginate rows gathered from several shards
pub fn merge_rows(select: &SelectQuery, rows: Vec<Row>) -> Result<Vec<Row>> {
    let mut rows = if select.has_aggregates() || !select.group_by.is_empty() {
        aggregate(select, rows)?
    } else {
        rows
    };

    if !select.order_by.is_empty() {
        sort_rows(select, &mut rows);
    }

    if select.limit.is_some() || select.offset.is_some() {
        rows = paginate(rows, select.limit, select.offset);
    }
    Ok(rows)
}

/// Per-group merge state
#[derive(Debug, Clone, PartialEq)]
enum Accumulator {
    Sum(Value),
    Count(Value),
    Min(Value),
    Max(Value),
    Average { sum: f64, count: f64 },
}

impl Accumulator {
    fn seed(func: AggregateFunc, row: &Row, output: &str) -> Self {
        let value = row.get(output).cloned().unwrap_or(Value::Null);
        match func {
            AggregateFunc::Sum => Accumulator::Sum(value),
            AggregateFunc::Count => Accumulator::Count(value),
            AggregateFunc::Min => Accumulator::Min(value),
            AggregateFunc::Max => Accumulator::Max(value),
            AggregateFunc::Avg => Accumulator::Average {
                sum: value.as_f64().unwrap_or(0.0),
                count: hidden_count(row, output),
            },
        }
    }

    fn fold(&mut self, row: &Row, output: &str) {
        let value = row.get(output).unwrap_or(&Value::Null);
        match self {
            Accumulator::Sum(acc) | Accumulator::Count(acc) => *acc = add_values(acc, value),
            Accumulator::Min(acc) => {
                if !value.is_null() && (acc.is_null() || compare_values(value, acc) == Ordering::Less) {
                    *acc = value.clone();
                }
            }
            Accumulator::Max(acc) => {
                if !value.is_null() && (acc.is_null() || compare_values(value, acc) == Ordering::Greater) {
                    *acc = value.clone();
                }
            }
            Accumulator::Average { sum, count } => {
                *sum += value.as_f64().unwrap_or(0.0);
                *count += hidden_count(row, output);
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Sum(v) | Accumulator::Count(v) | Accumulator::Min(v) | Accumulator::Max(v) => v,
            Accumulator::Average { count, .. } if count == 0.0 => Value::Null,
            Accumulator::Average { sum, count } => json!(sum / count),
        }
    }
}

fn hidden_count(row: &Row, output: &str) -> f64 {
    row.get(&hidden_count_name(output))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Numeric addition that stays integral while both sides are integers. Nulls
/// are absent values, as in SQL aggregates.
fn add_values(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => match x.checked_add(y) {
                Some(sum) => json!(sum),
                None => json!(x as f64 + y as f64),
            },
            _ => json!(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        },
    }
}

fn aggregate(select: &SelectQuery, rows: Vec<Row>) -> Result<Vec<Row>> {
    let group_names: Vec<String> =
        select.group_by.iter().map(|g| select.resolve_to_alias(g)).collect();

    let mut aggregates: Vec<(String, AggregateFunc)> = Vec::new();
    for field in &select.fields {
        let output = field.output_name();
        match field.aggregate_func() {
            Some(func) => aggregates.push((output, func)),
            None if group_names.contains(&output) => {}
            None => {
                tracing::error!(table = %select.table, field = %output, "field is neither grouped nor aggregated");
                return Err(FederationError::AggregateMismatch(format!(
                    "field '{}' of \"{}\" is neither grouped nor aggregated",
                    output, select.table
                )));
            }
        }
    }

    // Rows without their group columns would all share the null key
    if !select.fields.is_empty() {
        let outputs: Vec<String> = select.fields.iter().map(SelectField::output_name).collect();
        if let Some(missing) = group_names.iter().find(|g| !outputs.contains(g)) {
            tracing::error!(table = %select.table, field = %missing, "grouped field is not selected");
            return Err(FederationError::AggregateMismatch(format!(
                "group field '{}' of \"{}\" is not selected",
                missing, select.table
            )));
        }
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Row, Vec<Accumulator>)> = HashMap::new();

    for row in rows {
        let key_values: Vec<&Value> = group_names
            .iter()
            .map(|g| row.get(g).unwrap_or(&Value::Null))
            .collect();
        let key = serde_json::to_string(&key_values)?;

        if let Some((_, accumulators)) = groups.get_mut(&key) {
            for (acc, (output, _)) in accumulators.iter_mut().zip(&aggregates) {
                acc.fold(&row, output);
            }
            continue;
        }

        // First row of a group seeds it
        let accumulators = aggregates
            .iter()
            .map(|(output, func)| Accumulator::seed(*func, &row, output))
            .collect();
        order.push(key.clone());
        groups.insert(key, (row, accumulators));
    }

    let mut merged = Vec::with_capacity(order.len());
    for key in order {
        let Some((mut row, accumulators)) = groups.remove(&key) else {
            continue;
        };
        for (acc, (output, func)) in accumulators.into_iter().zip(&aggregates) {
            row.insert(output.clone(), acc.finish());
            if *func == AggregateFunc::Avg {
                row.remove(&hidden_count_name(output));
            }
        }
        merged.push(row);
    }
    Ok(merged)
}

/// Fixed rank for values of different JSON types
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Ordering by declared type: numbers numerically, strings lexicographically,
/// false before true; mixed types by type rank
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(0.0);
                let y = y.as_f64().unwrap_or(0.0);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_by(order: &OrderBy, name: &str, a: &Row, b: &Row) -> Ordering {
    let va = a.get(name).unwrap_or(&Value::Null);
    let vb = b.get(name).unwrap_or(&Value::Null);
    match (va.is_null(), vb.is_null()) {
        (true, true) => Ordering::Equal,
        // Null placement is not flipped by DESC
        (true, false) => if order.nulls_first { Ordering::Less } else { Ordering::Greater },
        (false, true) => if order.nulls_first { Ordering::Greater } else { Ordering::Less },
        (false, false) => {
            let ord = compare_values(va, vb);
            if order.is_asc() { ord } else { ord.reverse() }
        }
    }
}

/// Stable sort on the declared order fields, each later field breaking ties of the earlier ones
pub fn sort_rows(select: &SelectQuery, rows: &mut [Row]) {
    let keys: Vec<(&OrderBy, String)> = select
        .order_by
        .iter()
        .map(|o| (o, select.resolve_to_alias(&o.field)))
        .collect();

    rows.sort_by(|a, b| {
        keys.iter()
            .map(|(order, name)| compare_by(order, name, a, b))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

pub fn paginate(rows: Vec<Row>, limit: Option<u64>, offset: Option<u64>) -> Vec<Row> {
    let skip = offset.unwrap_or(0) as usize;
    let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    rows.into_iter().skip(skip).take(take).collect()
}
