//! Query Model
//!
//! Typed SELECT / INSERT / UPDATE / DELETE statements. Compositions inspect and
//! rewrite these (table retargeting, limit widening) before handing them to a
//! backend connection, which renders them through its SQL dialect.

pub mod predicate;

pub use predicate::{CompareOp, FieldRef, Logic, Predicate};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::adapter::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunc {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Sum => "sum",
            AggregateFunc::Count => "count",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
            AggregateFunc::Avg => "avg",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "sum" => Some(AggregateFunc::Sum),
            "count" => Some(AggregateFunc::Count),
            "min" => Some(AggregateFunc::Min),
            "max" => Some(AggregateFunc::Max),
            "avg" | "average" => Some(AggregateFunc::Avg),
            _ => None,
        }
    }
}

/// One output expression of a SELECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectExpr {
    Column { field: FieldRef },
    /// `column: None` means `*`
    Aggregate {
        func: AggregateFunc,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<FieldRef>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectField {
    pub expr: SelectExpr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl SelectField {
    pub fn column(field: impl Into<FieldRef>) -> Self {
        Self { expr: SelectExpr::Column { field: field.into() }, alias: None }
    }

    pub fn aggregate(func: AggregateFunc, column: Option<FieldRef>, alias: &str) -> Self {
        Self {
            expr: SelectExpr::Aggregate { func, column },
            alias: Some(alias.to_string()),
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Name the column carries in result rows
    pub fn output_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.expr {
            SelectExpr::Column { field } => field.name.clone(),
            SelectExpr::Aggregate { func, column } => match column {
                Some(c) => format!("{}({})", func.name(), c.name),
                None => format!("{}(*)", func.name()),
            },
        }
    }

    pub fn aggregate_func(&self) -> Option<AggregateFunc> {
        match &self.expr {
            SelectExpr::Aggregate { func, .. } => Some(*func),
            SelectExpr::Column { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldRef,
    pub direction: SortDirection,
    #[serde(default)]
    pub nulls_first: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<FieldRef>) -> Self {
        Self { field: field.into(), direction: SortDirection::Asc, nulls_first: false }
    }

    pub fn desc(field: impl Into<FieldRef>) -> Self {
        Self { field: field.into(), direction: SortDirection::Desc, nulls_first: false }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls_first = true;
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls_first = false;
        self
    }

    pub fn is_asc(&self) -> bool {
        self.direction == SortDirection::Asc
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectQuery {
    pub table: String,
    /// Empty means `*`
    #[serde(default)]
    pub fields: Vec<SelectField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
    #[serde(default)]
    pub group_by: Vec<FieldRef>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl SelectQuery {
    pub fn from(table: &str) -> Self {
        Self { table: table.to_string(), ..Default::default() }
    }

    pub fn column(mut self, field: impl Into<FieldRef>) -> Self {
        self.fields.push(SelectField::column(field));
        self
    }

    pub fn column_as(mut self, field: impl Into<FieldRef>, alias: &str) -> Self {
        self.fields.push(SelectField::column(field).with_alias(alias));
        self
    }

    pub fn aggregate(mut self, func: AggregateFunc, column: impl Into<FieldRef>, alias: &str) -> Self {
        self.fields.push(SelectField::aggregate(func, Some(column.into()), alias));
        self
    }

    /// `COUNT(*) AS alias`
    pub fn count_all(mut self, alias: &str) -> Self {
        self.fields.push(SelectField::aggregate(AggregateFunc::Count, None, alias));
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and_also(predicate),
            None => predicate,
        });
        self
    }

    pub fn group_by(mut self, field: impl Into<FieldRef>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn has_aggregates(&self) -> bool {
        self.fields.iter().any(|f| f.aggregate_func().is_some())
    }

    /// Output name for a column reference: the alias if the column is selected
    /// under one, else the bare column name
    pub fn resolve_to_alias(&self, field: &FieldRef) -> String {
        for selected in &self.fields {
            if let SelectExpr::Column { field: column } = &selected.expr {
                if column.name == field.name {
                    if let Some(alias) = &selected.alias {
                        return alias.clone();
                    }
                    break;
                }
            }
        }
        field.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsertQuery {
    pub table: String,
    pub rows: Vec<Row>,
    /// Columns whose text values are base64 and bind as blobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blob_columns: Vec<String>,
}

impl InsertQuery {
    pub fn into_table(table: &str) -> Self {
        Self { table: table.to_string(), rows: Vec::new(), blob_columns: Vec::new() }
    }

    pub fn blob_column(mut self, column: &str) -> Self {
        self.blob_columns.push(column.to_string());
        self
    }

    pub fn is_blob_column(&self, column: &str) -> bool {
        self.blob_columns.iter().any(|c| c == column)
    }

    pub fn row(mut self, row: Row) -> Self {
        self.rows.push(row);
        self
    }

    /// Column list in first-seen order across all rows
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateQuery {
    pub table: String,
    pub set: Row,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
}

impl UpdateQuery {
    pub fn table(table: &str) -> Self {
        Self { table: table.to_string(), ..Default::default() }
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and_also(predicate),
            None => predicate,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteQuery {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
}

impl DeleteQuery {
    pub fn from(table: &str) -> Self {
        Self { table: table.to_string(), predicate: None }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and_also(predicate),
            None => predicate,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    Select(SelectQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

impl Query {
    pub fn table(&self) -> &str {
        match self {
            Query::Select(q) => &q.table,
            Query::Insert(q) => &q.table,
            Query::Update(q) => &q.table,
            Query::Delete(q) => &q.table,
        }
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        match self {
            Query::Select(q) => q.predicate.as_ref(),
            Query::Update(q) => q.predicate.as_ref(),
            Query::Delete(q) => q.predicate.as_ref(),
            Query::Insert(_) => None,
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self, Query::Select(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Query::Select(_) => "SELECT",
            Query::Insert(_) => "INSERT",
            Query::Update(_) => "UPDATE",
            Query::Delete(_) => "DELETE",
        }
    }

    /// Clone aimed at another physical table; qualified field references follow
    pub fn retarget(&self, physical: &str) -> Query {
        let logical = self.table().to_string();
        if logical == physical {
            return self.clone();
        }
        let moved = |p: &Option<Predicate>| p.as_ref().map(|p| p.retarget(&logical, physical));
        match self {
            Query::Select(q) => {
                let mut q = q.clone();
                q.table = physical.to_string();
                q.predicate = moved(&q.predicate);
                for field in &mut q.fields {
                    match &mut field.expr {
                        SelectExpr::Column { field } => *field = field.retarget(&logical, physical),
                        SelectExpr::Aggregate { column: Some(c), .. } => {
                            *c = c.retarget(&logical, physical)
                        }
                        SelectExpr::Aggregate { column: None, .. } => {}
                    }
                }
                for g in &mut q.group_by {
                    *g = g.retarget(&logical, physical);
                }
                for o in &mut q.order_by {
                    o.field = o.field.retarget(&logical, physical);
                }
                Query::Select(q)
            }
            Query::Insert(q) => Query::Insert(InsertQuery {
                table: physical.to_string(),
                rows: q.rows.clone(),
                blob_columns: q.blob_columns.clone(),
            }),
            Query::Update(q) => Query::Update(UpdateQuery {
                table: physical.to_string(),
                set: q.set.clone(),
                predicate: moved(&q.predicate),
            }),
            Query::Delete(q) => Query::Delete(DeleteQuery {
                table: physical.to_string(),
                predicate: moved(&q.predicate),
            }),
        }
    }
}

impl From<SelectQuery> for Query {
    fn from(q: SelectQuery) -> Self {
        Query::Select(q)
    }
}

impl From<InsertQuery> for Query {
    fn from(q: InsertQuery) -> Self {
        Query::Insert(q)
    }
}

impl From<UpdateQuery> for Query {
    fn from(q: UpdateQuery) -> Self {
        Query::Update(q)
    }
}

impl From<DeleteQuery> for Query {
    fn from(q: DeleteQuery) -> Self {
        Query::Delete(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_names() {
        assert_eq!(SelectField::column("users.name").output_name(), "name");
        assert_eq!(SelectField::column("name").with_alias("n").output_name(), "n");
        let f = SelectField { expr: SelectExpr::Aggregate { func: AggregateFunc::Sum, column: Some("amount".into()) }, alias: None };
        assert_eq!(f.output_name(), "sum(amount)");
        let f = SelectField { expr: SelectExpr::Aggregate { func: AggregateFunc::Count, column: None }, alias: None };
        assert_eq!(f.output_name(), "count(*)");
    }

    #[test]
    fn test_resolve_to_alias() {
        let q = SelectQuery::from("t").column_as("oid", "object_id").column("name");
        assert_eq!(q.resolve_to_alias(&"oid".into()), "object_id");
        assert_eq!(q.resolve_to_alias(&"name".into()), "name");
        assert_eq!(q.resolve_to_alias(&"other".into()), "other");
    }

    #[test]
    fn test_retarget_select() {
        let q: Query = SelectQuery::from("users")
            .column("users.id")
            .filter(Predicate::gt("users.id", 5))
            .order_by(OrderBy::asc("users.id"))
            .into();
        let moved = q.retarget("users_b");
        match moved {
            Query::Select(s) => {
                assert_eq!(s.table, "users_b");
                assert_eq!(s.order_by[0].field, FieldRef::qualified("users_b", "id"));
                assert_eq!(s.predicate, Some(Predicate::gt("users_b.id", 5)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insert_columns_union() {
        let mut a = Row::new();
        a.insert("id".into(), json!(1));
        a.insert("name".into(), json!("x"));
        let mut b = Row::new();
        b.insert("id".into(), json!(2));
        b.insert("email".into(), json!("y"));
        let q = InsertQuery::into_table("users").row(a).row(b);
        assert_eq!(q.columns(), vec!["id", "name", "email"]);
    }
}
