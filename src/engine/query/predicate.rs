//! Predicate trees for WHERE clauses
//!
//! A predicate is either a single comparison of a field against a value or a
//! conjunction of child predicates joined by AND / OR.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reference to a column, optionally qualified by its table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub name: String,
}

impl FieldRef {
    pub fn new(name: &str) -> Self {
        Self { table: None, name: name.to_string() }
    }

    pub fn qualified(table: &str, name: &str) -> Self {
        Self { table: Some(table.to_string()), name: name.to_string() }
    }

    /// Same column with its table qualifier renamed from `from` to `to`
    pub fn retarget(&self, from: &str, to: &str) -> Self {
        match &self.table {
            Some(t) if t == from => Self::qualified(to, &self.name),
            _ => self.clone(),
        }
    }
}

/// `"users.id"` parses as a qualified reference, `"id"` as a bare one
impl From<&str> for FieldRef {
    fn from(s: &str) -> Self {
        match s.split_once('.') {
            Some((table, name)) if !table.is_empty() && !name.is_empty() => {
                Self::qualified(table, name)
            }
            _ => Self::new(s),
        }
    }
}

impl From<String> for FieldRef {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(t) => write!(f, "{}.{}", t, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn to_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Like => "LIKE",
            CompareOp::IsNull => "IS NULL",
            CompareOp::IsNotNull => "IS NOT NULL",
        }
    }

    pub fn needs_value(&self) -> bool {
        !matches!(self, CompareOp::IsNull | CompareOp::IsNotNull)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    pub fn to_sql(&self) -> &'static str {
        match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Predicate {
    Comparison {
        field: FieldRef,
        op: CompareOp,
        #[serde(default)]
        value: Value,
    },
    Conjunction {
        logic: Logic,
        children: Vec<Predicate>,
    },
}

impl Predicate {
    pub fn compare(field: impl Into<FieldRef>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Comparison { field: field.into(), op, value: value.into() }
    }

    pub fn eq(field: impl Into<FieldRef>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: impl Into<FieldRef>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn gt(field: impl Into<FieldRef>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn gte(field: impl Into<FieldRef>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gte, value)
    }

    pub fn lt(field: impl Into<FieldRef>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn lte(field: impl Into<FieldRef>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lte, value)
    }

    pub fn like(field: impl Into<FieldRef>, pattern: &str) -> Self {
        Self::compare(field, CompareOp::Like, pattern)
    }

    pub fn is_null(field: impl Into<FieldRef>) -> Self {
        Self::compare(field, CompareOp::IsNull, Value::Null)
    }

    pub fn is_not_null(field: impl Into<FieldRef>) -> Self {
        Self::compare(field, CompareOp::IsNotNull, Value::Null)
    }

    pub fn and(children: Vec<Predicate>) -> Self {
        Predicate::Conjunction { logic: Logic::And, children }
    }

    pub fn or(children: Vec<Predicate>) -> Self {
        Predicate::Conjunction { logic: Logic::Or, children }
    }

    /// Combine with another predicate under AND, flattening an existing AND node
    pub fn and_also(self, other: Predicate) -> Self {
        match self {
            Predicate::Conjunction { logic: Logic::And, mut children } => {
                children.push(other);
                Predicate::and(children)
            }
            first => Predicate::and(vec![first, other]),
        }
    }

    /// Copy of the tree with `from`-qualified fields requalified to `to`
    pub fn retarget(&self, from: &str, to: &str) -> Self {
        match self {
            Predicate::Comparison { field, op, value } => Predicate::Comparison {
                field: field.retarget(from, to),
                op: *op,
                value: value.clone(),
            },
            Predicate::Conjunction { logic, children } => Predicate::Conjunction {
                logic: *logic,
                children: children.iter().map(|c| c.retarget(from, to)).collect(),
            },
        }
    }
}
