//! SQL Dialect Generator
//!
//! Renders the query model and table schemas into database-specific SQL.
//! Supports SQLite, PostgreSQL, and MySQL dialects.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::{ColumnSchema, SqlValue, TableSchema};
use crate::engine::error::{FederationError, Result};
use crate::engine::query::{
    predicate::{CompareOp, FieldRef, Logic, Predicate},
    DeleteQuery, InsertQuery, OrderBy, Query, SelectExpr, SelectQuery, UpdateQuery,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::Sqlite => write!(f, "sqlite"),
            SqlDialect::Postgres => write!(f, "postgres"),
            SqlDialect::Mysql => write!(f, "mysql"),
        }
    }
}

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// SQL dialect-aware code generator
pub struct DialectGenerator {
    pub dialect: SqlDialect,
}

impl DialectGenerator {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    /// Map a universal/generic type to the dialect-specific type
    pub fn map_type(&self, universal_type: &str) -> String {
        let upper = universal_type.to_uppercase();
        match (self.dialect, upper.as_str()) {
            (SqlDialect::Sqlite, "SERIAL") => "INTEGER".into(),
            (SqlDialect::Postgres, "SERIAL") => "SERIAL".into(),
            (SqlDialect::Mysql, "SERIAL") => "INT AUTO_INCREMENT".into(),

            (SqlDialect::Sqlite, "BOOLEAN") => "INTEGER".into(),
            (SqlDialect::Mysql, "BOOLEAN") => "TINYINT(1)".into(),

            (SqlDialect::Sqlite, "DATETIME") | (SqlDialect::Sqlite, "TIMESTAMP") => "TEXT".into(),
            (SqlDialect::Postgres, "DATETIME") | (SqlDialect::Postgres, "TIMESTAMP") => {
                "TIMESTAMPTZ".into()
            }

            (SqlDialect::Sqlite, "JSON") | (SqlDialect::Sqlite, "JSONB") => "TEXT".into(),
            (SqlDialect::Mysql, "JSONB") => "JSON".into(),

            (SqlDialect::Sqlite, "BYTEA") => "BLOB".into(),
            (SqlDialect::Postgres, "BLOB") => "BYTEA".into(),
            (SqlDialect::Mysql, "BYTEA") => "LONGBLOB".into(),

            (SqlDialect::Sqlite, "BIGINT") => "INTEGER".into(),

            (SqlDialect::Sqlite, "FLOAT") | (SqlDialect::Sqlite, "DOUBLE") | (SqlDialect::Sqlite, "DOUBLE PRECISION") => "REAL".into(),
            (SqlDialect::Postgres, "FLOAT") | (SqlDialect::Postgres, "DOUBLE") => "DOUBLE PRECISION".into(),
            (SqlDialect::Mysql, "DOUBLE PRECISION") => "DOUBLE".into(),

            _ if upper.starts_with("VARCHAR") => match self.dialect {
                SqlDialect::Sqlite => "TEXT".into(),
                _ => universal_type.to_string(),
            },

            _ => universal_type.to_string(),
        }
    }

    /// Quote an identifier (table or column name)
    pub fn quote_ident(&self, name: &str) -> String {
        match self.dialect {
            SqlDialect::Sqlite | SqlDialect::Postgres => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            SqlDialect::Mysql => format!("`{}`", name.replace('`', "``")),
        }
    }

    fn quote_field(&self, field: &FieldRef) -> String {
        match &field.table {
            Some(table) => format!("{}.{}", self.quote_ident(table), self.quote_ident(&field.name)),
            None => self.quote_ident(&field.name),
        }
    }

    /// Positional placeholder for the `index`-th parameter (1-based)
    pub fn placeholder(&self, index: usize) -> String {
        match self.dialect {
            SqlDialect::Sqlite => format!("?{}", index),
            SqlDialect::Postgres => format!("${}", index),
            SqlDialect::Mysql => "?".to_string(),
        }
    }

    fn auto_increment_pk(&self, col_name: &str) -> String {
        let col = self.quote_ident(col_name);
        match self.dialect {
            SqlDialect::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", col),
            SqlDialect::Postgres => format!("{} SERIAL PRIMARY KEY", col),
            SqlDialect::Mysql => format!("{} INT AUTO_INCREMENT PRIMARY KEY", col),
        }
    }

    /// Generate CREATE TABLE SQL from a schema read off another connection
    pub fn create_table(&self, schema: &TableSchema) -> String {
        let pk_count = schema.columns.iter().filter(|c| c.is_primary_key).count();
        let composite_pk = pk_count > 1;

        let mut col_defs: Vec<String> = schema
            .columns
            .iter()
            .map(|col| self.column_def(col, composite_pk))
            .collect();

        if composite_pk {
            let pk_cols: Vec<String> = schema
                .columns
                .iter()
                .filter(|c| c.is_primary_key)
                .map(|c| self.quote_ident(&c.name))
                .collect();
            col_defs.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));
        }

        format!(
            "CREATE TABLE {} (\n  {}\n);",
            self.quote_ident(&schema.name),
            col_defs.join(",\n  ")
        )
    }

    fn column_def(&self, col: &ColumnSchema, composite_pk: bool) -> String {
        if col.is_auto_increment && col.is_primary_key && !composite_pk {
            return self.auto_increment_pk(&col.name);
        }

        let mut def = format!("{} {}", self.quote_ident(&col.name), self.map_type(&col.col_type));
        if col.is_primary_key && !composite_pk {
            def.push_str(" PRIMARY KEY");
        }
        if !col.nullable && !col.is_primary_key {
            def.push_str(" NOT NULL");
        }
        if col.is_unique && !col.is_primary_key {
            def.push_str(" UNIQUE");
        }
        if let Some(ref default) = col.default_value {
            if !default.is_empty() {
                def.push_str(&format!(" DEFAULT {}", default));
            }
        }
        if let Some(ref fk) = col.foreign_key {
            def.push_str(&format!(
                " REFERENCES {}({})",
                self.quote_ident(&fk.table),
                self.quote_ident(&fk.column)
            ));
        }
        def
    }

    /// Generate DROP TABLE SQL
    pub fn drop_table(&self, table: &str, if_exists: bool) -> String {
        if if_exists {
            format!("DROP TABLE IF EXISTS {};", self.quote_ident(table))
        } else {
            format!("DROP TABLE {};", self.quote_ident(table))
        }
    }

    /// Generate CREATE INDEX SQL
    pub fn create_index(&self, table: &str, index_name: &str, columns: &[String], unique: bool) -> String {
        let unique_str = if unique { "UNIQUE " } else { "" };
        let col_list: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({});",
            unique_str,
            self.quote_ident(index_name),
            self.quote_ident(table),
            col_list.join(", ")
        )
    }

    /// Render any query with positional parameters
    pub fn render(&self, query: &Query) -> Result<RenderedQuery> {
        let mut params = Vec::new();
        let sql = match query {
            Query::Select(q) => self.render_select(q, &mut params),
            Query::Insert(q) => self.render_insert(q, &mut params)?,
            Query::Update(q) => self.render_update(q, &mut params)?,
            Query::Delete(q) => self.render_delete(q, &mut params),
        };
        Ok(RenderedQuery { sql, params })
    }

    fn render_select(&self, q: &SelectQuery, params: &mut Vec<SqlValue>) -> String {
        let fields = if q.fields.is_empty() {
            "*".to_string()
        } else {
            q.fields
                .iter()
                .map(|f| {
                    let expr = match &f.expr {
                        SelectExpr::Column { field } => self.quote_field(field),
                        SelectExpr::Aggregate { func, column } => {
                            let arg = match column {
                                Some(c) => self.quote_field(c),
                                None => "*".to_string(),
                            };
                            format!("{}({})", func.name().to_uppercase(), arg)
                        }
                    };
                    match (&f.expr, &f.alias) {
                        (SelectExpr::Column { .. }, None) => expr,
                        _ => format!("{} AS {}", expr, self.quote_ident(&f.output_name())),
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", fields, self.quote_ident(&q.table));

        if let Some(predicate) = &q.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&self.render_predicate(predicate, params));
        }

        if !q.group_by.is_empty() {
            let groups: Vec<String> = q.group_by.iter().map(|g| self.quote_field(g)).collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if !q.order_by.is_empty() {
            let orders: Vec<String> = q.order_by.iter().map(|o| self.render_order(o)).collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        sql.push_str(&self.limit_clause(q.limit, q.offset));
        sql
    }

    fn render_order(&self, order: &OrderBy) -> String {
        let field = self.quote_field(&order.field);
        match self.dialect {
            SqlDialect::Sqlite | SqlDialect::Postgres => {
                let nulls = if order.nulls_first { "NULLS FIRST" } else { "NULLS LAST" };
                format!("{} {} {}", field, order.direction, nulls)
            }
            // No NULLS FIRST/LAST in MySQL
            SqlDialect::Mysql => {
                let nulls = if order.nulls_first { "DESC" } else { "ASC" };
                format!("{} IS NULL {}, {} {}", field, nulls, field, order.direction)
            }
        }
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (None, None) => String::new(),
            (Some(l), None) => format!(" LIMIT {}", l),
            (Some(l), Some(o)) => format!(" LIMIT {} OFFSET {}", l, o),
            (None, Some(o)) => match self.dialect {
                SqlDialect::Sqlite => format!(" LIMIT -1 OFFSET {}", o),
                SqlDialect::Postgres => format!(" OFFSET {}", o),
                SqlDialect::Mysql => format!(" LIMIT 18446744073709551615 OFFSET {}", o),
            },
        }
    }

    fn render_insert(&self, q: &InsertQuery, params: &mut Vec<SqlValue>) -> Result<String> {
        if q.rows.is_empty() {
            return Err(FederationError::Query(format!(
                "INSERT into \"{}\" without rows",
                q.table
            )));
        }
        let columns = q.columns();
        let table = self.quote_ident(&q.table);
        if columns.is_empty() {
            return Ok(format!("INSERT INTO {} DEFAULT VALUES", table));
        }

        let mut tuples = Vec::with_capacity(q.rows.len());
        for row in &q.rows {
            let mut slots = Vec::with_capacity(columns.len());
            for column in &columns {
                let value = match row.get(column) {
                    Some(Value::String(encoded)) if q.is_blob_column(column) => {
                        decode_blob(encoded).unwrap_or_else(|| SqlValue::Text(encoded.clone()))
                    }
                    Some(value) => SqlValue::from(value),
                    None => SqlValue::Null,
                };
                params.push(value);
                slots.push(self.placeholder(params.len()));
            }
            tuples.push(format!("({})", slots.join(", ")));
        }

        let col_names: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            col_names.join(", "),
            tuples.join(", ")
        ))
    }

    fn render_update(&self, q: &UpdateQuery, params: &mut Vec<SqlValue>) -> Result<String> {
        if q.set.is_empty() {
            return Err(FederationError::Query(format!(
                "UPDATE of \"{}\" without fields",
                q.table
            )));
        }
        let mut set_clauses = Vec::with_capacity(q.set.len());
        for (column, value) in &q.set {
            params.push(SqlValue::from(value));
            set_clauses.push(format!("{} = {}", self.quote_ident(column), self.placeholder(params.len())));
        }
        let mut sql = format!("UPDATE {} SET {}", self.quote_ident(&q.table), set_clauses.join(", "));
        if let Some(predicate) = &q.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&self.render_predicate(predicate, params));
        }
        Ok(sql)
    }

    fn render_delete(&self, q: &DeleteQuery, params: &mut Vec<SqlValue>) -> String {
        let mut sql = format!("DELETE FROM {}", self.quote_ident(&q.table));
        if let Some(predicate) = &q.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&self.render_predicate(predicate, params));
        }
        sql
    }

    fn render_predicate(&self, predicate: &Predicate, params: &mut Vec<SqlValue>) -> String {
        match predicate {
            Predicate::Comparison { field, op, value } => {
                let field = self.quote_field(field);
                match (op, value.is_null()) {
                    (CompareOp::Eq, true) | (CompareOp::IsNull, _) => format!("{} IS NULL", field),
                    (CompareOp::Ne, true) | (CompareOp::IsNotNull, _) => {
                        format!("{} IS NOT NULL", field)
                    }
                    _ => {
                        params.push(SqlValue::from(value));
                        format!("{} {} {}", field, op.to_sql(), self.placeholder(params.len()))
                    }
                }
            }
            Predicate::Conjunction { logic, children } => match children.len() {
                0 => match logic {
                    Logic::And => "1=1".to_string(),
                    Logic::Or => "1=0".to_string(),
                },
                1 => self.render_predicate(&children[0], params),
                _ => {
                    let parts: Vec<String> = children
                        .iter()
                        .map(|c| self.render_predicate(c, params))
                        .collect();
                    format!("({})", parts.join(&format!(" {} ", logic.to_sql())))
                }
            },
        }
    }
}

/// Text stored in a blob-typed column is not base64 and binds unchanged
fn decode_blob(encoded: &str) -> Option<SqlValue> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .map(SqlValue::Blob)
}
