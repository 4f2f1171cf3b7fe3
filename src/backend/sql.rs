//! Dialect-aware SQL statement builder.
//!
//! Table and column names never come from callers verbatim: every identifier
//! is resolved against [`Table::columns`] first, and all values travel as bound
//! parameters.

use super::{BackendError, Match, Record, Table, Value};

/// Column name used for `COUNT(...)` results.
pub const COUNT_COLUMN: &str = "count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn placeholder(self, n: usize) -> String {
        match self {
            Self::Sqlite => format!("?{n}"),
            Self::Postgres => format!("${n}"),
        }
    }
}

/// A ready-to-run statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Names for the returned columns, in select order. Empty for writes.
    pub columns: Vec<String>,
}

struct Builder {
    dialect: Dialect,
    params: Vec<Value>,
}

impl Builder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn condition(&mut self, column: &str, matches: &Match) -> String {
        match matches {
            Match::One(value) => {
                let p = self.bind(value.clone());
                format!("\"{column}\" = {p}")
            }
            Match::Any(values) => {
                let placeholders: Vec<String> =
                    values.iter().map(|v| self.bind(v.clone())).collect();
                format!("\"{column}\" IN ({})", placeholders.join(", "))
            }
        }
    }

    fn finish(self, sql: String, columns: Vec<String>) -> Statement {
        Statement {
            sql,
            params: self.params,
            columns,
        }
    }
}

fn column_list(table: Table, fields: &[&str]) -> Result<Vec<String>, BackendError> {
    if fields.is_empty() {
        return Ok(table.columns().iter().map(|c| (*c).to_string()).collect());
    }
    fields
        .iter()
        .map(|f| table.column(f).map(str::to_string))
        .collect()
}

fn quoted(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn insert(dialect: Dialect, table: Table, record: &Record) -> Result<Statement, BackendError> {
    if record.is_empty() {
        return Err(BackendError::EmptyRecord(table.name()));
    }
    let mut b = Builder::new(dialect);
    let mut columns = Vec::with_capacity(record.len());
    let mut placeholders = Vec::with_capacity(record.len());
    for (field, value) in record {
        columns.push(table.column(field)?.to_string());
        placeholders.push(b.bind(value.clone()));
    }
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table.name(),
        quoted(&columns),
        placeholders.join(", ")
    );
    Ok(b.finish(sql, Vec::new()))
}

/// `INSERT ... ON CONFLICT (key) DO UPDATE` on the non-key columns.
///
/// `key` must name a primary key or unique index of `table`.
pub fn upsert(
    dialect: Dialect,
    table: Table,
    record: &Record,
    key: &[&str],
) -> Result<Statement, BackendError> {
    let mut stmt = insert(dialect, table, record)?;
    if key.is_empty() {
        return Err(BackendError::Unfiltered(table.name()));
    }
    let key = key
        .iter()
        .map(|k| table.column(k).map(str::to_string))
        .collect::<Result<Vec<_>, _>>()?;
    let mut updates = Vec::new();
    for field in record.keys() {
        let column = table.column(field)?;
        if !key.iter().any(|k| k == column) {
            updates.push(format!("\"{column}\" = excluded.\"{column}\""));
        }
    }
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    stmt.sql = format!("{} ON CONFLICT ({}) {action}", stmt.sql, quoted(&key));
    Ok(stmt)
}

pub fn select(
    dialect: Dialect,
    table: Table,
    fields: &[&str],
    field: &str,
    matches: &Match,
) -> Result<Statement, BackendError> {
    let columns = column_list(table, fields)?;
    let column = table.column(field)?;
    let mut b = Builder::new(dialect);
    let condition = b.condition(column, matches);
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE {condition}",
        quoted(&columns),
        table.name()
    );
    Ok(b.finish(sql, columns))
}

pub fn update(
    dialect: Dialect,
    table: Table,
    patch: &Record,
    field: &str,
    value: Value,
) -> Result<Statement, BackendError> {
    if patch.is_empty() {
        return Err(BackendError::EmptyRecord(table.name()));
    }
    let mut b = Builder::new(dialect);
    let mut assignments = Vec::with_capacity(patch.len());
    for (name, v) in patch {
        let column = table.column(name)?;
        let p = b.bind(v.clone());
        assignments.push(format!("\"{column}\" = {p}"));
    }
    let column = table.column(field)?;
    let condition = b.condition(column, &Match::One(value));
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE {condition}",
        table.name(),
        assignments.join(", ")
    );
    Ok(b.finish(sql, Vec::new()))
}

pub fn delete_equal(
    dialect: Dialect,
    table: Table,
    field: &str,
    value: Value,
) -> Result<Statement, BackendError> {
    let column = table.column(field)?;
    let mut b = Builder::new(dialect);
    let condition = b.condition(column, &Match::One(value));
    let sql = format!("DELETE FROM \"{}\" WHERE {condition}", table.name());
    Ok(b.finish(sql, Vec::new()))
}

/// Delete rows matching every filter. At least one filter is required.
pub fn delete_matching(
    dialect: Dialect,
    table: Table,
    filters: &[(&str, Match)],
) -> Result<Statement, BackendError> {
    if filters.is_empty() {
        return Err(BackendError::Unfiltered(table.name()));
    }
    let mut b = Builder::new(dialect);
    let mut conditions = Vec::with_capacity(filters.len());
    for (field, matches) in filters {
        let column = table.column(field)?;
        conditions.push(b.condition(column, matches));
    }
    let sql = format!(
        "DELETE FROM \"{}\" WHERE {}",
        table.name(),
        conditions.join(" AND ")
    );
    Ok(b.finish(sql, Vec::new()))
}

pub fn delete_expired(
    dialect: Dialect,
    table: Table,
    field: &str,
    now: i64,
) -> Result<Statement, BackendError> {
    let column = table.column(field)?;
    let mut b = Builder::new(dialect);
    let p = b.bind(Value::Integer(now));
    let sql = format!(
        "DELETE FROM \"{}\" WHERE \"{column}\" IS NOT NULL AND \"{column}\" <= {p}",
        table.name()
    );
    Ok(b.finish(sql, Vec::new()))
}

pub fn take(
    dialect: Dialect,
    table: Table,
    fields: &[&str],
    field: &str,
    value: Value,
) -> Result<Statement, BackendError> {
    let columns = column_list(table, fields)?;
    let column = table.column(field)?;
    let mut b = Builder::new(dialect);
    let condition = b.condition(column, &Match::One(value));
    let sql = format!(
        "DELETE FROM \"{}\" WHERE {condition} RETURNING {}",
        table.name(),
        quoted(&columns)
    );
    Ok(b.finish(sql, columns))
}

pub fn count(
    dialect: Dialect,
    table: Table,
    field: &str,
    matches: Option<&Match>,
) -> Result<Statement, BackendError> {
    let column = table.column(field)?;
    let mut b = Builder::new(dialect);
    let sql = match matches {
        Some(m) => {
            let condition = b.condition(column, m);
            format!(
                "SELECT COUNT(*) AS \"{COUNT_COLUMN}\" FROM \"{}\" WHERE {condition}",
                table.name()
            )
        }
        None => format!(
            "SELECT COUNT(\"{column}\") AS \"{COUNT_COLUMN}\" FROM \"{}\"",
            table.name()
        ),
    };
    Ok(b.finish(sql, vec![COUNT_COLUMN.to_string()]))
}
