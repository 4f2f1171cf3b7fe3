//! Embedded file-based backend on SQLite.
//!
//! A small `r2d2` pool of WAL-mode connections. Readers run in parallel;
//! writers are serialised by SQLite's own lock (taken with `BEGIN IMMEDIATE`),
//! with `busy_timeout` absorbing short contention. Every call hops onto the blocking pool so the async
//! executor never waits on file I/O.

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, TransactionBehavior};
use std::path::{Path, PathBuf};

use super::{schema, Backend, BackendError, Dialect, Record, Statement, Value};

/// Milliseconds a connection waits on a locked database before `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5000;

pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteBackend {
    /// Open (or create) the database file and its schema.
    pub async fn open(path: &Path, pool_size: u32) -> Result<Self, BackendError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(path, pool_size)).await?
    }

    fn open_blocking(path: PathBuf, pool_size: u32) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.execute_batch(&format!(
                "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous  = NORMAL;"
            ))
        });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .min_idle(Some(1))
            .build(manager)?;

        {
            let conn = pool.get()?;
            for ddl in schema::statements(Dialect::Sqlite) {
                conn.execute_batch(&ddl)?;
            }
        }

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Text(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
    }
}

/// Writes take the lock up front (`BEGIN IMMEDIATE`) so a stale WAL snapshot
/// cannot fail a `DELETE ... RETURNING` outside the busy handler.
fn is_read_only(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("SELECT"))
}

fn collect_rows(conn: &Connection, stmt: &Statement) -> Result<Vec<Record>, BackendError> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let rows = prepared
        .query_map(rusqlite::params_from_iter(stmt.params.iter()), |row| {
            let mut record = Record::new();
            for (i, name) in stmt.columns.iter().enumerate() {
                record.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            Ok(record)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, stmt: Statement) -> Result<u64, BackendError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(&stmt.sql, rusqlite::params_from_iter(stmt.params.iter()))?;
            tx.commit()?;
            Ok(u64::try_from(changed).unwrap_or(u64::MAX))
        })
        .await?
    }

    async fn query(&self, stmt: Statement) -> Result<Vec<Record>, BackendError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            if is_read_only(&stmt.sql) {
                return collect_rows(&conn, &stmt);
            }
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows = collect_rows(&tx, &stmt)?;
            tx.commit()?;
            Ok(rows)
        })
        .await?
    }
}

// ── Tests ───────────────────────────────────────────────────────────
