//! Backend adapter: uniform async CRUD over the engine's relational tables.
//!
//! One [`Backend`] trait, one struct per storage engine:
//!
//! - [`SqliteBackend`]: embedded file store (`rusqlite` + `r2d2` pool)
//! - `PostgresBackend`: client-server store, behind the `backend-postgres` feature
//!
//! Engines only know how to run a prepared [`Statement`]; the SQL text itself is
//! produced by [`sql`], so every call site sees the same semantics regardless of
//! dialect. Handles are obtained through [`connect`], which creates the schema
//! before returning, so a handle in hand is always ready for use.

pub mod schema;
pub mod sql;
pub mod sqlite;

#[cfg(feature = "backend-postgres")]
pub mod postgres;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{DatabaseConfig, DatabaseEngine};

pub use sql::{Dialect, Statement};
pub use sqlite::SqliteBackend;

#[cfg(feature = "backend-postgres")]
pub use self::postgres::PostgresBackend;

// ── Values ──────────────────────────────────────────────────────

/// A single column value. The engine's tables only hold text and integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Self::Text(s.clone())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A row, keyed by column name.
pub type Record = BTreeMap<String, Value>;

/// Build a [`Record`] from `(column, value)` pairs.
pub fn record<I, K, V>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Match condition on a single column.
///
/// `Any` behaves as a set-membership filter (`IN`): the result is the union of
/// matching rows and never repeats a row once per matching value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    One(Value),
    Any(Vec<Value>),
}

impl Match {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Any(values) if values.is_empty())
    }
}

impl From<Value> for Match {
    fn from(v: Value) -> Self {
        Self::One(v)
    }
}

impl From<&str> for Match {
    fn from(s: &str) -> Self {
        Self::One(s.into())
    }
}

impl From<String> for Match {
    fn from(s: String) -> Self {
        Self::One(s.into())
    }
}

impl From<Vec<String>> for Match {
    fn from(values: Vec<String>) -> Self {
        values.into_iter().collect()
    }
}

impl<T: Into<Value>> FromIterator<T> for Match {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::Any(iter.into_iter().map(Into::into).collect())
    }
}

// ── Tables ──────────────────────────────────────────────────────

/// The closed set of tables the engine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Durable tokens (sessions, federation bearer tokens, ...).
    AccessTokens,
    /// Single-use tokens, deleted on successful verification.
    OneTimeTokens,
    /// Engine key/value state (pepper slots).
    Keys,
    /// Salted-hash index written by the directory sync.
    Hashes,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::AccessTokens,
        Table::OneTimeTokens,
        Table::Keys,
        Table::Hashes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::AccessTokens => "access_tokens",
            Self::OneTimeTokens => "one_time_tokens",
            Self::Keys => "keys",
            Self::Hashes => "hashes",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::AccessTokens | Self::OneTimeTokens => &["id", "data", "expires"],
            Self::Keys => &["name", "data"],
            Self::Hashes => &["hash", "pepper", "algorithm", "medium", "value"],
        }
    }

    /// Resolve a caller-supplied column name against this table.
    pub(crate) fn column(self, field: &str) -> Result<&'static str, BackendError> {
        self.columns()
            .iter()
            .copied()
            .find(|c| *c == field)
            .ok_or_else(|| BackendError::UnknownColumn {
                table: self.name(),
                column: field.to_string(),
            })
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[cfg(feature = "backend-postgres")]
    #[error("postgres: {0}")]
    Postgres(#[from] ::postgres::Error),

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unknown column `{column}` on table `{table}`")]
    UnknownColumn { table: &'static str, column: String },

    #[error("nothing to write to `{0}`")]
    EmptyRecord(&'static str),

    #[error("refusing unfiltered statement on `{0}`")]
    Unfiltered(&'static str),

    #[error("unexpected value in column `{0}`")]
    Decode(String),

    #[error("backend misconfigured: {0}")]
    Config(String),
}

impl BackendError {
    /// Lock/busy/serialization conflicts that may succeed when re-issued.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            #[cfg(feature = "backend-postgres")]
            Self::Postgres(err) => {
                use ::postgres::error::SqlState;
                matches!(
                    err.code(),
                    Some(code) if *code == SqlState::T_R_SERIALIZATION_FAILURE
                        || *code == SqlState::T_R_DEADLOCK_DETECTED
                )
            }
            _ => false,
        }
    }
}

// ── Adapter contract ────────────────────────────────────────────

/// Storage engine capability.
///
/// Implementors provide [`execute`](Backend::execute) and
/// [`query`](Backend::query); the CRUD contract is built on top of those two
/// and is identical for every engine.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short engine name for logs ("sqlite", "postgres").
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Run a statement that returns no rows. Returns the affected row count.
    async fn execute(&self, stmt: Statement) -> Result<u64, BackendError>;

    /// Run a statement and collect its rows, keyed by `stmt.columns`.
    async fn query(&self, stmt: Statement) -> Result<Vec<Record>, BackendError>;

    async fn insert(&self, table: Table, record: Record) -> Result<(), BackendError> {
        let stmt = sql::insert(self.dialect(), table, &record)?;
        self.execute(stmt).await.map(|_| ())
    }

    /// Select `fields` (all columns when empty) from rows where `field` matches.
    async fn get(
        &self,
        table: Table,
        fields: &[&str],
        field: &str,
        matches: Match,
    ) -> Result<Vec<Record>, BackendError> {
        if matches.is_empty() {
            table.column(field)?;
            return Ok(Vec::new());
        }
        let stmt = sql::select(self.dialect(), table, fields, field, &matches)?;
        self.query(stmt).await
    }

    /// Insert, or overwrite the non-key columns of the row sharing `key`.
    async fn upsert(&self, table: Table, record: Record, key: &[&str]) -> Result<(), BackendError> {
        let stmt = sql::upsert(self.dialect(), table, &record, key)?;
        self.execute(stmt).await.map(|_| ())
    }

    async fn update(
        &self,
        table: Table,
        patch: Record,
        field: &str,
        value: Value,
    ) -> Result<u64, BackendError> {
        let stmt = sql::update(self.dialect(), table, &patch, field, value)?;
        self.execute(stmt).await
    }

    async fn delete_equal(
        &self,
        table: Table,
        field: &str,
        value: Value,
    ) -> Result<u64, BackendError> {
        let stmt = sql::delete_equal(self.dialect(), table, field, value)?;
        self.execute(stmt).await
    }

    /// Delete rows matching every `(field, matches)` filter. An empty `Any`
    /// filter matches nothing and deletes nothing.
    async fn delete_matching(
        &self,
        table: Table,
        filters: &[(&str, Match)],
    ) -> Result<u64, BackendError> {
        let stmt = sql::delete_matching(self.dialect(), table, filters)?;
        if filters.iter().any(|(_, m)| m.is_empty()) {
            return Ok(0);
        }
        self.execute(stmt).await
    }

    /// Delete rows whose non-null `field` is at or before `now`.
    async fn delete_expired(
        &self,
        table: Table,
        field: &str,
        now: i64,
    ) -> Result<u64, BackendError> {
        let stmt = sql::delete_expired(self.dialect(), table, field, now)?;
        self.execute(stmt).await
    }

    /// Atomically delete the row where `field = value` and return it.
    ///
    /// A single `DELETE ... RETURNING` statement: when callers race on the same
    /// row, exactly one of them gets `Some`.
    async fn take(
        &self,
        table: Table,
        fields: &[&str],
        field: &str,
        value: Value,
    ) -> Result<Option<Record>, BackendError> {
        let stmt = sql::take(self.dialect(), table, fields, field, value)?;
        Ok(self.query(stmt).await?.into_iter().next())
    }

    /// Count distinct rows matching `matches`, or rows with a non-null `field`.
    async fn get_count(
        &self,
        table: Table,
        field: &str,
        matches: Option<Match>,
    ) -> Result<u64, BackendError> {
        if matches.as_ref().is_some_and(Match::is_empty) {
            table.column(field)?;
            return Ok(0);
        }
        let stmt = sql::count(self.dialect(), table, field, matches.as_ref())?;
        let rows = self.query(stmt).await?;
        let count = rows
            .first()
            .and_then(|r| r.get(sql::COUNT_COLUMN))
            .and_then(Value::as_i64)
            .ok_or_else(|| BackendError::Decode(sql::COUNT_COLUMN.to_string()))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Release the engine's connection. Engines with a single connection
    /// reject later calls with a backend error.
    async fn close(&self) {}
}

/// Open the configured storage engine and create the schema.
///
/// The returned handle is ready: schema creation has completed.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Backend>, BackendError> {
    match config.engine {
        DatabaseEngine::Sqlite => {
            let path = config.resolved_path()?;
            let backend = SqliteBackend::open(&path, config.pool_size).await?;
            tracing::info!(path = %path.display(), "SQLite backend ready");
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "backend-postgres")]
        DatabaseEngine::Postgres => {
            let backend = PostgresBackend::connect(config).await?;
            tracing::info!(
                host = config.host.as_str(),
                database = config.name.as_str(),
                "PostgreSQL backend ready"
            );
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "backend-postgres"))]
        DatabaseEngine::Postgres => Err(BackendError::Config(
            "built without the `backend-postgres` feature".into(),
        )),
    }
}
