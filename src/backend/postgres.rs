//! Client-server backend on PostgreSQL.
//!
//! Uses the blocking `postgres` client behind a mutex; each call is moved to
//! the blocking pool. `DELETE ... RETURNING` runs under PostgreSQL's row lock,
//! so concurrent consumers of the same row see exactly one winner.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use postgres::types::{IsNull, ToSql, Type};
use postgres::{Client, NoTls};
use std::sync::Arc;

use super::{schema, Backend, BackendError, Dialect, Record, Statement, Value};
use crate::config::DatabaseConfig;

pub struct PostgresBackend {
    client: Arc<Mutex<Option<Client>>>,
}

impl PostgresBackend {
    /// Connect and create the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, BackendError> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&config)).await?
    }

    fn connect_blocking(config: &DatabaseConfig) -> Result<Self, BackendError> {
        if config.host.trim().is_empty() {
            return Err(BackendError::Config("database.host is empty".into()));
        }

        let mut pg = postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.name)
            .user(&config.user)
            .password(&config.password)
            .application_name("idlookup");

        let mut client = if config.ssl {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            pg.connect(tokio_postgres_rustls::MakeRustlsConnect::new(tls))?
        } else {
            pg.connect(NoTls)?
        };

        for ddl in schema::statements(Dialect::Postgres) {
            client.batch_execute(&ddl)?;
        }

        Ok(Self {
            client: Arc::new(Mutex::new(Some(client))),
        })
    }

    fn closed() -> BackendError {
        BackendError::Config("postgres connection closed".into())
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(i) => i.to_sql(ty, out),
            Value::Text(s) => s.as_str().to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <i64 as ToSql>::accepts(ty) || <&str as ToSql>::accepts(ty)
    }

    postgres::types::to_sql_checked!();
}

fn from_sql(row: &postgres::Row, idx: usize) -> Result<Value, postgres::Error> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::INT8 {
        Value::from(row.try_get::<_, Option<i64>>(idx)?)
    } else if *ty == Type::INT4 {
        Value::from(row.try_get::<_, Option<i32>>(idx)?.map(i64::from))
    } else {
        Value::from(row.try_get::<_, Option<String>>(idx)?)
    };
    Ok(value)
}

fn bind(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Backend for PostgresBackend {
    fn name(&self) -> &str {
        "postgres"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, stmt: Statement) -> Result<u64, BackendError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut guard = client.lock();
            let client = guard.as_mut().ok_or_else(Self::closed)?;
            Ok(client.execute(stmt.sql.as_str(), &bind(&stmt.params))?)
        })
        .await?
    }

    async fn query(&self, stmt: Statement) -> Result<Vec<Record>, BackendError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut guard = client.lock();
            let client = guard.as_mut().ok_or_else(Self::closed)?;
            let rows = client.query(stmt.sql.as_str(), &bind(&stmt.params))?;
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut record = Record::new();
                for (i, name) in stmt.columns.iter().enumerate() {
                    record.insert(name.clone(), from_sql(row, i)?);
                }
                out.push(record);
            }
            Ok(out)
        })
        .await?
    }

    async fn close(&self) {
        let client = Arc::clone(&self.client);
        let joined = tokio::task::spawn_blocking(move || {
            if let Some(client) = client.lock().take() {
                if let Err(e) = client.close() {
                    tracing::warn!(error = %e, "PostgreSQL connection closed uncleanly");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            tracing::warn!(error = %e, "PostgreSQL close task ended abnormally");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
// Run against a live server with `TEST_PG=yes` (PG_HOST, PG_USER, PG_PASSWORD,
// PG_DATABASE override the defaults).

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{record, Match, Table};
    use crate::config::DatabaseEngine;

    fn pg_config() -> Option<DatabaseConfig> {
        if std::env::var("TEST_PG").as_deref() != Ok("yes") {
            return None;
        }
        let env = |k: &str, d: &str| std::env::var(k).unwrap_or_else(|_| d.to_string());
        Some(DatabaseConfig {
            engine: DatabaseEngine::Postgres,
            host: env("PG_HOST", "localhost"),
            user: env("PG_USER", "idlookup"),
            password: env("PG_PASSWORD", "idlookup"),
            name: env("PG_DATABASE", "test"),
            ..DatabaseConfig::default()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn postgres_contract() {
        let Some(config) = pg_config() else { return };
        let db = PostgresBackend::connect(&config).await.unwrap();
        let id = format!("pg-{}", crate::tokens::random_string(16));

        db.insert(
            Table::OneTimeTokens,
            record([
                ("id", Value::from(id.as_str())),
                ("data", Value::from("{}")),
                ("expires", Value::Integer(1)),
            ]),
        )
        .await
        .unwrap();

        let both: Match = [id.clone(), format!("{id}z")].into_iter().collect();
        assert_eq!(
            db.get_count(Table::OneTimeTokens, "id", Some(both)).await.unwrap(),
            1
        );
        let rows = db
            .get(Table::OneTimeTokens, &["id", "expires"], "id", Match::from(id.as_str()))
            .await
            .unwrap();
        assert_eq!(rows[0]["expires"], Value::Integer(1));

        let taken = db
            .take(Table::OneTimeTokens, &["data"], "id", Value::from(id.as_str()))
            .await
            .unwrap();
        assert!(taken.is_some());
        assert!(db
            .take(Table::OneTimeTokens, &["data"], "id", Value::from(id.as_str()))
            .await
            .unwrap()
            .is_none());

        db.close().await;
        assert!(db
            .get(Table::Keys, &["data"], "name", Match::from("current_pepper"))
            .await
            .is_err());
        db.close().await;
    }
}
