//! Token store: durable tokens and strictly single-use tokens.
//!
//! Tables:
//! - `access_tokens`: durable tokens, verified without deletion
//! - `one_time_tokens`: consumed by the verification that succeeds
//!
//! ## Design Decisions
//! - Identifiers are 64 characters from `[A-Za-z0-9]`, drawn from the thread
//!   CSPRNG, so collisions are not a practical concern.
//! - Creation awaits the insert before handing out the identifier; a returned
//!   id is always readable by the next caller.
//! - One-time verification is a single `DELETE ... RETURNING`, so the
//!   at-most-once guarantee comes from the storage engine's row locking and
//!   holds no matter how many verifications race.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{record, Backend, BackendError, Match, Record, Table, Value};
use crate::config::TokensConfig;
use crate::error::{Error, Result};

/// Token identifier length.
pub const TOKEN_LEN: usize = 64;

/// Attempts for the one-time consume step when storage reports a transient conflict.
const CONSUME_ATTEMPTS: u32 = 3;

/// Back-off between consume attempts (multiplied by the attempt number).
const CONSUME_BACKOFF: Duration = Duration::from_millis(20);

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random alphanumeric string.
///
/// Bytes at or above the largest multiple of the alphabet size are rejected so
/// every character is equally likely.
pub fn random_string(len: usize) -> String {
    let limit = (256 / ALPHABET.len() * ALPHABET.len()) as u8;
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let byte: u8 = rand::random();
        if byte < limit {
            out.push(ALPHABET[byte as usize % ALPHABET.len()] as char);
        }
    }
    out
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid("token identifier is empty"));
    }
    if id.len() > TOKEN_LEN || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::invalid("token identifier is malformed"));
    }
    Ok(())
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    serde_json::to_string(payload).map_err(|e| Error::invalid(format!("payload does not serialize: {e}")))
}

fn decode<T: DeserializeOwned>(row: &Record) -> Result<T> {
    let data = row
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Backend(BackendError::Decode("data".into())))?;
    serde_json::from_str(data).map_err(Error::CorruptPayload)
}

fn is_expired(row: &Record, now: i64) -> bool {
    row.get("expires")
        .and_then(Value::as_i64)
        .is_some_and(|expires| expires <= now)
}

/// Re-issue `op` while it fails with a transient storage conflict.
async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < CONSUME_ATTEMPTS => {
                tracing::debug!(attempt, error = %e, "Transient storage conflict, retrying");
                tokio::time::sleep(CONSUME_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Issues, verifies and expires tokens against a [`Backend`].
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn Backend>,
    /// Durable default lifetime; `None` = no expiry.
    default_ttl: Option<Duration>,
    one_time_ttl: Duration,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn Backend>, config: &TokensConfig) -> Self {
        Self {
            backend,
            default_ttl: (config.ttl_secs > 0).then(|| Duration::from_secs(config.ttl_secs)),
            one_time_ttl: Duration::from_secs(config.one_time_ttl_secs),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // ── Durable tokens ──────────────────────────────────────────────

    /// Create a durable token. `ttl = None` uses the configured default.
    pub async fn create_token<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let ttl = ttl.or(self.default_ttl);
        self.insert(Table::AccessTokens, payload, ttl).await
    }

    /// Look up a durable token without consuming it.
    pub async fn verify_token<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        validate_id(id)?;
        let rows = self
            .backend
            .get(Table::AccessTokens, &["data", "expires"], "id", Match::from(id))
            .await?;
        let row = rows.into_iter().next().ok_or(Error::NotFound)?;
        if is_expired(&row, epoch_secs()) {
            return Err(Error::Expired);
        }
        decode(&row)
    }

    /// Replace the payload of a durable token. Expiry is unchanged.
    pub async fn update_token<T: Serialize + ?Sized>(&self, id: &str, payload: &T) -> Result<()> {
        validate_id(id)?;
        let data = encode(payload)?;
        let changed = self
            .update(Table::AccessTokens, record([("data", data)]), "id", Value::from(id))
            .await?;
        if changed == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Delete a durable token. Returns whether a row was removed.
    pub async fn revoke_token(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let removed = self
            .backend
            .delete_equal(Table::AccessTokens, "id", Value::from(id))
            .await?;
        Ok(removed > 0)
    }

    // ── One-time tokens ─────────────────────────────────────────────

    /// Create a single-use token. `ttl = None` uses the short one-time default.
    pub async fn create_one_time_token<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let ttl = ttl.unwrap_or(self.one_time_ttl);
        self.insert(Table::OneTimeTokens, payload, Some(ttl)).await
    }

    /// Consume a single-use token.
    ///
    /// At most one call per identifier ever returns the payload; every other
    /// call, sequential or concurrent, gets [`Error::NotFound`]. A token taken
    /// after its expiry is gone either way and reports [`Error::Expired`].
    pub async fn verify_one_time_token<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        validate_id(id)?;
        let backend = &self.backend;
        let row = retry_transient(move || {
            backend.take(Table::OneTimeTokens, &["data", "expires"], "id", Value::from(id))
        })
        .await?
        .ok_or(Error::NotFound)?;

        if is_expired(&row, epoch_secs()) {
            return Err(Error::Expired);
        }
        decode(&row)
    }

    // ── Pass-throughs ───────────────────────────────────────────────

    pub async fn update(&self, table: Table, patch: Record, field: &str, value: Value) -> Result<u64> {
        Ok(self.backend.update(table, patch, field, value).await?)
    }

    pub async fn get_count(&self, table: Table, field: &str, matches: Option<Match>) -> Result<u64> {
        Ok(self.backend.get_count(table, field, matches).await?)
    }

    /// Delete durable and one-time rows whose expiry is at or before `now`.
    pub async fn purge_expired(&self, now: i64) -> Result<u64> {
        let mut removed = 0;
        for table in [Table::AccessTokens, Table::OneTimeTokens] {
            removed += self.backend.delete_expired(table, "expires", now).await?;
        }
        Ok(removed)
    }

    async fn insert<T: Serialize + ?Sized>(
        &self,
        table: Table,
        payload: &T,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let data = encode(payload)?;
        let id = random_string(TOKEN_LEN);
        let expires = ttl.map(|ttl| {
            epoch_secs().saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
        });
        self.backend
            .insert(
                table,
                record([
                    ("id", Value::from(id.as_str())),
                    ("data", Value::from(data)),
                    ("expires", Value::from(expires)),
                ]),
            )
            .await?;
        tracing::debug!(table = %table, "Token created");
        Ok(id)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use serde::Deserialize;
    use serde_json::{json, Value as Json};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, TokenStore) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(&tmp.path().join("tokens.db"), 8)
            .await
            .unwrap();
        let store = TokenStore::new(Arc::new(backend), &TokensConfig::default());
        (tmp, store)
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Session {
        sub: String,
        epoch: u32,
    }

    #[test]
    fn random_string_is_alphanumeric_with_requested_length() {
        let s = random_string(TOKEN_LEN);
        assert_eq!(s.len(), TOKEN_LEN);
        assert!(s.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(s, random_string(TOKEN_LEN));
    }

    #[tokio::test]
    async fn one_time_token_verifies_once() {
        let (_tmp, store) = test_store().await;
        let id = store.create_one_time_token(&json!({"a": 1}), None).await.unwrap();
        assert_eq!(id.len(), TOKEN_LEN);

        let data: Json = store.verify_one_time_token(&id).await.unwrap();
        assert_eq!(data["a"], 1);

        let again = store.verify_one_time_token::<Json>(&id).await.unwrap_err();
        assert!(matches!(again, Error::NotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_one_time_verification_has_one_winner() {
        let (_tmp, store) = test_store().await;
        let id = store.create_one_time_token(&json!({"a": 1}), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..24 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.verify_one_time_token::<Json>(&id).await
            }));
        }

        let (mut ok, mut not_found) = (0, 0);
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::NotFound) => not_found += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(not_found, 23);
    }

    #[tokio::test]
    async fn durable_token_survives_verification() {
        let (_tmp, store) = test_store().await;
        let session = Session { sub: "@dwho:example.com".into(), epoch: 1 };
        let id = store.create_token(&session, None).await.unwrap();

        let first: Session = store.verify_token(&id).await.unwrap();
        let second: Session = store.verify_token(&id).await.unwrap();
        assert_eq!(first, session);
        assert_eq!(second, session);
    }

    #[tokio::test]
    async fn update_replaces_payload() {
        let (_tmp, store) = test_store().await;
        let id = store.create_token(&json!({"a": 1}), None).await.unwrap();

        store.update_token(&id, &json!({"a": 2})).await.unwrap();
        let data: Json = store.verify_token(&id).await.unwrap();
        assert_eq!(data["a"], 2);

        let raw = store
            .update(
                Table::AccessTokens,
                record([("data", "{ \"a\": 3 }")]),
                "id",
                Value::from(id.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(raw, 1);
        let data: Json = store.verify_token(&id).await.unwrap();
        assert_eq!(data["a"], 3);

        let missing = store.update_token(&random_string(TOKEN_LEN), &json!({})).await;
        assert!(matches!(missing, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn count_tracks_creation_and_deletion() {
        let (_tmp, store) = test_store().await;
        let initial = store.get_count(Table::AccessTokens, "id", None).await.unwrap();
        let id = store.create_token(&json!({"a": 1}), None).await.unwrap();
        assert_eq!(
            store.get_count(Table::AccessTokens, "id", None).await.unwrap(),
            initial + 1
        );

        let count = |m: Match| store.get_count(Table::AccessTokens, "id", Some(m));
        assert_eq!(count(Match::from(id.as_str())).await.unwrap(), 1);
        assert_eq!(count(Match::from(format!("{id}z"))).await.unwrap(), 0);
        assert_eq!(
            count(vec![id.clone(), format!("{id}z")].into()).await.unwrap(),
            1
        );
        assert_eq!(count(vec![id.clone(), id.clone()].into()).await.unwrap(), 1);

        assert!(store.revoke_token(&id).await.unwrap());
        assert!(!store.revoke_token(&id).await.unwrap());
        assert_eq!(count(Match::from(id.as_str())).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_rows_are_rejected_and_purged() {
        let (_tmp, store) = test_store().await;
        let durable = store
            .create_token(&json!({}), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let once = store
            .create_one_time_token(&json!({}), Some(Duration::from_secs(1)))
            .await
            .unwrap();

        // Expiry is checked against wall-clock seconds; move "now" forward instead of sleeping.
        let later = epoch_secs() + 5;
        let removed = store.purge_expired(later).await.unwrap();
        assert_eq!(removed, 2);
        assert!(matches!(store.verify_token::<Json>(&durable).await, Err(Error::NotFound)));
        assert!(matches!(store.verify_one_time_token::<Json>(&once).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn expired_but_unreaped_rows_report_expired() {
        let (_tmp, store) = test_store().await;
        let id = random_string(TOKEN_LEN);
        for table in [Table::AccessTokens, Table::OneTimeTokens] {
            store
                .backend()
                .insert(
                    table,
                    record([
                        ("id", Value::from(id.as_str())),
                        ("data", Value::from("{}")),
                        ("expires", Value::Integer(epoch_secs() - 10)),
                    ]),
                )
                .await
                .unwrap();
        }

        assert!(matches!(store.verify_token::<Json>(&id).await, Err(Error::Expired)));
        assert!(matches!(store.verify_one_time_token::<Json>(&id).await, Err(Error::Expired)));
        // The expired one-time row is gone after the attempt.
        assert!(matches!(store.verify_one_time_token::<Json>(&id).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn zero_default_ttl_means_no_expiry() {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(&tmp.path().join("t.db"), 2).await.unwrap();
        let config = TokensConfig { ttl_secs: 0, ..TokensConfig::default() };
        let store = TokenStore::new(Arc::new(backend), &config);

        let id = store.create_token(&json!({}), None).await.unwrap();
        assert_eq!(store.purge_expired(i64::MAX).await.unwrap(), 0);
        let _: Json = store.verify_token(&id).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_payload_is_surfaced() {
        let (_tmp, store) = test_store().await;
        let id = store.create_token(&json!({"a": 1}), None).await.unwrap();
        store
            .update(Table::AccessTokens, record([("data", "{not json")]), "id", Value::from(id.as_str()))
            .await
            .unwrap();

        let err = store.verify_token::<Json>(&id).await.unwrap_err();
        assert!(matches!(err, Error::CorruptPayload(_)));

        // Shape mismatch is corruption too, not a silent default.
        let id = store.create_token(&json!({"a": 1}), None).await.unwrap();
        let err = store.verify_token::<Session>(&id).await.unwrap_err();
        assert!(matches!(err, Error::CorruptPayload(_)));
    }

    #[tokio::test]
    async fn malformed_ids_never_reach_storage() {
        let (_tmp, store) = test_store().await;
        for bad in ["", "has space", "semi;colon", &"a".repeat(TOKEN_LEN + 1)] {
            let err = store.verify_token::<Json>(bad).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{bad:?}");
            let err = store.verify_one_time_token::<Json>(bad).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{bad:?}");
        }
        // Well-formed but unknown is a plain miss.
        let err = store.verify_token::<Json>("abc123").await.unwrap_err();
        assert!(err.is_miss());
    }
}
