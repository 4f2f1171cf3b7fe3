use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{hash_address, Algorithm, Directory, DirectoryEntry, Medium, QUERY_CHUNK};
use crate::backend::{record, Backend, Match, Table, Value};
use crate::error::Result;
use crate::pepper::{PepperManager, Rotation};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    /// Rows written.
    pub indexed: u64,
    /// Rows deleted (stale rows of the re-indexed pepper plus retired ones).
    pub removed: u64,
}

impl std::ops::AddAssign for IndexStats {
    fn add_assign(&mut self, other: Self) {
        self.indexed += other.indexed;
        self.removed += other.removed;
    }
}

/// Sole writer of the `hashes` table.
///
/// Writes are serialised by an internal lock. Re-indexing a pepper upserts
/// the fresh rows before pruning stale ones, and a rotation indexes the new
/// pepper before it is advertised, so an acceptable hash never stops
/// resolving while the index is rebuilt.
pub struct HashIndexer {
    backend: Arc<dyn Backend>,
    pepper: Arc<PepperManager>,
    directory: Arc<dyn Directory>,
    algorithms: Vec<Algorithm>,
    write_lock: Mutex<()>,
}

impl HashIndexer {
    pub fn new(
        backend: Arc<dyn Backend>,
        pepper: Arc<PepperManager>,
        directory: Arc<dyn Directory>,
        algorithms: Vec<Algorithm>,
    ) -> Self {
        Self {
            backend,
            pepper,
            directory,
            algorithms,
            write_lock: Mutex::new(()),
        }
    }

    /// Rebuild every row stored under `pepper` from the directory.
    pub async fn index_pepper(&self, pepper: &str) -> Result<IndexStats> {
        let _guard = self.write_lock.lock().await;
        self.write_pepper(pepper).await
    }

    /// Rebuild rows for both acceptable peppers after a directory change.
    pub async fn refresh(&self) -> Result<IndexStats> {
        let _guard = self.write_lock.lock().await;
        // Snapshot under the lock so a retired pepper is never re-indexed.
        let state = self.pepper.snapshot();
        let mut stats = self.write_pepper(&state.current).await?;
        if let Some(previous) = state.previous.as_deref().filter(|p| *p != state.current) {
            stats += self.write_pepper(previous).await?;
        }
        tracing::info!(indexed = stats.indexed, removed = stats.removed, "Hash index refreshed");
        Ok(stats)
    }

    /// Rotate the pepper: index a fresh one, advertise it, then drop rows of
    /// the retired one.
    pub async fn rotate_pepper(&self) -> Result<(Rotation, IndexStats)> {
        let _guard = self.write_lock.lock().await;
        let fresh = PepperManager::prepare_rotation();

        let mut stats = match self.write_pepper(&fresh).await {
            Ok(stats) => stats,
            Err(e) => {
                self.discard(&fresh).await;
                return Err(e);
            }
        };
        let rotation = match self.pepper.commit_rotation(fresh.clone()).await {
            Ok(rotation) => rotation,
            Err(e) => {
                self.discard(&fresh).await;
                return Err(e);
            }
        };

        if let Some(retired) = &rotation.retired {
            stats.removed += self
                .backend
                .delete_equal(Table::Hashes, "pepper", Value::from(retired.as_str()))
                .await?;
        }
        Ok((rotation, stats))
    }

    async fn write_pepper(&self, pepper: &str) -> Result<IndexStats> {
        let entries = self.directory.entries().await?;

        let mut fresh = HashSet::new();
        let mut indexed = 0;
        for entry in &entries {
            for (medium, address) in addresses(entry) {
                for &algorithm in &self.algorithms {
                    let hash = hash_address(algorithm, &address, medium, pepper);
                    self.backend
                        .upsert(
                            Table::Hashes,
                            record([
                                ("hash", hash.as_str()),
                                ("pepper", pepper),
                                ("algorithm", algorithm.as_str()),
                                ("medium", medium.as_str()),
                                ("value", entry.user_id.as_str()),
                            ]),
                            &["hash", "pepper"],
                        )
                        .await?;
                    fresh.insert(hash);
                    indexed += 1;
                }
            }
        }

        // Prune only once every fresh row is in place.
        let existing = self
            .backend
            .get(Table::Hashes, &["hash"], "pepper", Match::from(pepper))
            .await?;
        let stale: Vec<String> = existing
            .iter()
            .filter_map(|row| row.get("hash").and_then(Value::as_str))
            .filter(|hash| !fresh.contains(*hash))
            .map(str::to_string)
            .collect();

        let mut removed = 0;
        for chunk in stale.chunks(QUERY_CHUNK) {
            removed += self
                .backend
                .delete_matching(
                    Table::Hashes,
                    &[("pepper", Match::from(pepper)), ("hash", Match::from(chunk.to_vec()))],
                )
                .await?;
        }
        Ok(IndexStats { indexed, removed })
    }

    /// Best-effort removal of rows under a pepper that was never advertised.
    async fn discard(&self, pepper: &str) {
        if let Err(e) = self
            .backend
            .delete_equal(Table::Hashes, "pepper", Value::from(pepper))
            .await
        {
            tracing::warn!(error = %e, "Failed to discard rows of an unused pepper");
        }
    }
}

fn addresses(entry: &DirectoryEntry) -> Vec<(Medium, String)> {
    let mut out = Vec::with_capacity(2);
    if let Some(email) = entry.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        out.push((Medium::Email, email.to_lowercase()));
    }
    if let Some(phone) = entry.phone.as_deref() {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            out.push((Medium::Phone, digits));
        }
    }
    out
}
