//! Pepper manager: the rotating lookup salt.
//!
//! Two slots, `current` and `previous`. Hashes computed under `previous` stay
//! acceptable for one rotation interval after it stopped being current; the
//! next rotation retires it. Both slots persist in the `keys` table so a
//! restart keeps the hashing contract with clients.
//!
//! The rotation task is the only writer. Readers take a cloned snapshot under a
//! short read lock and never hold it across an `.await`.

mod schedule;

pub use schedule::PepperSchedule;

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::backend::{record, Backend, Match, Table, Value};
use crate::error::Result;
use crate::lookup::HashIndexer;
use crate::scheduler::{sleep_or_cancel, TaskHandle};
use crate::tokens::random_string;

/// Generated pepper length.
pub const PEPPER_LEN: usize = 32;

const CURRENT_KEY: &str = "current_pepper";
const PREVIOUS_KEY: &str = "previous_pepper";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PepperState {
    pub current: String,
    /// `None` until the first rotation.
    pub previous: Option<String>,
}

/// Outcome of one rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub current: String,
    pub previous: String,
    /// Pepper that is no longer acceptable, if there was one.
    pub retired: Option<String>,
}

pub struct PepperManager {
    backend: Arc<dyn Backend>,
    state: RwLock<PepperState>,
}

impl PepperManager {
    /// Load both slots from storage, generating and persisting a current
    /// pepper on first start.
    pub async fn load(backend: Arc<dyn Backend>) -> Result<Self> {
        let names: Match = [CURRENT_KEY, PREVIOUS_KEY].into_iter().collect();
        let rows = backend
            .get(Table::Keys, &["name", "data"], "name", names)
            .await?;

        let slot = |key: &str| {
            rows.iter()
                .find(|r| r.get("name").and_then(Value::as_str) == Some(key))
                .and_then(|r| r.get("data"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let previous = slot(PREVIOUS_KEY);

        let current = match slot(CURRENT_KEY) {
            Some(current) => current,
            None => {
                let fresh = random_string(PEPPER_LEN);
                write_key(backend.as_ref(), CURRENT_KEY, &fresh).await?;
                tracing::info!("Generated initial lookup pepper");
                fresh
            }
        };

        Ok(Self {
            backend,
            state: RwLock::new(PepperState { current, previous }),
        })
    }

    pub fn current_salt(&self) -> String {
        self.state.read().current.clone()
    }

    pub fn previous_salt(&self) -> Option<String> {
        self.state.read().previous.clone()
    }

    pub fn snapshot(&self) -> PepperState {
        self.state.read().clone()
    }

    /// True for the current pepper and, after a rotation, the previous one.
    pub fn is_acceptable(&self, salt: &str) -> bool {
        let state = self.state.read();
        state.current == salt || state.previous.as_deref() == Some(salt)
    }

    /// Replace the current pepper with a fresh one.
    pub(crate) async fn rotate(&self) -> Result<Rotation> {
        let fresh = Self::prepare_rotation();
        self.commit_rotation(fresh).await
    }

    /// Generate the next pepper without advertising it. Anything keyed on it
    /// (hash rows) can be written before `commit_rotation` makes it current.
    pub(crate) fn prepare_rotation() -> String {
        random_string(PEPPER_LEN)
    }

    /// Make `fresh` current and demote the current pepper to previous.
    /// Storage is updated before memory, so a failed write leaves the
    /// in-memory slots untouched.
    pub(crate) async fn commit_rotation(&self, fresh: String) -> Result<Rotation> {
        let before = self.snapshot();

        // Previous first: a crash between the writes leaves current == previous,
        // which still accepts every hash clients may hold.
        write_key(self.backend.as_ref(), PREVIOUS_KEY, &before.current).await?;
        write_key(self.backend.as_ref(), CURRENT_KEY, &fresh).await?;

        *self.state.write() = PepperState {
            current: fresh.clone(),
            previous: Some(before.current.clone()),
        };

        Ok(Rotation {
            current: fresh,
            previous: before.current,
            retired: before.previous,
        })
    }
}

async fn write_key(backend: &dyn Backend, name: &str, data: &str) -> Result<()> {
    backend
        .upsert(Table::Keys, record([("name", name), ("data", data)]), &["name"])
        .await?;
    Ok(())
}

/// Rotate on `schedule` until cancelled. With an indexer, the new pepper is
/// indexed before it is advertised and rows of the retired one are dropped.
pub fn spawn_rotation(
    manager: Arc<PepperManager>,
    schedule: PepperSchedule,
    indexer: Option<Arc<HashIndexer>>,
) -> TaskHandle {
    TaskHandle::spawn("pepper-rotation", move |cancel| async move {
        tracing::info!(cron = schedule.as_str(), "Pepper rotation scheduled");
        loop {
            let now = Utc::now();
            let Some(next) = schedule.next_after(now) else {
                tracing::warn!(cron = schedule.as_str(), "Pepper schedule has no future fire time");
                break;
            };
            let delay = (next - now).to_std().unwrap_or_default();
            if !sleep_or_cancel(&cancel, delay).await {
                break;
            }

            match &indexer {
                Some(indexer) => match indexer.rotate_pepper().await {
                    Ok((rotation, stats)) => tracing::info!(
                        retired = rotation.retired.is_some(),
                        indexed = stats.indexed,
                        removed = stats.removed,
                        "Lookup pepper rotated"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Pepper rotation failed"),
                },
                None => match manager.rotate().await {
                    Ok(rotation) => tracing::info!(
                        retired = rotation.retired.is_some(),
                        "Lookup pepper rotated"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Pepper rotation failed"),
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn test_backend() -> (TempDir, Arc<dyn Backend>) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(&tmp.path().join("pepper.db"), 2)
            .await
            .unwrap();
        (tmp, Arc::new(backend))
    }

    #[tokio::test]
    async fn first_load_generates_and_persists_current() {
        let (_tmp, backend) = test_backend().await;
        let manager = PepperManager::load(Arc::clone(&backend)).await.unwrap();
        let state = manager.snapshot();
        assert_eq!(state.current.len(), PEPPER_LEN);
        assert!(state.previous.is_none());

        let reloaded = PepperManager::load(backend).await.unwrap();
        assert_eq!(reloaded.snapshot(), state);
    }

    #[tokio::test]
    async fn rotation_keeps_previous_for_exactly_one_interval() {
        let (_tmp, backend) = test_backend().await;
        let manager = PepperManager::load(Arc::clone(&backend)).await.unwrap();
        let p0 = manager.current_salt();

        let first = manager.rotate().await.unwrap();
        assert_eq!(first.previous, p0);
        assert_eq!(first.retired, None);
        assert!(manager.is_acceptable(&p0));
        assert!(manager.is_acceptable(&first.current));

        let second = manager.rotate().await.unwrap();
        assert_eq!(second.retired.as_deref(), Some(p0.as_str()));
        assert!(!manager.is_acceptable(&p0));
        assert!(manager.is_acceptable(&first.current));
        assert_eq!(manager.previous_salt().as_deref(), Some(first.current.as_str()));
        assert!(!manager.is_acceptable(""));

        let reloaded = PepperManager::load(backend).await.unwrap();
        assert_eq!(reloaded.snapshot(), manager.snapshot());
    }

    #[tokio::test]
    async fn prepared_pepper_stays_unadvertised_until_committed() {
        let (_tmp, backend) = test_backend().await;
        let manager = PepperManager::load(Arc::clone(&backend)).await.unwrap();
        let p0 = manager.current_salt();

        let fresh = PepperManager::prepare_rotation();
        assert_eq!(fresh.len(), PEPPER_LEN);
        assert_eq!(manager.current_salt(), p0);
        assert!(!manager.is_acceptable(&fresh));
        assert_eq!(PepperManager::load(Arc::clone(&backend)).await.unwrap().current_salt(), p0);

        let rotation = manager.commit_rotation(fresh.clone()).await.unwrap();
        assert_eq!(rotation.current, fresh);
        assert_eq!(manager.current_salt(), fresh);
        assert_eq!(backend.get_count(Table::Keys, "name", None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn scheduled_rotation_fires_and_stops() {
        let (_tmp, backend) = test_backend().await;
        let manager = Arc::new(PepperManager::load(backend).await.unwrap());
        let p0 = manager.current_salt();

        let schedule = PepperSchedule::parse("* * * * * *").unwrap();
        let handle = spawn_rotation(Arc::clone(&manager), schedule, None);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.stop().await;

        assert_ne!(manager.current_salt(), p0);
        let frozen = manager.snapshot();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(manager.snapshot(), frozen);
    }
}
