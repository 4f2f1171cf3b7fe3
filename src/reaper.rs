//! Expiry reaper: periodic delete of expired token rows.

use std::time::Duration;

use crate::scheduler::{sleep_or_cancel, TaskHandle};
use crate::tokens::{epoch_secs, TokenStore};

/// Start sweeping `store` every `interval`.
///
/// The first sweep runs one full interval after start. A failed sweep is
/// logged and retried on the next tick.
pub fn spawn(store: TokenStore, interval: Duration) -> TaskHandle {
    TaskHandle::spawn("reaper", move |cancel| async move {
        tracing::info!(interval_ms = interval_ms(interval), "Expiry reaper started");
        while sleep_or_cancel(&cancel, interval).await {
            sweep(&store).await;
        }
    })
}

fn interval_ms(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

/// One sweep. Returns the number of rows removed.
pub async fn sweep(store: &TokenStore) -> u64 {
    match store.purge_expired(epoch_secs()).await {
        Ok(0) => 0,
        Ok(removed) => {
            tracing::debug!(removed, "Swept expired tokens");
            removed
        }
        Err(e) => {
            tracing::warn!(error = %e, "Token sweep failed");
            0
        }
    }
}
