//! Cancellable background task handles.
//!
//! The reaper and the pepper rotation each run as an independent
//! `tokio::spawn` task owning a [`CancellationToken`]. Cancellation is only
//! checked while the task is idle, so a tick that already started (a sweep, a
//! rotation) always runs to completion.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `body` with a fresh cancellation token.
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(body(cancel.clone()));
        tracing::debug!(task = name, "Background task started");
        Self {
            name,
            cancel,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request cancellation and wait for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::warn!(task = self.name, error = %e, "Background task ended abnormally");
            }
        }
        tracing::debug!(task = self.name, "Background task stopped");
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, delay: std::time::Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ticking(counter: Arc<AtomicUsize>) -> TaskHandle {
        TaskHandle::spawn("ticker", move |cancel| async move {
            while sleep_or_cancel(&cancel, Duration::from_millis(10)).await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn stopped_task_fires_no_further_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = ticking(Arc::clone(&counter));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.name(), "ticker");
        handle.stop().await;

        let seen = counter.load(Ordering::SeqCst);
        assert!(seen > 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(ticking(Arc::clone(&counter)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
