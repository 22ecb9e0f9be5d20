//! Tracked, bounded set of detached background tasks.
//!
//! Backfill uploads and cached-link probes run off the request path.  They are
//! spawned through [`BackgroundTasks`] so that the number in flight is capped
//! and shutdown can wait for them (and cancel whatever is left).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::metrics::TaskKind;

#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

impl BackgroundTasks {
    /// Create a task set allowing at most `max_in_flight` concurrent tasks.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    /// Spawn `task` unless the set is full or shutting down.  Returns whether
    /// the task was started; a task that is not started is dropped, the
    /// caller never waits for capacity.
    pub fn spawn<F>(&self, kind: TaskKind, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() || self.tracker.is_closed() {
            debug!(?kind, "task set closed, dropping background task");
            return false;
        }
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(?kind, "background task limit reached, dropping task");
                return false;
            }
        };

        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                () = cancel.cancelled() => debug!(?kind, "background task cancelled"),
                () = task => {}
            }
        });
        true
    }

    /// Number of tasks currently running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait until every task spawned so far has finished, then accept new
    /// tasks again.
    #[cfg(test)]
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting tasks, wait up to `timeout` for the running ones, then
    /// cancel the rest.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tracker.close();
        if !self.is_empty() {
            info!(running = self.len(), "waiting for background tasks");
        }
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.len(),
                "background tasks did not finish in time, cancelling"
            );
            self.cancel.cancel();
            self.tracker.wait().await;
        }
        info!("background tasks drained");
    }
}
