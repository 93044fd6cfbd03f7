//! Background task tracking and graceful shutdown.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period for background tasks when none is given.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the gateway-wide shutdown token and the background tasks bound to it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Coordinator with no tasks.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn `task` and wait for it during [`Self::graceful_shutdown`].
    ///
    /// The task should exit once [`Self::token`] fires.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        debug!(task = name, "background task started");
        self.tasks.lock().push((name, handle));
    }

    /// Tracked tasks not yet collected by a shutdown.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signal shutdown, then wait up to `timeout` for every tracked task.
    /// Tasks still running afterwards are aborted. Returns whether all
    /// tasks finished in time.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            task_count = tasks.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for background tasks"
        );

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        match tokio::time::timeout(timeout, drain).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(task = name, error = %e, "background task ended abnormally");
                    }
                }
                true
            }
            Err(_) => {
                let stuck: Vec<&str> = names
                    .iter()
                    .zip(&aborts)
                    .filter(|(_, h)| !h.is_finished())
                    .map(|(n, _)| *n)
                    .collect();
                warn!(?stuck, "shutdown timed out after {timeout:?}, aborting");
                for handle in &aborts {
                    handle.abort();
                }
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_idempotent_and_reaches_every_token() {
        let coord = ShutdownCoordinator::default();
        let t1 = coord.token();
        let t2 = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_tracked_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        coord.spawn("sweeper", async move {
            token.cancelled().await;
            let _ = done_tx.send(());
        });
        assert_eq!(coord.task_count(), 1);

        assert!(coord.graceful_shutdown(Some(Duration::from_secs(5))).await);
        assert!(done_rx.await.is_ok());
        assert_eq!(coord.task_count(), 0);
    }

    #[tokio::test]
    async fn stuck_tasks_are_aborted_after_timeout() {
        let coord = ShutdownCoordinator::new();
        coord.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        let finished = coord
            .graceful_shutdown(Some(Duration::from_millis(50)))
            .await;
        assert!(!finished);
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_without_tasks_finishes() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.graceful_shutdown(None).await);
    }
}
