//! Shared executor for background work (directory polling, pending rescans,
//! component polling tasks).

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Tracks every background task of a container so shutdown can cancel and join them.
#[derive(Debug, Clone, Default)]
pub struct WorkExecutor {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WorkExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a one-shot task.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(fut)
    }

    /// Token cancelled when the executor shuts down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Call `tick` every `interval` until the returned task is stopped or the executor shuts down.
    pub fn spawn_polling<F, Fut>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        mut tick: F,
    ) -> PollingTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let task_name = name.clone();
        let handle = self.tracker.spawn(async move {
            tracing::debug!(task = %task_name, ?interval, "polling task started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = tick() => {}
                        }
                    }
                }
            }
            tracing::debug!(task = %task_name, "polling task exited");
        });
        PollingTask {
            name,
            cancel,
            handle,
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel all tasks and wait up to `timeout` for them to finish.
    ///
    /// Returns `false` if some tasks were still running when the wait expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            true
        } else {
            tracing::warn!(
                remaining = self.tracker.len(),
                ?timeout,
                "background tasks did not finish in time"
            );
            false
        }
    }
}

/// Handle to a recurring background task.
#[derive(Debug)]
pub struct PollingTask {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollingTask {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the task and join it with a bounded wait.
    ///
    /// A join timeout is logged and the task aborted; it is never an error.
    pub async fn stop(self, join_timeout: Duration) -> bool {
        self.cancel.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(join_timeout, self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(task = %self.name, error = %e, "polling task ended abnormally");
                true
            }
            Err(_) => {
                tracing::warn!(task = %self.name, ?join_timeout, "polling task did not stop in time; aborting");
                abort.abort();
                false
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn polling_task_ticks_until_stopped() {
        let executor = WorkExecutor::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = executor.spawn_polling("counter", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.stop(Duration::from_secs(1)).await);
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_tick() {
        let executor = WorkExecutor::new();
        let task = executor.spawn_polling("sleepy", Duration::from_millis(1), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn shutdown_cancels_tracked_tasks() {
        let executor = WorkExecutor::new();
        let token = executor.child_token();
        executor.spawn(async move { token.cancelled().await });
        assert!(executor.shutdown(Duration::from_secs(1)).await);
        assert!(executor.is_shut_down());
    }
}
