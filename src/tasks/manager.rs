//! Lifecycle helpers for the long-running loops started by the binary.
//!
//! Every loop is logged at start and completion. A loop that fails cancels
//! the shared token so the rest of the process shuts down with it.

use std::future::Future;
use std::time::Duration;

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

fn log_outcome(task_name: &'static str, app_token: &CancellationToken, result: anyhow::Result<()>) {
    match result {
        Ok(()) => {
            info!(task = task_name, "Background task completed successfully");
        }
        Err(e) => {
            error!(task = task_name, error = ?e, "Background task failed unexpectedly");
            app_token.cancel();
        }
    }
}

/// Spawns the future built by `task_builder` on `tracker`, handing it a
/// child of `app_token`. A failure cancels `app_token`.
///
/// Once `app_token` fires the future gets `grace_period` to drain before
/// it is dropped.
pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    grace_period: Duration,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting cancellable background task");

    let child_token = app_token.child_token();

    tracker.spawn(async move {
        let task_future = task_builder(child_token);
        tokio::pin!(task_future);

        tokio::select! {
            result = &mut task_future => log_outcome(task_name, &app_token, result),
            () = app_token.cancelled() => {
                info!(task = task_name, "Background task shutting down gracefully");
                match tokio::time::timeout(grace_period, &mut task_future).await {
                    Ok(result) => log_outcome(task_name, &app_token, result),
                    Err(_) => {
                        warn!(
                            task = task_name,
                            grace_period_ms = grace_period.as_millis() as u64,
                            "Background task did not stop in time, abandoning it"
                        );
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const GRACE: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_failure_cancels_app_token() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        spawn_cancellable_task(&tracker, token.clone(), "failing", GRACE, |_| async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        tracker.close();
        tracker.wait().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_success_leaves_app_token() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        spawn_cancellable_task(&tracker, token.clone(), "quick", GRACE, move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        tracker.close();
        tracker.wait().await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_abandons_task_after_grace_period() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        spawn_cancellable_task(&tracker, token.clone(), "forever", GRACE, |child| async move {
            child.cancelled().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        token.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_task_drains_within_grace_period() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        spawn_cancellable_task(&tracker, token.clone(), "draining", GRACE, move |child| async move {
            child.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        token.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(drained.load(Ordering::SeqCst));
    }
}
