//! Shared helpers for unit tests.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::time::Duration;

// Serializes tests that read or write process environment variables.
pub static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Runs `future`, failing with a message if it outlives `duration`.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| "Test timed out".to_string())
}

/// Polls `condition` every 10ms; panics after five seconds.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
