use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Result;

/// Attempts made before a transient storage failure is surfaced.
pub const MAX_ATTEMPTS: u32 = 3;

/// Jittered exponential backoff: 10..100ms scaled by `2^attempt`.
pub fn backoff(attempt: u32) -> Duration {
    let base_ms: f64 = rand::thread_rng().gen_range(10.0..100.0);
    Duration::from_secs_f64(base_ms * f64::from(1u32 << attempt.min(16)) / 1000.0)
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `MAX_ATTEMPTS` is reached.
pub async fn with_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                let wait = backoff(attempt);
                warn!(
                    "{} hit a transient storage error (attempt {}), retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    wait,
                    e
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
