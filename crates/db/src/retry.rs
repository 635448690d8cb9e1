use std::future::Future;
use std::time::Duration;

/// Optional exponential-backoff retry around record-store reads. Disabled
/// by default; a disabled policy executes the operation exactly once.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { enabled: false, max_attempts: 3, initial_delay_ms: 100 }
    }
}

pub async fn with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    if !policy.enabled {
        return operation().await;
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < max_attempts => {
                let delay_ms = policy.initial_delay_ms.saturating_mul(1 << (attempt - 1));
                tracing::debug!(
                    event_name = "db.retry.attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms,
                    error = %error,
                    "query attempt failed, backing off"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
