use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::TransferError;

/// Re-run `op` while it fails with a retryable error and another attempt
/// still fits in `budget`. Non-retryable errors are returned at once.
pub async fn retry_with_budget<T, F, Fut>(
    budget: Duration,
    backoff: Duration,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && started.elapsed() + backoff < budget => {
                tracing::warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(attempt, error = %e, "retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}
