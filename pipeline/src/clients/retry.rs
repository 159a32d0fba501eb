use std::time::Duration;

use tracing::warn;

/// `min(10, 0.75 · 2^attempt)` seconds, per the stage-client retry contract.
pub fn backoff_duration(attempt: u32) -> Duration {
    let seconds = (0.75_f64 * 2f64.powi(attempt as i32)).min(10.0);
    Duration::from_secs_f64(seconds)
}

/// Whether a response is worth retrying: HTTP 429 or any 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Prefer a numeric `Retry-After` header over the computed exponential backoff.
pub async fn sleep_before_retry(attempt: u32, retry_after_seconds: Option<u64>) {
    let delay = match retry_after_seconds {
        Some(secs) => Duration::from_secs(secs),
        None => backoff_duration(attempt),
    };
    warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying stage call");
    tokio::time::sleep(delay).await;
}
