//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Jitter as a fraction of the base delay, applied in both directions.
const JITTER: f64 = 0.3;

/// Delay before the retry that follows failed attempt `attempt` (1-based):
/// `2^(attempt-1)` seconds, ±30% uniform jitter, never negative.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
    let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER) * base;
    Duration::from_secs_f64((base + jitter).max(0.0))
}

/// Run `operation` up to `max_attempts` times.
///
/// Errors rejected by `is_retryable` are returned unchanged after the attempt
/// that produced them. Between attempts `on_retry(attempt, &err)` is called
/// and the backoff sleep races `cancel`; cancellation ends the loop with
/// `Error::Cancelled`. When the last attempt fails the error is wrapped in
/// `Error::RetriesExhausted`.
pub async fn with_retry<T, Op, Fut, P, R>(
    cancel: &CancellationToken,
    max_attempts: u32,
    mut operation: Op,
    is_retryable: P,
    mut on_retry: R,
) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
    R: FnMut(u32, &Error),
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(Error::RetriesExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }

        on_retry(attempt, &err);

        tokio::select! {
            _ = tokio::time::sleep(backoff_delay(attempt)) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
        attempt += 1;
    }
}
