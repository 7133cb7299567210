//! Bounded retry with exponential backoff
//!
//! Used for dialing endpoints that come up asynchronously (the guest side of
//! a transport link, notification sockets). The schedule is bounded: 60
//! attempts, starting at 5 ms and doubling up to a 1 s cap.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, VgateError};

/// Maximum number of attempts before giving up.
pub const MAX_ATTEMPTS: u32 = 60;

/// Delay before the second attempt.
pub const INITIAL_DELAY: Duration = Duration::from_millis(5);

/// Backoff ceiling.
pub const MAX_DELAY: Duration = Duration::from_secs(1);

/// Retry `op` until it succeeds, the schedule is exhausted, or `token` fires.
///
/// Exhaustion wraps the last error in [`VgateError::RetryTimeout`];
/// cancellation between attempts returns [`VgateError::Cancelled`] promptly.
pub async fn retry<T, F, Fut>(token: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INITIAL_DELAY;
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if token.is_cancelled() {
            return Err(VgateError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(attempt, error = %err, "attempt failed");
                last_err = Some(err);
            }
        }

        if attempt < MAX_ATTEMPTS {
            tokio::select! {
                _ = token.cancelled() => return Err(VgateError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_DELAY);
        }
    }

    match last_err {
        Some(err) => Err(VgateError::RetryTimeout {
            attempts: MAX_ATTEMPTS,
            source: Box::new(err),
        }),
        None => Err(VgateError::Cancelled),
    }
}
