use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::backoff::Backoff;
use crate::BackoffPolicy;
use crate::StoreError;
use crate::StoreResult;

/// Runs a store call under `duration`; a zero duration disables the timeout.
pub(crate) async fn with_timeout<T, F>(
    duration: Duration,
    task: F,
) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    if duration.is_zero() {
        return task.await;
    }

    match timeout(duration, task).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::unavailable(format!(
            "store call timed out after {duration:?}"
        ))),
    }
}

/// [`with_timeout`] that gives up as soon as `cancel` fires.
///
/// Returns `None` when cancelled first.
pub(crate) async fn cancellable_with_timeout<T, F>(
    cancel: &CancellationToken,
    duration: Duration,
    task: F,
) -> Option<StoreResult<T>>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = with_timeout(duration, task) => Some(result),
    }
}

/// Retries `task` with exponential backoff until it succeeds or
/// `policy.max_retries` attempts failed (0 means retry forever).
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> StoreResult<P>
where
    F: Fn() -> T,
    T: Future<Output = StoreResult<P>>,
{
    let mut backoff = Backoff::new(policy);
    let mut retries = 0;
    loop {
        let error = match with_timeout(policy.timeout(), task()).await {
            Ok(r) => return Ok(r),
            Err(error) => error,
        };

        retries += 1;
        if policy.max_retries != 0 && retries >= policy.max_retries {
            warn!(retries, error = %error, "Task failed after max retries");
            return Err(error);
        }

        let delay = backoff.next_delay();
        warn!(retries, error = %error, ?delay, "Task failed, retrying");
        sleep(delay).await;
    }
}
