use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::async_task::cancellable_with_timeout;
use super::async_task::task_with_timeout_and_exponential_backoff;
use super::async_task::with_timeout;
use super::backoff::Backoff;
use crate::BackoffPolicy;
use crate::StoreError;

fn policy(
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 100,
        base_delay_ms,
        max_delay_ms,
    }
}

#[test]
fn backoff_ceiling_doubles_until_capped() {
    let mut backoff = Backoff::new(policy(100, 500));

    let mut ceilings = Vec::new();
    for _ in 0..5 {
        ceilings.push(backoff.ceiling());
        backoff.next_delay();
    }

    assert_eq!(
        ceilings,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(500),
            Duration::from_millis(500),
        ]
    );
}

#[test]
fn backoff_delay_stays_within_jitter_window() {
    let mut backoff = Backoff::new(policy(100, 10_000));

    for _ in 0..20 {
        let ceiling = backoff.ceiling();
        let delay = backoff.next_delay();
        assert!(delay >= ceiling / 2, "{delay:?} below half of {ceiling:?}");
        assert!(delay <= ceiling, "{delay:?} above {ceiling:?}");
    }
}

#[test]
fn backoff_reset_returns_to_base() {
    let mut backoff = Backoff::new(policy(100, 10_000));
    backoff.next_delay();
    backoff.next_delay();
    assert_eq!(backoff.ceiling(), Duration::from_millis(400));

    backoff.reset();
    assert_eq!(backoff.ceiling(), Duration::from_millis(100));
}

#[test]
fn backoff_survives_many_attempts_without_overflow() {
    let mut backoff = Backoff::new(policy(1000, 30_000));
    for _ in 0..100 {
        assert!(backoff.next_delay() <= Duration::from_millis(30_000));
    }
}

#[tokio::test]
async fn with_timeout_maps_elapsed_to_unavailable() {
    let result: Result<(), StoreError> = with_timeout(Duration::from_millis(10), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn with_timeout_zero_disables_timeout() {
    let result = with_timeout(Duration::ZERO, async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, StoreError>(7)
    })
    .await;

    assert_eq!(result, Ok(7));
}

#[tokio::test]
async fn cancellable_call_yields_none_once_cancelled() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = cancellable_with_timeout(&cancel, Duration::from_secs(1), async { Ok::<_, StoreError>(1) }).await;

    assert_eq!(result, None);
}

#[tokio::test]
async fn cancellable_call_returns_result_when_not_cancelled() {
    let cancel = CancellationToken::new();

    let result = cancellable_with_timeout(&cancel, Duration::from_secs(1), async { Ok::<_, StoreError>(1) }).await;

    assert_eq!(result, Some(Ok(1)));
}

#[tokio::test]
async fn retry_succeeds_after_transient_failures() {
    let calls = Arc::new(AtomicUsize::new(0));

    let result = task_with_timeout_and_exponential_backoff(
        || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::unavailable("not yet"))
                } else {
                    Ok("connected")
                }
            }
        },
        policy(1, 5),
    )
    .await;

    assert_eq!(result, Ok("connected"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_gives_up_after_max_retries() {
    let calls = Arc::new(AtomicUsize::new(0));

    let result: Result<(), StoreError> = task_with_timeout_and_exponential_backoff(
        || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::unavailable("down"))
            }
        },
        policy(1, 5),
    )
    .await;

    assert_eq!(result, Err(StoreError::unavailable("down")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
