use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use crate::BackoffPolicy;
use crate::DirectorySnapshot;
use crate::RegistrationConfig;
use crate::RegistrationState;
use crate::WatchConfig;

/// Upper bound for every wait in unit tests
pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub(crate) fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 1000,
        base_delay_ms: 50,
        max_delay_ms: 200,
    }
}

pub(crate) fn fast_registration_config() -> RegistrationConfig {
    RegistrationConfig {
        ttl_secs: 1,
        retry: fast_retry(),
    }
}

pub(crate) fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        resync_interval_ms: 200,
        retry: fast_retry(),
    }
}

/// Waits until the published registration state satisfies `pred`.
pub(crate) async fn wait_for_state<F>(
    rx: &mut watch::Receiver<RegistrationState>,
    pred: F,
) -> RegistrationState
where
    F: Fn(&RegistrationState) -> bool,
{
    let state = timeout(WAIT_TIMEOUT, rx.wait_for(|s| pred(s)))
        .await
        .expect("Timeout waiting for registration state")
        .expect("Registration task dropped its state channel");
    *state
}

/// Polls `cond` until it holds.
pub(crate) async fn wait_until<F>(cond: F)
where
    F: Fn() -> bool,
{
    timeout(WAIT_TIMEOUT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for condition");
}

/// Watch handler forwarding every snapshot to a channel.
pub(crate) fn snapshot_channel() -> (
    impl Fn(DirectorySnapshot) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<DirectorySnapshot>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |snapshot: DirectorySnapshot| {
        let _ = tx.send(snapshot);
    };
    (handler, rx)
}

/// Receives snapshots until one satisfies `pred`.
pub(crate) async fn next_snapshot_matching<F>(
    rx: &mut mpsc::UnboundedReceiver<DirectorySnapshot>,
    pred: F,
) -> DirectorySnapshot
where
    F: Fn(&DirectorySnapshot) -> bool,
{
    timeout(WAIT_TIMEOUT, async {
        loop {
            let snapshot = rx.recv().await.expect("Handler channel closed");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("Timeout waiting for snapshot")
}

/// Handler that records every delivered snapshot.
#[derive(Clone, Default)]
pub(crate) struct RecordingHandler {
    pub(crate) snapshots: Arc<Mutex<Vec<DirectorySnapshot>>>,
}

impl RecordingHandler {
    pub(crate) fn count(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub(crate) fn last(&self) -> Option<DirectorySnapshot> {
        self.snapshots.lock().last().cloned()
    }
}

impl crate::WatchHandler for RecordingHandler {
    fn on_snapshot(
        &self,
        snapshot: DirectorySnapshot,
    ) {
        self.snapshots.lock().push(snapshot);
    }
}
