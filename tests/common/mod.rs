use std::sync::Arc;
use std::time::Duration;

use kv_registry::BackoffPolicy;
use kv_registry::DirectorySnapshot;
use kv_registry::MemStore;
use kv_registry::RegistrationConfig;
use kv_registry::RegistrationState;
use kv_registry::Registry;
use kv_registry::RegistryConfig;
use kv_registry::WatchConfig;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub const RESYNC_INTERVAL_MS: u64 = 200;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub fn test_config() -> RegistryConfig {
    let retry = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 1000,
        base_delay_ms: 50,
        max_delay_ms: 200,
    };
    RegistryConfig {
        registration: RegistrationConfig { ttl_secs: 1, retry },
        watch: WatchConfig {
            resync_interval_ms: RESYNC_INTERVAL_MS,
            retry,
        },
        ..Default::default()
    }
}

pub fn setup() -> (MemStore, Registry) {
    enable_logger();
    let store = MemStore::new();
    let registry = Registry::new(Arc::new(store.clone()), test_config());
    (store, registry)
}

pub async fn wait_active(
    registry: &Registry,
    path: &str,
) -> RegistrationState {
    let mut rx = registry
        .subscribe_registration(path)
        .expect("path should be registered");
    let state = timeout(WAIT_TIMEOUT, rx.wait_for(|s| s.is_active()))
        .await
        .expect("Timeout waiting for active registration")
        .expect("Registration task dropped its state channel");
    *state
}

pub type Snapshots = mpsc::UnboundedReceiver<DirectorySnapshot>;

pub fn snapshot_channel() -> (impl Fn(DirectorySnapshot) + Send + Sync + 'static, Snapshots) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |snapshot: DirectorySnapshot| {
            let _ = tx.send(snapshot);
        },
        rx,
    )
}

pub async fn next_matching<F>(
    rx: &mut Snapshots,
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
