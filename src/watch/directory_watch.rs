use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::time::interval_at;
use tokio::time::sleep;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::DirectoryCache;
use super::WatchHandler;
use crate::metrics::WATCH_DELIVERIES;
use crate::metrics::WATCH_RESTARTS;
use crate::utils::async_task::cancellable_with_timeout;
use crate::utils::backoff::Backoff;
use crate::KvStore;
use crate::StoreError;
use crate::StoreResult;
use crate::WatchConfig;
use crate::WatchScope;

/// Handle to a running prefix watch task.
///
/// The task keeps a cache of every key under `prefix` and hands a copy to the
/// handler after the initial read, after every applied event batch and after
/// every periodic full re-read.
#[derive(Debug)]
pub struct DirectoryWatch {
    prefix: String,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl DirectoryWatch {
    /// Spawns the watch task on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        handler: Arc<dyn WatchHandler>,
        config: WatchConfig,
    ) -> Self {
        let prefix = prefix.into();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let task = WatchTask {
            store,
            prefix: prefix.clone(),
            handler,
            config,
            cancel: cancel.clone(),
        };
        let done_guard = done.clone().drop_guard();
        tokio::spawn(async move {
            let _done_guard = done_guard;
            task.run().await;
        });

        Self {
            prefix,
            cancel,
            done,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Stops the task and waits until it has exited. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }
}

impl Drop for DirectoryWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum Delivery {
    Bootstrap,
    Events,
    Resync,
}

impl Delivery {
    fn label(self) -> &'static str {
        match self {
            Delivery::Bootstrap => "bootstrap",
            Delivery::Events => "events",
            Delivery::Resync => "resync",
        }
    }
}

enum SessionEnd {
    Stopped,
    Interrupted(StoreError),
}

struct WatchTask {
    store: Arc<dyn KvStore>,
    prefix: String,
    handler: Arc<dyn WatchHandler>,
    config: WatchConfig,
    cancel: CancellationToken,
}

impl WatchTask {
    async fn run(self) {
        let mut backoff = Backoff::new(self.config.retry);
        let mut cache = DirectoryCache::default();

        loop {
            match self.session(&mut cache, &mut backoff).await {
                SessionEnd::Stopped => break,
                SessionEnd::Interrupted(e) => {
                    WATCH_RESTARTS.inc();
                    warn!(prefix = %self.prefix, error = %e, "Directory watch interrupted");
                }
            }

            let delay = backoff.next_delay();
            debug!(prefix = %self.prefix, ?delay, "Re-bootstrapping directory watch");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(prefix = %self.prefix, "Directory watch closed");
    }

    /// One bootstrap followed by incremental updates and periodic re-reads,
    /// until the event stream breaks or a stop is requested.
    async fn session(
        &self,
        cache: &mut DirectoryCache,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        match self.call(self.store.get_prefix(&self.prefix)).await {
            Some(Ok(snapshot)) => cache.replace(snapshot),
            Some(Err(e)) => return SessionEnd::Interrupted(e),
            None => return SessionEnd::Stopped,
        }
        self.deliver(cache, Delivery::Bootstrap);

        let from_revision = cache.revision() + 1;
        let mut events = match self
            .call(self.store.watch(&self.prefix, WatchScope::Prefix, from_revision))
            .await
        {
            Some(Ok(events)) => events,
            Some(Err(e)) => return SessionEnd::Interrupted(e),
            None => return SessionEnd::Stopped,
        };
        backoff.reset();
        info!(
            prefix = %self.prefix,
            revision = cache.revision(),
            entries = cache.len(),
            "Directory watch established"
        );

        let period = self.config.resync_interval();
        let mut resync = interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                // Ahead of the event stream so a busy prefix cannot starve it
                _ = resync.tick() => match self.call(self.store.get_prefix(&self.prefix)).await {
                    Some(Ok(snapshot)) => {
                        cache.replace(snapshot);
                        self.deliver(cache, Delivery::Resync);
                    }
                    Some(Err(e)) => return SessionEnd::Interrupted(e),
                    None => return SessionEnd::Stopped,
                },
                batch = events.next() => match batch {
                    Some(Ok(batch)) => {
                        if cache.apply(&batch) {
                            self.deliver(cache, Delivery::Events);
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Interrupted(e),
                    None => return SessionEnd::Interrupted(StoreError::unavailable("watch stream ended")),
                },
            }
        }
    }

    fn deliver(
        &self,
        cache: &DirectoryCache,
        kind: Delivery,
    ) {
        let snapshot = cache.snapshot();
        trace!(
            prefix = %self.prefix,
            revision = snapshot.revision(),
            entries = snapshot.len(),
            ?kind,
            "Delivering snapshot"
        );
        WATCH_DELIVERIES.with_label_values(&[kind.label()]).inc();
        self.handler.on_snapshot(snapshot);
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> Option<StoreResult<T>> {
        cancellable_with_timeout(&self.cancel, self.config.retry.timeout(), fut).await
    }
}
