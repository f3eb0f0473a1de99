use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::AttemptExit;
use super::LossReason;
use super::RegistrationState;
use crate::metrics::ACTIVE_REGISTRATIONS;
use crate::metrics::REGISTRATION_ATTEMPTS;
use crate::metrics::REGISTRATION_EXITS;
use crate::utils::async_task::cancellable_with_timeout;
use crate::utils::async_task::with_timeout;
use crate::utils::backoff::Backoff;
use crate::KeepAliveStream;
use crate::KvEvent;
use crate::KvStore;
use crate::LeaseId;
use crate::RegistrationConfig;
use crate::Revision;
use crate::StoreError;
use crate::StoreResult;
use crate::WatchScope;
use crate::WatchStream;

/// Handle to a running registration task.
///
/// The task keeps `path` registered until [`NodeRegistration::close`] is
/// called or the handle is dropped. Store failures never surface here; they
/// are retried and reflected in [`NodeRegistration::state`].
#[derive(Debug)]
pub struct NodeRegistration {
    path: String,
    cancel: CancellationToken,
    /// Cancelled by the task itself once it has fully terminated
    done: CancellationToken,
    state: watch::Receiver<RegistrationState>,
}

impl NodeRegistration {
    /// Spawns the registration task on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn KvStore>,
        path: impl Into<String>,
        value: impl Into<String>,
        config: RegistrationConfig,
    ) -> Self {
        let path = path.into();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(RegistrationState::Idle);

        let task = RegistrationTask {
            store,
            path: path.clone(),
            value: value.into(),
            config,
            cancel: cancel.clone(),
            state: state_tx,
        };
        let done_guard = done.clone().drop_guard();
        tokio::spawn(async move {
            let _done_guard = done_guard;
            task.run().await;
        });

        Self {
            path,
            cancel,
            done,
            state: state_rx,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Latest published state
    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Stops the task and waits until its cleanup has finished.
    ///
    /// Idempotent. Once this returns the task performs no further store
    /// mutation.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }
}

impl Drop for NodeRegistration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RegistrationTask {
    store: Arc<dyn KvStore>,
    path: String,
    value: String,
    config: RegistrationConfig,
    cancel: CancellationToken,
    state: watch::Sender<RegistrationState>,
}

impl RegistrationTask {
    async fn run(self) {
        let mut backoff = Backoff::new(self.config.retry);

        loop {
            let exit = self.attempt().await;
            REGISTRATION_EXITS.with_label_values(&[exit.label()]).inc();

            match &exit {
                AttemptExit::Stopped => break,
                AttemptExit::Failed(e) => {
                    warn!(path = %self.path, error = %e, "Registration attempt failed");
                }
                AttemptExit::Lost(_) | AttemptExit::Superseded => {}
            }
            if exit.was_active() {
                backoff.reset();
            }

            let delay = backoff.next_delay();
            debug!(path = %self.path, ?delay, "Next registration attempt scheduled");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(RegistrationState::Closed);
        info!(path = %self.path, "Registration closed");
    }

    /// grant -> put -> keep alive + watch -> monitor -> cleanup
    async fn attempt(&self) -> AttemptExit {
        self.set_state(RegistrationState::Registering);
        REGISTRATION_ATTEMPTS.inc();

        let lease = match self.call(self.store.grant(self.config.ttl())).await {
            Some(Ok(lease)) => lease,
            Some(Err(e)) => return AttemptExit::Failed(e),
            None => return AttemptExit::Stopped,
        };
        trace!(path = %self.path, lease_id = lease, "Lease granted");

        // Whatever the put did, the key can only be bound to this lease
        let put = match self.call(self.store.put(&self.path, &self.value, lease)).await {
            Some(Ok(put)) => put,
            Some(Err(e)) => {
                self.cleanup(lease, None).await;
                return AttemptExit::Failed(e);
            }
            None => {
                self.set_state(RegistrationState::Closing);
                self.cleanup(lease, None).await;
                return AttemptExit::Stopped;
            }
        };
        let create_revision = put.create_revision;

        let (acks, events) = match self.call(self.open_streams(lease, put.revision + 1)).await {
            Some(Ok(streams)) => streams,
            Some(Err(e)) => {
                self.cleanup(lease, Some(create_revision)).await;
                return AttemptExit::Failed(e);
            }
            None => {
                self.set_state(RegistrationState::Closing);
                self.cleanup(lease, Some(create_revision)).await;
                return AttemptExit::Stopped;
            }
        };

        self.set_state(RegistrationState::Active {
            lease,
            create_revision,
        });
        info!(
            path = %self.path,
            lease_id = lease,
            create_revision,
            revision = put.revision,
            "Registration active"
        );

        let exit = self.monitor(acks, events, create_revision).await;
        match &exit {
            AttemptExit::Lost(reason) => {
                info!(path = %self.path, lease_id = lease, %reason, "Registration lost");
                self.set_state(RegistrationState::Lost);
            }
            AttemptExit::Superseded => {
                warn!(path = %self.path, create_revision, "Registration superseded by another writer");
                self.set_state(RegistrationState::Superseded);
            }
            AttemptExit::Stopped | AttemptExit::Failed(_) => {
                self.set_state(RegistrationState::Closing);
            }
        }

        self.cleanup(lease, Some(create_revision)).await;
        exit
    }

    async fn open_streams(
        &self,
        lease: LeaseId,
        from_revision: Revision,
    ) -> StoreResult<(KeepAliveStream, WatchStream)> {
        let acks = self.store.keep_alive(lease).await?;
        let events = self
            .store
            .watch(&self.path, WatchScope::Key, from_revision)
            .await?;
        Ok((acks, events))
    }

    async fn monitor(
        &self,
        mut acks: KeepAliveStream,
        mut events: WatchStream,
        create_revision: Revision,
    ) -> AttemptExit {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return AttemptExit::Stopped,
                ack = acks.next() => match ack {
                    Some(Ok(ack)) => {
                        trace!(path = %self.path, lease_id = ack.lease, ttl = ?ack.ttl, "Lease renewed");
                    }
                    Some(Err(e)) => return AttemptExit::Lost(LossReason::KeepAliveFailed(e)),
                    None => return AttemptExit::Lost(LossReason::LeaseExpired),
                },
                batch = events.next() => match batch {
                    Some(Ok(batch)) => {
                        if let Some(exit) = inspect_events(&batch, create_revision) {
                            return exit;
                        }
                    }
                    Some(Err(e)) => return AttemptExit::Lost(LossReason::WatchFailed(e)),
                    None => return AttemptExit::Lost(LossReason::WatchEnded),
                },
            }
        }
    }

    /// Best-effort teardown of one attempt: revoke the lease, then delete the
    /// key only if it still carries our creation revision.
    async fn cleanup(
        &self,
        lease: LeaseId,
        create_revision: Option<Revision>,
    ) {
        let timeout = self.config.retry.timeout();

        match with_timeout(timeout, self.store.revoke(lease)).await {
            Ok(()) => trace!(path = %self.path, lease_id = lease, "Lease revoked"),
            Err(StoreError::LeaseNotFound(_)) => {
                trace!(path = %self.path, lease_id = lease, "Lease already gone")
            }
            Err(e) => warn!(path = %self.path, lease_id = lease, error = %e, "Failed to revoke lease"),
        }

        let Some(create_revision) = create_revision else {
            return;
        };
        match with_timeout(
            timeout,
            self.store.delete_if_created_at(&self.path, create_revision),
        )
        .await
        {
            Ok(true) => debug!(path = %self.path, create_revision, "Key deleted"),
            Ok(false) => debug!(path = %self.path, create_revision, "Key not ours anymore, left in place"),
            Err(e) => warn!(path = %self.path, create_revision, error = %e, "Conditional delete failed"),
        }
    }

    /// Runs a store call under the per-call timeout. `None` when a stop was
    /// requested first.
    async fn call<T>(
        &self,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> Option<StoreResult<T>> {
        cancellable_with_timeout(&self.cancel, self.config.retry.timeout(), fut).await
    }

    fn set_state(
        &self,
        next: RegistrationState,
    ) {
        let previous = self.state.send_replace(next);
        match (previous.is_active(), next.is_active()) {
            (false, true) => ACTIVE_REGISTRATIONS.inc(),
            (true, false) => ACTIVE_REGISTRATIONS.dec(),
            _ => {}
        }
    }
}

/// Classifies a batch of events on the registered key.
///
/// A put carrying a foreign creation revision means another writer re-created
/// the key and wins over any delete in the same batch.
pub(crate) fn inspect_events(
    events: &[KvEvent],
    create_revision: Revision,
) -> Option<AttemptExit> {
    if events
        .iter()
        .any(|e| e.is_put() && e.kv.create_revision != create_revision)
    {
        return Some(AttemptExit::Superseded);
    }
    if events.iter().any(|e| !e.is_put()) {
        return Some(AttemptExit::Lost(LossReason::KeyDeleted));
    }
    None
}
