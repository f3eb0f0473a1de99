//! In-memory [`KvStore`] with etcd revision and lease semantics.
//!
//! - One store-wide revision counter, starting at 1, bumped by every mutation.
//! - Keys keep their creation revision across overwrites; a delete followed by
//!   a put yields a new creation revision.
//! - Leases expire `ttl` after their last renewal; a background reaper deletes
//!   the bound keys in a single revision, like a revoke.
//! - Recent event history is retained so watches can start from a past
//!   revision. Once it exceeds its limit (see [`MemStore::with_history_limit`])
//!   the oldest revisions are compacted away, as [`MemStore::compact`] does.
//!
//! Besides the trait, a handful of inherent methods act as a third party or as
//! the server side (`put_unleased`, `delete`, `expire_lease`, ...) so tests can
//! provoke every situation the registry must survive.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::trace;

use super::EventType;
use super::KeepAliveAck;
use super::KeepAliveStream;
use super::KeyValue;
use super::KvEvent;
use super::KvStore;
use super::LeaseId;
use super::PutResponse;
use super::RangeSnapshot;
use super::Revision;
use super::WatchScope;
use super::WatchStream;
use crate::constants::MEM_STORE_HISTORY_LIMIT;
use crate::constants::MEM_STORE_REAPER_INTERVAL;
use crate::constants::MIN_KEEP_ALIVE_INTERVAL;
use crate::StoreError;
use crate::StoreResult;

/// Cheaply cloneable handle; clones share the same data.
///
/// Must be created inside a tokio runtime (the lease reaper is spawned on
/// construction).
#[derive(Clone)]
pub struct MemStore {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<MemState>,
    reaper: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

struct MemLease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct MemWatcher {
    key: String,
    scope: WatchScope,
    tx: mpsc::UnboundedSender<StoreResult<Vec<KvEvent>>>,
}

struct MemState {
    revision: Revision,
    compacted: Revision,
    available: bool,
    muted: bool,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, MemLease>,
    next_lease: LeaseId,
    history: VecDeque<KvEvent>,
    history_limit: usize,
    watchers: Vec<MemWatcher>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemStore")
            .field("revision", &state.revision)
            .field("keys", &state.kvs.len())
            .field("leases", &state.leases.len())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_history_limit(MEM_STORE_HISTORY_LIMIT)
    }

    /// Store retaining at most `limit` events for watch replay.
    pub fn with_history_limit(limit: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(MemState {
                revision: 1,
                compacted: 0,
                available: true,
                muted: false,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 0x1000,
                history: VecDeque::new(),
                history_limit: limit,
                watchers: Vec::new(),
            }),
            reaper: CancellationToken::new(),
        });
        spawn_reaper(Arc::downgrade(&shared), shared.reaper.clone());
        Self { shared }
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.shared.state.lock().revision
    }

    pub fn value_of(
        &self,
        key: &str,
    ) -> Option<String> {
        self.shared.state.lock().kvs.get(key).map(|kv| kv.value.clone())
    }

    pub fn key_value(
        &self,
        key: &str,
    ) -> Option<KeyValue> {
        self.shared.state.lock().kvs.get(key).cloned()
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.shared.state.lock().leases.len()
    }

    pub fn has_lease(
        &self,
        lease: LeaseId,
    ) -> bool {
        self.shared.state.lock().leases.contains_key(&lease)
    }

    /// Number of open watch streams
    pub fn watcher_count(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Writes `key` without a lease, as another client would.
    pub fn put_unleased(
        &self,
        key: &str,
        value: &str,
    ) -> PutResponse {
        self.shared.state.lock().apply_put(key, value, 0)
    }

    /// Deletes `key` unconditionally, as another client would.
    pub fn delete(
        &self,
        key: &str,
    ) -> bool {
        self.shared.state.lock().apply_delete(key)
    }

    /// Deletes and re-creates `key` in one transaction, leaving it with a new
    /// creation revision and no lease.
    pub fn recreate_unleased(
        &self,
        key: &str,
        value: &str,
    ) -> PutResponse {
        self.shared.state.lock().apply_recreate(key, value)
    }

    /// Expires `lease` right away, as if renewals had stopped.
    pub fn expire_lease(
        &self,
        lease: LeaseId,
    ) -> bool {
        self.shared.state.lock().remove_lease(lease)
    }

    /// Drops history up to and including `revision`.
    pub fn compact(
        &self,
        revision: Revision,
    ) {
        let mut state = self.shared.state.lock();
        let revision = revision.min(state.revision);
        state.compacted = state.compacted.max(revision);
        state.history.retain(|e| e.kv.mod_revision > revision);
    }

    /// While unavailable every call fails and every open stream breaks.
    pub fn set_available(
        &self,
        available: bool,
    ) {
        let mut state = self.shared.state.lock();
        state.available = available;
        if !available {
            for watcher in state.watchers.drain(..) {
                let _ = watcher
                    .tx
                    .send(Err(StoreError::unavailable("store went away")));
            }
        }
    }

    /// While muted, mutations are applied but watchers are not notified.
    pub fn set_watchers_muted(
        &self,
        muted: bool,
    ) {
        self.shared.state.lock().muted = muted;
    }

    fn lock_available(&self) -> StoreResult<parking_lot::MutexGuard<'_, MemState>> {
        let state = self.shared.state.lock();
        if !state.available {
            return Err(StoreError::unavailable("memory store is unavailable"));
        }
        Ok(state)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reaper(
    shared: Weak<Shared>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MEM_STORE_REAPER_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.state.lock().reap_expired(Instant::now());
        }
        trace!("memory store reaper stopped");
    });
}

impl MemState {
    fn bump(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    fn apply_put(
        &mut self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> PutResponse {
        let revision = self.bump();
        let kv = self.insert(key, value, lease, revision);
        let response = PutResponse {
            revision,
            create_revision: kv.create_revision,
        };
        self.publish(vec![KvEvent {
            event_type: EventType::Put,
            kv,
        }]);
        response
    }

    fn apply_delete(
        &mut self,
        key: &str,
    ) -> bool {
        if !self.kvs.contains_key(key) {
            return false;
        }
        let revision = self.bump();
        let event = self.remove(key, revision);
        self.publish(vec![event]);
        true
    }

    fn apply_recreate(
        &mut self,
        key: &str,
        value: &str,
    ) -> PutResponse {
        let revision = self.bump();
        let mut events = Vec::with_capacity(2);
        if self.kvs.contains_key(key) {
            events.push(self.remove(key, revision));
        }
        let kv = self.insert(key, value, 0, revision);
        let response = PutResponse {
            revision,
            create_revision: kv.create_revision,
        };
        events.push(KvEvent {
            event_type: EventType::Put,
            kv,
        });
        self.publish(events);
        response
    }

    /// Removes a lease and deletes its keys in a single revision.
    fn remove_lease(
        &mut self,
        lease: LeaseId,
    ) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };
        let keys: Vec<String> = entry
            .keys
            .into_iter()
            .filter(|k| self.kvs.get(k).map(|kv| kv.lease) == Some(lease))
            .collect();
        if keys.is_empty() {
            return true;
        }
        let revision = self.bump();
        let events = keys.iter().map(|k| self.remove(k, revision)).collect();
        self.publish(events);
        true
    }

    fn reap_expired(
        &mut self,
        now: Instant,
    ) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease_id = lease, "lease expired");
            self.remove_lease(lease);
        }
    }

    fn insert(
        &mut self,
        key: &str,
        value: &str,
        lease: LeaseId,
        revision: Revision,
    ) -> KeyValue {
        let create_revision = match self.kvs.get(key) {
            Some(existing) => {
                if existing.lease != 0 && existing.lease != lease {
                    if let Some(old) = self.leases.get_mut(&existing.lease) {
                        old.keys.remove(key);
                    }
                }
                existing.create_revision
            }
            None => revision,
        };
        if let Some(entry) = self.leases.get_mut(&lease) {
            entry.keys.insert(key.to_string());
        }
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            create_revision,
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        kv
    }

    fn remove(
        &mut self,
        key: &str,
        revision: Revision,
    ) -> KvEvent {
        if let Some(old) = self.kvs.remove(key) {
            if let Some(entry) = self.leases.get_mut(&old.lease) {
                entry.keys.remove(key);
            }
        }
        KvEvent {
            event_type: EventType::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: String::new(),
                create_revision: 0,
                mod_revision: revision,
                lease: 0,
            },
        }
    }

    fn publish(
        &mut self,
        events: Vec<KvEvent>,
    ) {
        self.history.extend(events.iter().cloned());
        self.trim_history();
        if self.muted {
            return;
        }
        self.watchers.retain(|watcher| {
            let batch: Vec<KvEvent> = events
                .iter()
                .filter(|e| watcher.scope.matches(&watcher.key, &e.kv.key))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(batch)).is_ok()
        });
    }

    /// Compacts whole revisions away, oldest first, until history fits its limit.
    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            let Some(oldest) = self.history.front().map(|e| e.kv.mod_revision) else {
                break;
            };
            while self
                .history
                .front()
                .is_some_and(|e| e.kv.mod_revision == oldest)
            {
                self.history.pop_front();
            }
            self.compacted = self.compacted.max(oldest);
        }
    }

    /// Replays history from `from_revision`, one batch per revision.
    fn replay(
        &self,
        key: &str,
        scope: WatchScope,
        from_revision: Revision,
        tx: &mpsc::UnboundedSender<StoreResult<Vec<KvEvent>>>,
    ) {
        let mut batch: Vec<KvEvent> = Vec::new();
        for event in self
            .history
            .iter()
            .filter(|e| e.kv.mod_revision >= from_revision && scope.matches(key, &e.kv.key))
        {
            if batch
                .last()
                .is_some_and(|last| last.kv.mod_revision != event.kv.mod_revision)
            {
                let _ = tx.send(Ok(std::mem::take(&mut batch)));
            }
            batch.push(event.clone());
        }
        if !batch.is_empty() {
            let _ = tx.send(Ok(batch));
        }
    }

    /// Extends a lease's deadline. `None` when the lease no longer exists.
    fn refresh_lease(
        &mut self,
        lease: LeaseId,
        now: Instant,
    ) -> Option<Duration> {
        let entry = self.leases.get_mut(&lease)?;
        entry.deadline = now + entry.ttl;
        Some(entry.ttl)
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<RangeSnapshot> {
        let state = self.lock_available()?;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(RangeSnapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> StoreResult<PutResponse> {
        let mut state = self.lock_available()?;
        if lease != 0 && !state.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        Ok(state.apply_put(key, value, lease))
    }

    async fn grant(
        &self,
        ttl: Duration,
    ) -> StoreResult<LeaseId> {
        let mut state = self.lock_available()?;
        state.next_lease += 1;
        let lease = state.next_lease;
        state.leases.insert(
            lease,
            MemLease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        trace!(lease_id = lease, ?ttl, "lease granted");
        Ok(lease)
    }

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> StoreResult<()> {
        let mut state = self.lock_available()?;
        if state.remove_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> StoreResult<KeepAliveStream> {
        let interval = {
            let state = self.lock_available()?;
            let entry = state
                .leases
                .get(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            (entry.ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL)
        };

        let initial = Some((self.shared.clone(), true));
        let acks = stream::unfold(initial, move |state| async move {
            let Some((shared, first)) = state else {
                return None;
            };
            if !first {
                tokio::time::sleep(interval).await;
            }
            let renewed = {
                let mut inner = shared.state.lock();
                if !inner.available {
                    Err(StoreError::unavailable("memory store is unavailable"))
                } else {
                    Ok(inner.refresh_lease(lease, Instant::now()))
                }
            };
            match renewed {
                Ok(Some(ttl)) => Some((Ok(KeepAliveAck { lease, ttl }), Some((shared, false)))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        });
        Ok(acks.boxed())
    }

    async fn watch(
        &self,
        key: &str,
        scope: WatchScope,
        from_revision: Revision,
    ) -> StoreResult<WatchStream> {
        let mut state = self.lock_available()?;
        if from_revision > 0 && from_revision <= state.compacted {
            return Err(StoreError::Compacted {
                requested: from_revision,
                compacted: state.compacted,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if from_revision > 0 {
            state.replay(key, scope, from_revision, &tx);
        }
        state.watchers.push(MemWatcher {
            key: key.to_string(),
            scope,
            tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn delete_if_created_at(
        &self,
        key: &str,
        create_revision: Revision,
    ) -> StoreResult<bool> {
        let mut state = self.lock_available()?;
        match state.kvs.get(key) {
            Some(kv) if kv.create_revision == create_revision => Ok(state.apply_delete(key)),
            _ => Ok(false),
        }
    }

    async fn close(&self) {
        let mut state = self.shared.state.lock();
        state.watchers.clear();
        debug!("memory store closed");
    }
}
