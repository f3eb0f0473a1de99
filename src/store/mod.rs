//! Store capability used by registrations and watches.
//!
//! [`KvStore`] captures exactly the primitives the registry needs from an
//! etcd-like store: prefix range reads with a snapshot revision, lease-bound
//! puts, leases with renewal streams, watches from a revision, and a delete
//! guarded by the key's creation revision.
//!
//! Two implementations ship with the crate:
//! - [`EtcdStore`]: a real etcd cluster through `etcd-client`.
//! - [`MemStore`]: an in-memory store with the same revision and lease
//!   semantics, used by the tests and handy for embedding.

mod etcd;
mod memory;

pub use etcd::*;
pub use memory::*;


use std::time::Duration;

use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;
use tonic::async_trait;

use crate::StoreResult;

/// Store-wide monotonically increasing mutation counter
pub type Revision = i64;

/// Store-assigned lease identifier. `0` means "no lease".
pub type LeaseId = i64;

/// Stream of lease renewal acknowledgements. Ends when the lease is gone.
pub type KeepAliveStream = BoxStream<'static, StoreResult<KeepAliveAck>>;

/// Stream of event batches. Each batch is one store response, in revision order.
pub type WatchStream = BoxStream<'static, StoreResult<Vec<KvEvent>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision at which the key was last created; 0 on delete events
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    pub lease: LeaseId,
}

/// Full point-in-time read of a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSnapshot {
    /// Matching keys in key order
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutResponse {
    /// Revision of this put
    pub revision: Revision,
    /// Creation revision of the key after the put. Equals `revision` when the
    /// put created the key, otherwise the existing key's creation revision.
    pub create_revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease: LeaseId,
    /// Remaining time to live after this renewal
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
}

impl KvEvent {
    pub fn is_put(&self) -> bool {
        self.event_type == EventType::Put
    }
}

/// What a watch covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Exactly one key
    Key,
    /// Every key starting with the given string
    Prefix,
}

impl WatchScope {
    pub fn matches(
        &self,
        watched: &str,
        key: &str,
    ) -> bool {
        match self {
            WatchScope::Key => watched == key,
            WatchScope::Prefix => key.starts_with(watched),
        }
    }
}

/// Store primitives needed by the registry.
///
/// All calls are independent; implementations must be cheap to share behind
/// an `Arc`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads every key under `prefix` together with the snapshot revision.
    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<RangeSnapshot>;

    /// Creates or overwrites `key`, binding it to `lease` (0 for none).
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> StoreResult<PutResponse>;

    /// Requests a lease expiring `ttl` after the last renewal.
    async fn grant(
        &self,
        ttl: Duration,
    ) -> StoreResult<LeaseId>;

    /// Revokes a lease, deleting every key bound to it.
    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> StoreResult<()>;

    /// Starts continuous renewal of `lease`.
    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> StoreResult<KeepAliveStream>;

    /// Watches `key` (or every key under it) from `from_revision`
    /// inclusive; 0 means "from now".
    async fn watch(
        &self,
        key: &str,
        scope: WatchScope,
        from_revision: Revision,
    ) -> StoreResult<WatchStream>;

    /// Deletes `key` only if its current creation revision equals
    /// `create_revision`. Returns whether the delete happened.
    async fn delete_if_created_at(
        &self,
        key: &str,
        create_revision: Revision,
    ) -> StoreResult<bool>;

    /// Releases the underlying connection.
    async fn close(&self);
}
