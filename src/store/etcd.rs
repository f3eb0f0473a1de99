//! etcd-backed [`KvStore`]

use std::time::Duration;

use etcd_client::Client;
use etcd_client::Compare;
use etcd_client::CompareOp;
use etcd_client::ConnectOptions;
use etcd_client::GetOptions;
use etcd_client::LeaseKeepAliveStream;
use etcd_client::LeaseKeeper;
use etcd_client::PutOptions;
use etcd_client::Txn;
use etcd_client::TxnOp;
use etcd_client::WatchOptions;
use futures::stream;
use futures::StreamExt;
use parking_lot::RwLock;
use tonic::async_trait;
use tracing::debug;
use tracing::info;
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
use crate::constants::MIN_KEEP_ALIVE_INTERVAL;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::StoreConfig;
use crate::StoreError;
use crate::StoreResult;

/// [`KvStore`] over an etcd v3 cluster.
///
/// Every call works on a clone of the underlying client; `close()` drops the
/// shared handle so later calls fail with [`StoreError::Unavailable`].
pub struct EtcdStore {
    client: RwLock<Option<Client>>,
}

impl EtcdStore {
    /// Connects with exponential backoff according to `config.connect_retry`.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let client = task_with_timeout_and_exponential_backoff(
            || async {
                Client::connect(&config.endpoints, Some(connect_options(config)))
                    .await
                    .map_err(StoreError::from)
            },
            config.connect_retry,
        )
        .await?;

        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self::from_client(client))
    }

    /// Wraps an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: RwLock::new(Some(client)),
        }
    }

    fn client(&self) -> StoreResult<Client> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| StoreError::unavailable("etcd connection closed"))
    }
}

fn connect_options(config: &StoreConfig) -> ConnectOptions {
    let options = ConnectOptions::new()
        .with_connect_timeout(config.dial_timeout())
        .with_keep_alive(config.keep_alive_interval(), config.keep_alive_timeout());

    match (&config.username, &config.password) {
        (Some(user), Some(password)) => options.with_user(user.clone(), password.clone()),
        _ => options,
    }
}

/// etcd leases are granted in whole seconds
fn ttl_secs(ttl: Duration) -> i64 {
    (ttl.as_millis().div_ceil(1000) as i64).max(1)
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> StoreResult<Revision> {
    header
        .map(|h| h.revision())
        .ok_or_else(|| StoreError::ProtocolViolation("response without header".to_string()))
}

fn convert_kv(kv: &etcd_client::KeyValue) -> StoreResult<KeyValue> {
    Ok(KeyValue {
        key: kv.key_str()?.to_string(),
        value: kv.value_str()?.to_string(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    })
}

fn convert_event(event: &etcd_client::Event) -> StoreResult<KvEvent> {
    let kv = event
        .kv()
        .ok_or_else(|| StoreError::ProtocolViolation("watch event without key".to_string()))?;
    let event_type = match event.event_type() {
        etcd_client::EventType::Put => EventType::Put,
        etcd_client::EventType::Delete => EventType::Delete,
    };
    Ok(KvEvent {
        event_type,
        kv: convert_kv(kv)?,
    })
}

struct KeepAliveState {
    keeper: LeaseKeeper,
    responses: LeaseKeepAliveStream,
    lease: LeaseId,
    interval: Option<Duration>,
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<RangeSnapshot> {
        let mut client = self.client()?;
        let resp = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let revision = header_revision(resp.header())?;
        let kvs = resp
            .kvs()
            .iter()
            .map(convert_kv)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(RangeSnapshot { kvs, revision })
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> StoreResult<PutResponse> {
        let mut client = self.client()?;
        let options = PutOptions::new().with_lease(lease).with_prev_key();
        let resp = client.put(key, value, Some(options)).await?;
        let revision = header_revision(resp.header())?;
        let create_revision = resp
            .prev_key()
            .map(|prev| prev.create_revision())
            .unwrap_or(revision);
        Ok(PutResponse {
            revision,
            create_revision,
        })
    }

    async fn grant(
        &self,
        ttl: Duration,
    ) -> StoreResult<LeaseId> {
        let mut client = self.client()?;
        let resp = client.lease_grant(ttl_secs(ttl), None).await?;
        trace!(lease_id = resp.id(), ttl = resp.ttl(), "lease granted");
        Ok(resp.id())
    }

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> StoreResult<()> {
        let mut client = self.client()?;
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> StoreResult<KeepAliveStream> {
        let mut client = self.client()?;
        let (keeper, responses) = client.lease_keep_alive(lease).await?;

        let initial = Some(KeepAliveState {
            keeper,
            responses,
            lease,
            interval: None,
        });
        let acks = stream::unfold(initial, |state| async move {
            let Some(mut state) = state else {
                return None;
            };
            if let Some(interval) = state.interval {
                tokio::time::sleep(interval).await;
            }
            if let Err(e) = state.keeper.keep_alive().await {
                return Some((Err(StoreError::from(e)), None));
            }
            match state.responses.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    let ttl = Duration::from_secs(resp.ttl() as u64);
                    state.interval = Some((ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL));
                    let ack = KeepAliveAck {
                        lease: state.lease,
                        ttl,
                    };
                    Some((Ok(ack), Some(state)))
                }
                // ttl <= 0: the lease is gone
                Ok(_) => None,
                Err(e) => Some((Err(StoreError::from(e)), None)),
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
        let mut client = self.client()?;
        let mut options = WatchOptions::new();
        if scope == WatchScope::Prefix {
            options = options.with_prefix();
        }
        if from_revision > 0 {
            options = options.with_start_revision(from_revision);
        }
        let (watcher, events) = client.watch(key, Some(options)).await?;
        debug!(key, ?scope, from_revision, watch_id = watcher.watch_id(), "watch created");

        // The watcher is carried along: dropping it cancels the watch.
        let batches = stream::unfold(Some((watcher, events)), move |state| async move {
            let Some((watcher, mut events)) = state else {
                return None;
            };
            match events.message().await {
                Ok(Some(resp)) if resp.canceled() => {
                    if resp.compact_revision() > 0 {
                        let err = StoreError::Compacted {
                            requested: from_revision,
                            compacted: resp.compact_revision(),
                        };
                        Some((Err(err), None))
                    } else {
                        None
                    }
                }
                Ok(Some(resp)) => {
                    let batch = resp.events().iter().map(convert_event).collect::<StoreResult<Vec<_>>>();
                    match batch {
                        Ok(batch) => Some((Ok(batch), Some((watcher, events)))),
                        Err(e) => Some((Err(e), None)),
                    }
                }
                Ok(None) => None,
                Err(e) => Some((Err(StoreError::from(e)), None)),
            }
        });
        Ok(batches.boxed())
    }

    async fn delete_if_created_at(
        &self,
        key: &str,
        create_revision: Revision,
    ) -> StoreResult<bool> {
        let mut client = self.client()?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key,
                CompareOp::Equal,
                create_revision,
            )])
            .and_then(vec![TxnOp::delete(key, None)]);
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn close(&self) {
        if self.client.write().take().is_some() {
            debug!("etcd connection released");
        }
    }
}
