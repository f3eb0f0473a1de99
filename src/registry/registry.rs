use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::DirectoryWatch;
use crate::EtcdStore;
use crate::Error;
use crate::KvStore;
use crate::NodeRegistration;
use crate::RegistrationState;
use crate::RegistryConfig;
use crate::Result;
use crate::WatchHandler;

/// Service registry over a [`KvStore`].
///
/// Holds at most one [`NodeRegistration`] per path and one
/// [`DirectoryWatch`] per prefix. The map lock is only held for lookups and
/// map mutation; store I/O and waiting for child tasks always happen outside
/// it.
///
/// Dropping a registry without [`Registry::close`] cancels every child task
/// without waiting for their cleanup.
///
/// # Examples
/// ```ignore
/// let registry = Registry::connect(RegistryConfig::new()?.validate()?).await?;
/// registry.register("services/api/10.0.0.1:8080", "10.0.0.1:8080")?;
/// registry.add_watch("services/api/", |snapshot: DirectorySnapshot| {
///     println!("{} instances", snapshot.len());
/// })?;
/// registry.close().await;
/// ```
pub struct Registry {
    store: Arc<dyn KvStore>,
    config: RegistryConfig,
    inner: RwLock<RegistryInner>,
    /// Flipped once by the first `close()` caller
    closing: AtomicBool,
    /// Cancelled once teardown has completed
    closed: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    closed: bool,
    registrations: HashMap<String, NodeRegistration>,
    watches: HashMap<String, DirectoryWatch>,
}

impl std::fmt::Debug for Registry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("closed", &inner.closed)
            .field("registrations", &inner.registrations.len())
            .field("watches", &inner.watches.len())
            .finish()
    }
}

impl Registry {
    pub fn new(
        store: Arc<dyn KvStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            config,
            inner: RwLock::new(RegistryInner::default()),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Validates `config`, connects to etcd and builds a registry over it.
    pub async fn connect(config: RegistryConfig) -> Result<Self> {
        let config = config.validate()?;
        let store = EtcdStore::connect(&config.store).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Starts keeping `path` registered with `value`.
    ///
    /// Returns immediately; the registration proceeds in the background and
    /// retries on its own. Follow it through [`Registry::registration_state`].
    pub fn register(
        &self,
        path: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let path = path.into();
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::Closed);
        }

        match inner.registrations.entry(path) {
            Entry::Occupied(entry) => Err(Error::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                let registration = NodeRegistration::spawn(
                    self.store.clone(),
                    entry.key().clone(),
                    value,
                    self.config.registration.clone(),
                );
                info!(path = %entry.key(), "Registration started");
                entry.insert(registration);
                Ok(())
            }
        }
    }

    /// Stops the registration of `path` and waits until its key is cleaned up.
    pub async fn unregister(
        &self,
        path: &str,
    ) -> Result<()> {
        let registration = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(Error::Closed);
            }
            inner
                .registrations
                .remove(path)
                .ok_or_else(|| Error::NotFound(path.to_string()))?
        };

        registration.close().await;
        info!(path, "Unregistered");
        Ok(())
    }

    /// Starts watching every key under `prefix`.
    pub fn add_watch(
        &self,
        prefix: impl Into<String>,
        handler: impl WatchHandler,
    ) -> Result<()> {
        let prefix = prefix.into();
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::Closed);
        }

        match inner.watches.entry(prefix) {
            Entry::Occupied(entry) => Err(Error::AlreadyWatched(entry.key().clone())),
            Entry::Vacant(entry) => {
                let watch = DirectoryWatch::spawn(
                    self.store.clone(),
                    entry.key().clone(),
                    Arc::new(handler),
                    self.config.watch.clone(),
                );
                info!(prefix = %entry.key(), "Watch started");
                entry.insert(watch);
                Ok(())
            }
        }
    }

    /// Stops the watch on `prefix` and waits until its task has exited.
    pub async fn remove_watch(
        &self,
        prefix: &str,
    ) -> Result<()> {
        let watch = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(Error::Closed);
            }
            inner
                .watches
                .remove(prefix)
                .ok_or_else(|| Error::NotFound(prefix.to_string()))?
        };

        watch.close().await;
        info!(prefix, "Watch removed");
        Ok(())
    }

    /// Current state of the registration of `path`, if registered
    pub fn registration_state(
        &self,
        path: &str,
    ) -> Option<RegistrationState> {
        self.inner.read().registrations.get(path).map(|r| r.state())
    }

    /// Receiver following every state transition of the registration of `path`
    pub fn subscribe_registration(
        &self,
        path: &str,
    ) -> Option<watch::Receiver<RegistrationState>> {
        self.inner.read().registrations.get(path).map(|r| r.subscribe())
    }

    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.read().registrations.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn watched_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.inner.read().watches.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Stops every registration and watch, waits for all of them, then
    /// releases the store connection.
    ///
    /// Only the first call does the work; concurrent and later calls wait
    /// until it has finished. Teardown has no overall timeout: a store call
    /// hanging past its per-call timeout policy stalls it.
    pub async fn close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Registry close already in progress");
            self.closed.cancelled().await;
            return;
        }
        // Releases waiting callers, also if this future is dropped midway
        let _closed = self.closed.clone().drop_guard();

        let (registrations, watches) = {
            let mut inner = self.inner.write();
            inner.closed = true;
            (
                mem::take(&mut inner.registrations),
                mem::take(&mut inner.watches),
            )
        };
        info!(
            registrations = registrations.len(),
            watches = watches.len(),
            "Closing registry"
        );

        futures::join!(
            join_all(registrations.values().map(|r| r.close())),
            join_all(watches.values().map(|w| w.close())),
        );

        self.store.close().await;
        info!("Registry closed");
    }
}
