//! Service registration and discovery on top of an etcd-like key-value store.
//!
//! - [`Registry::register`] keeps an ephemeral key alive under a lease and
//!   re-creates it whenever it is lost.
//! - [`Registry::add_watch`] mirrors every key under a prefix and hands an
//!   up-to-date [`DirectorySnapshot`] to a [`WatchHandler`].
//!
//! The store is abstracted behind [`KvStore`]; [`EtcdStore`] talks to a real
//! etcd cluster and [`MemStore`] keeps everything in memory.

mod config;
mod constants;
mod errors;
mod registration;
mod registry;
mod store;
mod watch;

pub mod metrics;
pub(crate) mod utils;

pub use config::*;
pub use errors::*;
pub use registration::*;
pub use registry::*;
pub use store::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
