//! Cached prefix watches.
//!
//! A [`DirectoryWatch`] mirrors every key under a prefix: it bootstraps from a
//! full read, follows the store's event stream from the read's revision, and
//! re-reads the whole prefix periodically to repair anything the stream
//! missed. Each update reaches the [`WatchHandler`] as an owned
//! [`DirectorySnapshot`].

mod cache;
mod directory_watch;
mod handler;

pub(crate) use cache::*;
pub use directory_watch::*;
pub use handler::*;
