//! Registry Error Hierarchy
//!
//! Two layers of errors live here:
//! - [`Error`]: what callers of the [`crate::Registry`] API observe.
//! - [`StoreError`]: what a [`crate::KvStore`] implementation reports. Inside the
//!   registration and watch loops these are transient and only logged; they reach
//!   a caller only while bootstrapping a store connection.

use config::ConfigError;

use crate::LeaseId;
use crate::Revision;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Result alias used by every [`crate::KvStore`] operation.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A live registration already owns this path
    #[error("Path {0} is already registered")]
    AlreadyRegistered(String),

    /// A live watch already covers this prefix
    #[error("Prefix {0} is already watched")]
    AlreadyWatched(String),

    /// Remove of a path or prefix that is not present
    #[error("{0} not found")]
    NotFound(String),

    /// Operation attempted after the registry was closed
    #[error("Registry is closed")]
    Closed,

    /// Store connection or request failures
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transient I/O failure, the caller is expected to retry
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Unexpected or malformed store response
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Watch start revision is older than the store's compaction point
    #[error("Revision {requested} has been compacted (compact revision {compacted})")]
    Compacted { requested: Revision, compacted: Revision },

    /// Lease does not exist (expired or revoked)
    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),
}

impl StoreError {
    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        StoreError::Unavailable(msg.into())
    }
}

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::InvalidArgs(msg) => StoreError::ProtocolViolation(msg),
            etcd_client::Error::Utf8Error(e) => StoreError::ProtocolViolation(e.to_string()),
            e => StoreError::Unavailable(e.to_string()),
        }
    }
}
