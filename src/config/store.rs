use std::fmt::Debug;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Connection parameters for the backing etcd cluster
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// etcd endpoints, e.g. `http://127.0.0.1:2379`
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Optional authentication user (requires `password`)
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Timeout for establishing a connection (milliseconds)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// HTTP/2 keep-alive ping interval on the connection (milliseconds)
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,

    /// HTTP/2 keep-alive ping timeout (milliseconds)
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,

    /// Retry policy for the initial connection
    #[serde(default = "default_connect_retry")]
    pub connect_retry: BackoffPolicy,
}

impl Debug for StoreConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("endpoints", &self.endpoints)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("dial_timeout_ms", &self.dial_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            username: None,
            password: None,
            dial_timeout_ms: default_dial_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            connect_retry: default_connect_retry(),
        }
    }
}

impl StoreConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "store.endpoints must contain at least one endpoint".to_string(),
            )));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(Error::Config(ConfigError::Message(
                "store.username and store.password must be set together".to_string(),
            )));
        }

        if self.dial_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "store.dial_timeout_ms must be greater than 0".to_string(),
            )));
        }

        self.connect_retry.validate("store.connect_retry")
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_keep_alive_interval_ms() -> u64 {
    10_000
}
fn default_keep_alive_timeout_ms() -> u64 {
    30_000
}
fn default_connect_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 5,
        timeout_ms: 5000,
        base_delay_ms: 500,
        max_delay_ms: 8000,
    }
}
