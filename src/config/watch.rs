use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Settings for prefix watches
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Full re-read period. Recovers from missed or compacted events.
    ///
    /// Range: >= 10
    /// Default: 5000
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,

    /// Pause before re-bootstrapping after the event stream broke
    #[serde(default)]
    pub retry: BackoffPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: default_resync_interval_ms(),
            retry: BackoffPolicy::default(),
        }
    }
}

impl WatchConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_ms < 10 {
            return Err(Error::Config(ConfigError::Message(format!(
                "watch.resync_interval_ms must be at least 10, got {}",
                self.resync_interval_ms
            ))));
        }

        self.retry.validate("watch.retry")
    }
}

fn default_resync_interval_ms() -> u64 {
    5000
}
