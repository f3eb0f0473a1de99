use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Settings for ephemeral node registrations
///
/// ```toml
/// [registration]
/// ttl_secs = 10
///
/// [registration.retry]
/// base_delay_ms = 1000
/// max_delay_ms = 30000
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RegistrationConfig {
    /// Lease TTL. The key disappears this long after renewals stop.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Delay between attempts after a lost or failed registration.
    /// Resets to `base_delay_ms` once an attempt became active.
    #[serde(default)]
    pub retry: BackoffPolicy,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            retry: BackoffPolicy::default(),
        }
    }
}

impl RegistrationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(Error::Config(ConfigError::Message(
                "registration.ttl_secs must be at least 1".to_string(),
            )));
        }

        self.retry.validate("registration.retry")
    }
}

fn default_ttl_secs() -> u64 {
    10
}
