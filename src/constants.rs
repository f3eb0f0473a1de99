use std::time::Duration;

/// Environment variable prefix for configuration overrides (`REGISTRY__WATCH__RESYNC_INTERVAL_MS`)
pub(crate) const CONFIG_ENV_PREFIX: &str = "REGISTRY";

/// Environment variable naming an optional configuration file
pub(crate) const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Floor for lease renewal frequency, whatever the granted TTL is
pub(crate) const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// How often the in-memory store scans for expired leases
pub(crate) const MEM_STORE_REAPER_INTERVAL: Duration = Duration::from_millis(50);

/// Events the in-memory store retains for watch replay before compacting
pub(crate) const MEM_STORE_HISTORY_LIMIT: usize = 10_000;

/// Metric label values for registration exits
pub(crate) const EXIT_FAILED: &str = "failed";
pub(crate) const EXIT_LOST: &str = "lost";
pub(crate) const EXIT_SUPERSEDED: &str = "superseded";
pub(crate) const EXIT_STOPPED: &str = "stopped";
