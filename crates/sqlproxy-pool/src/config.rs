//! Runtime tunables for the registry and its maintenance loop.

use std::time::Duration;

/// Configuration consumed once at startup; not hot-reloaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pause between maintenance cycles (default: 2 minutes).
    pub maintenance_interval: Duration,
    /// Connections and statements unused for longer are evicted (default: 20 minutes).
    pub idle_timeout: Duration,
    /// Upper bound for a single liveness check or close (default: 5s).
    pub ping_timeout: Duration,
    /// Upper bound for opening a new connection (default: 10s).
    pub connect_timeout: Duration,
    /// Rows returned by a single query before the result is cut off (default: 10000).
    pub max_rows: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(20 * 60),
            ping_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_rows: 10_000,
        }
    }
}
