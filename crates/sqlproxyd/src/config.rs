//! Daemon configuration.
//!
//! Layered in this order, later layers winning: built-in defaults, an
//! optional TOML file, environment variables, command-line flags.
//!
//! ```toml
//! [server]
//! bind_address = "localhost"   # "*" listens on all interfaces
//! bind_port = 8080
//! max_body_bytes = 1048576
//!
//! [pool]
//! maintenance_interval = "2m"
//! idle_timeout = "20m"
//! ping_timeout = "5s"
//! connect_timeout = "10s"
//! max_rows = 10000
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use sqlproxy_pool::PoolConfig;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub pool: PoolSection,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "localhost".to_string(),
            bind_port: 8080,
            max_body_bytes: sqlproxy_api::DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// `[pool]` section. Durations are strings like `"500ms"`, `"5s"`, `"2m"`, `"1h"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub maintenance_interval: String,
    pub idle_timeout: String,
    pub ping_timeout: String,
    pub connect_timeout: String,
    pub max_rows: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            maintenance_interval: "2m".to_string(),
            idle_timeout: "20m".to_string(),
            ping_timeout: "5s".to_string(),
            connect_timeout: "10s".to_string(),
            max_rows: PoolConfig::default().max_rows,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Apply `BIND_ADDR`, `BIND_PORT`, `MAINTENANCE_INTERVAL`, `IDLE_TIMEOUT`
    /// and `MAX_ROWS`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_address = addr;
        }
        if let Some(port) = lookup("BIND_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server.bind_port = port,
                Err(_) => {
                    let kept = self.server.bind_port;
                    tracing::warn!(value = %port, "invalid BIND_PORT, keeping {kept}");
                }
            }
        }
        if let Some(rows) = lookup("MAX_ROWS") {
            match rows.trim().parse::<usize>() {
                Ok(rows) => self.pool.max_rows = rows,
                Err(_) => {
                    let kept = self.pool.max_rows;
                    tracing::warn!(value = %rows, "invalid MAX_ROWS, keeping {kept}");
                }
            }
        }
        for (key, slot) in [
            ("MAINTENANCE_INTERVAL", &mut self.pool.maintenance_interval),
            ("IDLE_TIMEOUT", &mut self.pool.idle_timeout),
        ] {
            if let Some(value) = lookup(key) {
                if parse_duration(&value).is_some() {
                    *slot = value;
                } else {
                    tracing::warn!(key, value = %value, "invalid duration, keeping {slot}");
                }
            }
        }
    }

    /// Host and port to bind; `*` maps to all interfaces.
    pub fn listen_target(&self) -> (String, u16) {
        let host = match self.server.bind_address.trim() {
            "*" | "" => "0.0.0.0".to_string(),
            host => host.to_string(),
        };
        (host, self.server.bind_port)
    }

    /// Runtime pool settings.
    pub fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let field = |name: &str, value: &str| {
            parse_duration(value)
                .with_context(|| format!("invalid duration for pool.{name}: {value:?}"))
        };
        let config = PoolConfig {
            maintenance_interval: field("maintenance_interval", &self.pool.maintenance_interval)?,
            idle_timeout: field("idle_timeout", &self.pool.idle_timeout)?,
            ping_timeout: field("ping_timeout", &self.pool.ping_timeout)?,
            connect_timeout: field("connect_timeout", &self.pool.connect_timeout)?,
            max_rows: self.pool.max_rows,
        };
        anyhow::ensure!(
            !config.maintenance_interval.is_zero(),
            "pool.maintenance_interval must be greater than zero"
        );
        Ok(config)
    }
}

/// Parse `"500ms"`, `"30s"`, `"2m"`, `"1h"` or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let secs = mins.parse::<u64>().ok()?.checked_mul(60)?;
        Some(Duration::from_secs(secs))
    } else if let Some(hours) = s.strip_suffix('h') {
        let secs = hours.parse::<u64>().ok()?.checked_mul(3600)?;
        Some(Duration::from_secs(secs))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
