//! Connection parameters and supported engines.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{PoolError, PoolResult};

/// Database engine a connection is opened against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Engine {
    /// PostgreSQL.
    Postgres,
    /// MySQL / MariaDB.
    MySql,
    /// Microsoft SQL Server.
    SqlServer,
}

impl Engine {
    /// Canonical lowercase name, as used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::MySql => "mysql",
            Engine::SqlServer => "sqlserver",
        }
    }

    /// The engine's conventional TCP port.
    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::MySql => 3306,
            Engine::SqlServer => 1433,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = PoolError;

    fn from_str(s: &str) -> PoolResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "mysql" | "mariadb" => Ok(Engine::MySql),
            "sqlserver" | "mssql" => Ok(Engine::SqlServer),
            _ => Err(PoolError::UnsupportedEngine(s.to_string())),
        }
    }
}

/// Connection parameters supplied by a client.
///
/// Field names follow the JSON request body. `db_type` stays a raw string so
/// that an unknown engine is reported by the connector with its name rather
/// than rejected as a malformed body.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectionParams {
    pub db_type: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub db_name: String,
    #[serde(default)]
    pub ssl: bool,
}

impl ConnectionParams {
    /// Parameters for `engine` on its default port, TLS disabled.
    pub fn new(engine: Engine, host: &str, user: &str, password: &str, db_name: &str) -> Self {
        Self {
            db_type: engine.as_str().to_string(),
            host: host.to_string(),
            port: engine.default_port(),
            user: user.to_string(),
            password: password.to_string(),
            db_name: db_name.to_string(),
            ssl: false,
        }
    }

    /// Builder method: set the port.
    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    /// Builder method: enable or disable TLS.
    pub fn with_ssl(self, ssl: bool) -> Self {
        Self { ssl, ..self }
    }

    /// Resolve `db_type` to a supported engine.
    pub fn engine(&self) -> PoolResult<Engine> {
        self.db_type.parse()
    }

    /// Reject parameters no driver could possibly connect with.
    pub fn validate(&self) -> PoolResult<()> {
        if self.host.trim().is_empty() {
            return Err(PoolError::InvalidParams("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(PoolError::InvalidParams("port is zero".to_string()));
        }
        Ok(())
    }

    /// Password-free description of the target, e.g. `postgres://app@db:5432/main`.
    pub fn target(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.db_type.trim().to_ascii_lowercase(),
            self.user,
            self.host,
            self.port,
            self.db_name
        )
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("db_type", &self.db_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("ssl", &self.ssl)
            .finish()
    }
}
