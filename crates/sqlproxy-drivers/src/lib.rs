//! sqlproxy-drivers: engine drivers behind the pool's capability traits.
//!
//! Each engine lives behind a cargo feature (`postgres`, `mysql`, `mssql`,
//! all on by default). [`EngineDriver`] dispatches on [`Engine`] and reports
//! [`DriverError::Unsupported`] for engines compiled out of the build, which
//! the pool surfaces as "no suitable driver".

#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;

use sqlproxy_pool::driver::DriverFuture;
use sqlproxy_pool::{Driver, DriverConnection, DriverError, Engine};

/// Driver for every engine enabled at compile time.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineDriver;

impl EngineDriver {
    pub fn new() -> Self {
        Self
    }

    /// Engines this build can open connections for.
    pub fn supported_engines() -> Vec<Engine> {
        [Engine::Postgres, Engine::MySql, Engine::SqlServer]
            .into_iter()
            .filter(|engine| Self::supports(*engine))
            .collect()
    }

    pub fn supports(engine: Engine) -> bool {
        match engine {
            Engine::Postgres => cfg!(feature = "postgres"),
            Engine::MySql => cfg!(feature = "mysql"),
            Engine::SqlServer => cfg!(feature = "mssql"),
        }
    }
}

impl Driver for EngineDriver {
    fn open<'a>(
        &'a self,
        engine: Engine,
        dsn: &'a str,
    ) -> DriverFuture<'a, Box<dyn DriverConnection>> {
        Box::pin(async move {
            match engine {
                #[cfg(feature = "postgres")]
                Engine::Postgres => postgres::open(dsn).await,
                #[cfg(feature = "mysql")]
                Engine::MySql => mysql::open(dsn).await,
                #[cfg(feature = "mssql")]
                Engine::SqlServer => mssql::open(dsn).await,
                #[allow(unreachable_patterns)]
                other => {
                    let _ = dsn;
                    Err(DriverError::Unsupported(other))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_engines_follow_features() {
        let engines = EngineDriver::supported_engines();
        assert_eq!(engines.contains(&Engine::Postgres), cfg!(feature = "postgres"));
        assert_eq!(engines.contains(&Engine::MySql), cfg!(feature = "mysql"));
        assert_eq!(engines.contains(&Engine::SqlServer), cfg!(feature = "mssql"));
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn postgres_malformed_dsn_is_connect_error() {
        let err = EngineDriver::new()
            .open(Engine::Postgres, "host=localhost port=not-a-port")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Connect(_)), "{err:?}");
    }

    #[cfg(feature = "mysql")]
    #[tokio::test]
    async fn mysql_malformed_dsn_is_connect_error() {
        let err = EngineDriver::new()
            .open(Engine::MySql, "not a url")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Connect(_)), "{err:?}");
    }
}
