//! sqlproxy-pool: the connection registry behind the SQL proxy.
//!
//! Keeps live database connections and their prepared statements behind
//! opaque string handles so that short-lived HTTP requests can reuse
//! expensive SQL sessions.
//!
//! - **params**: connection parameters and the supported engines
//! - **fingerprint**: SHA-256 deduplication key over connection parameters
//! - **driver**: capability traits implemented by the driver layer, result sets
//! - **connector**: per-engine DSN building, open + liveness check
//! - **registry**: handle → connection map with per-connection statement maps
//! - **maintenance**: background health-check and idle-eviction loop
//!
//! # Architecture
//!
//! ```text
//! Request with ConnectionParams
//!   → Registry::get_or_create
//!     → Fingerprint::compute → scan records with the same fingerprint
//!       → ping every match, evict the dead ones
//!       → first live match     → return its handle
//!       → nothing usable       → Connector::open → insert → new handle
//!
//! Maintenance (every `maintenance_interval`)
//!   → skip busy records, ping + idle check the rest → evict idle statements
//!   → close and remove records marked dead
//! ```

pub mod config;
pub mod connector;
pub mod driver;
pub mod error;
pub mod fingerprint;
pub mod maintenance;
pub mod params;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::PoolConfig;
pub use connector::Connector;
pub use driver::{Driver, DriverConnection, DriverError, DriverStatement, ResultSet, SqlValue};
pub use error::{PoolError, PoolResult};
pub use fingerprint::Fingerprint;
pub use maintenance::{CycleReport, Maintenance};
pub use params::{ConnectionParams, Engine};
pub use registry::{ConnectionInfo, Registry, SharedConnection, SharedStatement};
