//! Driver capability traits.
//!
//! The registry never speaks a wire protocol itself. Engine-specific crates
//! implement [`Driver`], [`DriverConnection`] and [`DriverStatement`]; the
//! registry only opens, pings, prepares on and closes through them, while the
//! HTTP layer runs queries through the same traits.
//!
//! Parameters and cell values travel as [`SqlValue`] (a JSON value) so the
//! HTTP layer can pass request bodies through without another value model.
//!
//! Methods return boxed futures so the traits stay object safe and can be
//! swapped for mocks in tests.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::params::Engine;

/// A query parameter or a result cell.
pub type SqlValue = serde_json::Value;

/// Boxed `Send` future returned by driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Errors reported by a driver implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver for {0} is not available in this build")]
    Unsupported(Engine),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("ping failed: {0}")]
    Ping(String),

    #[error("prepare failed: {0}")]
    Prepare(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("close failed: {0}")]
    Close(String),

    #[error("operation timed out")]
    Timeout,
}

/// Rows produced by a query, capped at the caller's row limit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// More rows were available than the limit allowed.
    pub exceeds_max_rows: bool,
}

impl ResultSet {
    /// Build a result from fetched rows, keeping at most `max_rows` of them.
    pub fn new(columns: Vec<String>, mut rows: Vec<Vec<SqlValue>>, max_rows: usize) -> Self {
        let exceeds_max_rows = rows.len() > max_rows;
        rows.truncate(max_rows);
        Self {
            columns,
            rows,
            exceeds_max_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Opens connections for one or more engines.
pub trait Driver: Send + Sync {
    /// Open a new connection using an engine-specific DSN.
    fn open<'a>(&'a self, engine: Engine, dsn: &'a str)
    -> DriverFuture<'a, Box<dyn DriverConnection>>;
}

/// A live connection owned by the registry.
pub trait DriverConnection: Send + std::fmt::Debug {
    /// Lightweight round-trip confirming the connection is usable.
    fn ping(&mut self) -> DriverFuture<'_, ()>;

    /// Prepare a statement on this connection.
    fn prepare<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, Box<dyn DriverStatement>>;

    /// Run `sql` and return at most `max_rows` rows.
    fn query<'a>(&'a mut self, sql: &'a str, max_rows: usize) -> DriverFuture<'a, ResultSet>;

    /// Run `sql` for its side effects; returns the number of affected rows.
    fn execute<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, u64>;

    /// Close the underlying session.
    fn close(&mut self) -> DriverFuture<'_, ()>;
}

/// A prepared statement bound to the connection that created it.
pub trait DriverStatement: Send + std::fmt::Debug {
    /// The SQL text the statement was prepared from.
    fn sql(&self) -> &str;

    /// Run the statement with positional `params`, returning at most `max_rows` rows.
    fn query<'a>(
        &'a mut self,
        params: &'a [SqlValue],
        max_rows: usize,
    ) -> DriverFuture<'a, ResultSet>;

    /// Run the statement for its side effects; returns the number of affected rows.
    fn execute<'a>(&'a mut self, params: &'a [SqlValue]) -> DriverFuture<'a, u64>;

    /// Release the server-side statement.
    fn close(&mut self) -> DriverFuture<'_, ()>;
}
