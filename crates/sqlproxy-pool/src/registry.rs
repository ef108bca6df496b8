//! Connection registry: handle → pooled connection map.
//!
//! Every live connection is stored under an opaque UUID handle together with
//! its parameter fingerprint, last-used time and the statements prepared on
//! it. The registry is the only owner allowed to close a connection or
//! statement; callers get short-lived shared references and must re-resolve
//! the handle on every use.
//!
//! # Locking
//!
//! The map sits behind a `tokio::sync::RwLock` held only while the map itself
//! is read or mutated. Network I/O (open, ping, close) always happens after
//! the guard is dropped, so a slow backend never blocks lookups of other
//! handles. Each connection has its own mutex serializing its users.
//!
//! # Duplicates
//!
//! Two concurrent `get_or_create` calls for the same parameters may both miss
//! the reuse scan and both open a connection. Both records stay valid; later
//! scans reuse the first live one and evict dead ones as they are found.

mod statements;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::connector::Connector;
use crate::driver::{Driver, DriverConnection, DriverError, DriverStatement};
use crate::error::PoolResult;
use crate::fingerprint::Fingerprint;
use crate::params::ConnectionParams;

pub use statements::SharedStatement;
use statements::StatementRegistry;

/// A connection shared with callers for the duration of one use.
pub type SharedConnection = Arc<Mutex<Box<dyn DriverConnection>>>;

// ── LastUsed ─────────────────────────────────────────────────────────

/// Last-use timestamp readable from sync and async contexts alike.
#[derive(Debug)]
pub(crate) struct LastUsed(StdMutex<Instant>);

impl LastUsed {
    pub(crate) fn now() -> Self {
        Self(StdMutex::new(Instant::now()))
    }

    pub(crate) fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}

// ── ConnectionRecord ─────────────────────────────────────────────────

/// A pooled connection with its bookkeeping.
#[derive(Debug)]
pub(crate) struct ConnectionRecord {
    pub(crate) handle: String,
    fingerprint: Fingerprint,
    /// Password-free description for logs.
    target: String,
    connection: SharedConnection,
    last_used: LastUsed,
    pub(crate) statements: StatementRegistry,
}

impl ConnectionRecord {
    fn new(
        handle: String,
        fingerprint: Fingerprint,
        target: String,
        connection: Box<dyn DriverConnection>,
    ) -> Self {
        Self {
            handle,
            fingerprint,
            target,
            connection: Arc::new(Mutex::new(connection)),
            last_used: LastUsed::now(),
            statements: StatementRegistry::new(),
        }
    }

    pub(crate) fn touch(&self) {
        self.last_used.touch();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.idle_for()
    }

    /// Whether a caller currently holds the connection.
    pub(crate) fn is_busy(&self) -> bool {
        self.connection.try_lock().is_err()
    }
}

/// Point-in-time view of one pooled connection, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: String,
    pub target: String,
    pub idle_for: Duration,
    pub statements: usize,
}

// ── Registry ─────────────────────────────────────────────────────────

/// The process-wide pool of live connections.
///
/// Construct once at startup and share it (`Arc<Registry>`) between the HTTP
/// layer and the maintenance task.
pub struct Registry {
    records: RwLock<HashMap<String, Arc<ConnectionRecord>>>,
    connector: Connector,
    config: PoolConfig,
}

impl Registry {
    pub fn new(config: PoolConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            connector: Connector::new(driver, &config),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Resolve a connection handle.
    ///
    /// With `touch` set, the record's last-used time is refreshed so the
    /// maintenance loop treats it as active.
    pub async fn get_by_handle(&self, handle: &str, touch: bool) -> Option<SharedConnection> {
        let records = self.records.read().await;
        records.get(handle).map(|record| {
            if touch {
                record.touch();
            }
            Arc::clone(&record.connection)
        })
    }

    /// Return the handle of a live connection for `params`, opening one if needed.
    ///
    /// Every record with a matching fingerprint is pinged; the ones that fail
    /// are evicted and the first live one is reused. When nothing usable is
    /// found a new connection is opened through the connector and registered.
    pub async fn get_or_create(&self, params: &ConnectionParams) -> PoolResult<String> {
        let fingerprint = Fingerprint::compute(params)?;

        let mut live: Option<Arc<ConnectionRecord>> = None;
        for record in self.matching(&fingerprint).await {
            match self.check_alive(&record).await {
                Ok(()) => {
                    live.get_or_insert(record);
                }
                Err(e) => {
                    tracing::debug!(
                        handle = %record.handle,
                        error = %e,
                        "pooled connection is dead, removing it"
                    );
                    self.evict(&record.handle).await;
                }
            }
        }

        if let Some(record) = live {
            record.touch();
            tracing::debug!(handle = %record.handle, "connection found in the pool");
            return Ok(record.handle.clone());
        }

        let connection = self.connector.open(params).await?;
        let handle = Uuid::new_v4().to_string();
        let record =
            ConnectionRecord::new(handle.clone(), fingerprint, params.target(), connection);
        self.records
            .write()
            .await
            .insert(handle.clone(), Arc::new(record));

        tracing::info!(
            handle = %handle,
            host = %params.host,
            port = params.port,
            database = %params.db_name,
            user = %params.user,
            engine = %params.db_type,
            "new SQL connection added to the pool"
        );
        Ok(handle)
    }

    /// Close and remove a connection with all of its statements.
    ///
    /// Returns whether the handle existed; an unknown handle is a no-op.
    pub async fn delete(&self, handle: &str) -> bool {
        let existed = self.evict(handle).await;
        if existed {
            tracing::debug!(handle = %handle, "connection deleted by request");
        }
        existed
    }

    /// Ping one connection without evicting it. Unknown handles are not alive.
    pub async fn ping(&self, handle: &str) -> bool {
        let record = self.records.read().await.get(handle).cloned();
        match record {
            Some(record) => self.check_alive(&record).await.is_ok(),
            None => false,
        }
    }

    // ── Statements ───────────────────────────────────────────────────

    /// Register a statement prepared on `conn_handle`'s connection.
    ///
    /// Returns `None` when the connection is unknown (or was removed while
    /// the statement was being prepared); the statement is closed then.
    pub async fn put_statement(
        &self,
        conn_handle: &str,
        statement: Box<dyn DriverStatement>,
    ) -> Option<String> {
        let record = self.records.read().await.get(conn_handle).cloned();
        let Some(record) = record else {
            self.discard_statement(statement).await;
            return None;
        };

        match record.statements.insert(statement).await {
            Ok(stmt_handle) => {
                record.touch();
                tracing::debug!(
                    handle = %conn_handle,
                    statement = %stmt_handle,
                    "prepared statement added"
                );
                Some(stmt_handle)
            }
            Err(statement) => {
                self.discard_statement(statement).await;
                None
            }
        }
    }

    /// Resolve a statement within a connection. Absence at either level is `None`.
    pub async fn get_statement(
        &self,
        conn_handle: &str,
        stmt_handle: &str,
    ) -> Option<SharedStatement> {
        let record = self.records.read().await.get(conn_handle).cloned()?;
        record.statements.get(stmt_handle).await
    }

    /// Close and remove one statement. Returns `false` when either handle is unknown.
    pub async fn close_statement(&self, conn_handle: &str, stmt_handle: &str) -> bool {
        let Some(record) = self.records.read().await.get(conn_handle).cloned() else {
            return false;
        };
        let Some(statement) = record.statements.remove(stmt_handle).await else {
            return false;
        };
        self.close_shared_statement(&statement).await;
        tracing::debug!(
            handle = %conn_handle,
            statement = %stmt_handle,
            "prepared statement closed"
        );
        true
    }

    // ── Introspection ────────────────────────────────────────────────

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of statements held by a connection, `None` if it is unknown.
    pub async fn statement_count(&self, handle: &str) -> Option<usize> {
        let record = self.records.read().await.get(handle).cloned()?;
        Some(record.statements.len().await)
    }

    /// Handles currently registered for connections equivalent to `params`.
    pub async fn handles_for(&self, params: &ConnectionParams) -> PoolResult<Vec<String>> {
        let fingerprint = Fingerprint::compute(params)?;
        Ok(self
            .matching(&fingerprint)
            .await
            .into_iter()
            .map(|record| record.handle.clone())
            .collect())
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos = Vec::new();
        for record in self.records().await {
            infos.push(ConnectionInfo {
                handle: record.handle.clone(),
                target: record.target.clone(),
                idle_for: record.idle_for(),
                statements: record.statements.len().await,
            });
        }
        infos
    }

    /// Close and remove every connection. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<ConnectionRecord>> = self
            .records
            .write()
            .await
            .drain()
            .map(|(_, record)| record)
            .collect();
        let count = drained.len();
        for record in drained {
            self.close_record(&record).await;
        }
        tracing::info!(closed = count, "connection pool closed");
        count
    }

    // ── Internals shared with maintenance ────────────────────────────

    /// Snapshot of all records, taken under the read lock.
    pub(crate) async fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        self.records.read().await.values().cloned().collect()
    }

    async fn matching(&self, fingerprint: &Fingerprint) -> Vec<Arc<ConnectionRecord>> {
        self.records
            .read()
            .await
            .values()
            .filter(|record| record.fingerprint == *fingerprint)
            .cloned()
            .collect()
    }

    /// Bounded liveness check.
    ///
    /// A connection whose mutex is held is in use by a request right now and
    /// counts as alive; waiting for it would stall the caller behind an
    /// arbitrary query.
    pub(crate) async fn check_alive(&self, record: &ConnectionRecord) -> Result<(), DriverError> {
        match record.connection.try_lock() {
            Ok(mut conn) => self.connector.ping(conn.as_mut()).await,
            Err(_) => Ok(()),
        }
    }

    /// Remove a record and close it. Returns whether this call removed it.
    pub(crate) async fn evict(&self, handle: &str) -> bool {
        let removed = self.records.write().await.remove(handle);
        match removed {
            Some(record) => {
                self.close_record(&record).await;
                true
            }
            None => false,
        }
    }

    /// Close the statements of `record` idle beyond `idle_timeout`. Returns how many.
    pub(crate) async fn evict_idle_statements(
        &self,
        record: &ConnectionRecord,
        idle_timeout: Duration,
    ) -> usize {
        let idle = record.statements.take_idle(idle_timeout).await;
        let count = idle.len();
        for (stmt_handle, statement) in idle {
            tracing::debug!(
                handle = %record.handle,
                statement = %stmt_handle,
                "evicting idle prepared statement"
            );
            self.close_shared_statement(&statement).await;
        }
        count
    }

    /// Close every statement, then the connection. Failures are logged only.
    ///
    /// A connection or statement held by an in-flight request is closed by a
    /// background task once released, so the caller never waits on it.
    async fn close_record(&self, record: &ConnectionRecord) {
        for statement in record.statements.take_all().await {
            self.close_shared_statement(&statement).await;
        }

        if let Ok(mut conn) = record.connection.try_lock() {
            if let Err(e) = self.connector.close(conn.as_mut()).await {
                tracing::warn!(
                    handle = %record.handle,
                    db = %record.target,
                    error = %e,
                    "failed to close connection"
                );
            }
            return;
        }

        tracing::debug!(handle = %record.handle, "connection in use, closing it once released");
        let connection = Arc::clone(&record.connection);
        let connector = self.connector.clone();
        let handle = record.handle.clone();
        tokio::spawn(async move {
            let mut conn = connection.lock().await;
            if let Err(e) = connector.close(conn.as_mut()).await {
                tracing::warn!(handle = %handle, error = %e, "failed to close released connection");
            }
        });
    }

    async fn close_shared_statement(&self, statement: &SharedStatement) {
        if let Ok(mut stmt) = statement.try_lock() {
            if let Err(e) = self.connector.close_statement(stmt.as_mut()).await {
                tracing::warn!(error = %e, "failed to close prepared statement");
            }
            return;
        }

        let statement = Arc::clone(statement);
        let connector = self.connector.clone();
        tokio::spawn(async move {
            let mut stmt = statement.lock().await;
            if let Err(e) = connector.close_statement(stmt.as_mut()).await {
                tracing::warn!(error = %e, "failed to close released prepared statement");
            }
        });
    }

    async fn discard_statement(&self, mut statement: Box<dyn DriverStatement>) {
        if let Err(e) = self.connector.close_statement(statement.as_mut()).await {
            tracing::warn!(error = %e, "failed to close orphaned prepared statement");
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}
