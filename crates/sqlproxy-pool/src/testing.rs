//! In-memory driver for tests.
//!
//! `MockDriver` hands out connections whose health, hang and close state is
//! shared through [`MockState`], so a test can flip a backend to "dead"
//! after the registry already owns it.
//!
//! Queries return one row per configured result row: `id` counts from 1,
//! `sql` echoes the statement text and `params` echoes the bound values.
//! Executions are recorded and report the configured row count as affected.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;

use crate::driver::{
    Driver, DriverConnection, DriverError, DriverFuture, DriverStatement, ResultSet, SqlValue,
};
use crate::params::Engine;

const DEFAULT_RESULT_ROWS: usize = 1;

/// Observable state of one mock connection.
#[derive(Debug)]
pub struct MockState {
    pub engine: Engine,
    pub dsn: String,
    healthy: AtomicBool,
    hang: AtomicBool,
    closed: AtomicBool,
    fail_queries: AtomicBool,
    result_rows: AtomicUsize,
    pings: AtomicU64,
    statements_closed: AtomicU64,
    executed: Mutex<Vec<(String, Vec<SqlValue>)>>,
}

impl MockState {
    fn new(engine: Engine, dsn: &str, healthy: bool) -> Self {
        Self {
            engine,
            dsn: dsn.to_string(),
            healthy: AtomicBool::new(healthy),
            hang: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            result_rows: AtomicUsize::new(DEFAULT_RESULT_ROWS),
            pings: AtomicU64::new(0),
            statements_closed: AtomicU64::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// State not tied to any driver, for statements built by hand.
    pub fn detached(engine: Engine) -> Arc<Self> {
        Arc::new(Self::new(engine, "", true))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make ping and close never complete.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Make every query and execution fail with a query error.
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Rows produced by each query and reported affected by each execution.
    pub fn set_result_rows(&self, rows: usize) {
        self.result_rows.store(rows, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn statements_closed(&self) -> u64 {
        self.statements_closed.load(Ordering::SeqCst)
    }

    /// SQL text and parameters of every execution, in order.
    pub fn executed(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_query(&self) -> Result<(), DriverError> {
        if self.is_closed() {
            return Err(DriverError::Query("connection closed".to_string()));
        }
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(DriverError::Query("syntax error at or near \"FROM\"".to_string()));
        }
        Ok(())
    }

    fn rows(&self, sql: &str, params: &[SqlValue], max_rows: usize) -> ResultSet {
        let rows = (1..=self.result_rows.load(Ordering::SeqCst))
            .map(|id| vec![json!(id), json!(sql), SqlValue::Array(params.to_vec())])
            .collect();
        let columns = ["id", "sql", "params"].map(String::from).to_vec();
        ResultSet::new(columns, rows, max_rows)
    }

    fn record_execution(&self, sql: &str, params: &[SqlValue]) -> u64 {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((sql.to_string(), params.to_vec()));
        self.result_rows.load(Ordering::SeqCst) as u64
    }
}

/// Driver producing [`MockConnection`]s.
#[derive(Debug, Default)]
pub struct MockDriver {
    opens: AtomicU64,
    fail_open: AtomicBool,
    open_unhealthy: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
    rejected: Mutex<Vec<Engine>>,
    connections: Mutex<Vec<Arc<MockState>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `open` calls.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make `open` fail with a connect error.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// New connections open fine but fail their ping.
    pub fn set_open_unhealthy(&self, unhealthy: bool) {
        self.open_unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Sleep inside every `open`, so concurrent callers overlap.
    pub fn set_open_delay(&self, delay: Duration) {
        *self
            .open_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Behave as if the driver for `engine` was not compiled in.
    pub fn reject_engine(&self, engine: Engine) {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(engine);
    }

    pub fn connections(&self) -> Vec<Arc<MockState>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockState>> {
        self.connections().last().cloned()
    }
}

impl Driver for MockDriver {
    fn open<'a>(
        &'a self,
        engine: Engine,
        dsn: &'a str,
    ) -> DriverFuture<'a, Box<dyn DriverConnection>> {
        Box::pin(async move {
            let rejected = self
                .rejected
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&engine);
            if rejected {
                return Err(DriverError::Unsupported(engine));
            }
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(DriverError::Connect("connection refused".to_string()));
            }
            let delay = *self
                .open_delay
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let healthy = !self.open_unhealthy.load(Ordering::SeqCst);
            let state = Arc::new(MockState::new(engine, dsn, healthy));
            self.connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(state.clone());
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockConnection { state }) as Box<dyn DriverConnection>)
        })
    }
}

/// Connection backed by a shared [`MockState`].
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<MockState>,
}

async fn hang_if_requested(state: &MockState) {
    if state.hang.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

impl DriverConnection for MockConnection {
    fn ping(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.state.pings.fetch_add(1, Ordering::SeqCst);
            hang_if_requested(&self.state).await;
            if self.state.is_closed() {
                return Err(DriverError::Ping("connection closed".to_string()));
            }
            if self.state.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DriverError::Ping("server closed the connection".to_string()))
            }
        })
    }

    fn prepare<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, Box<dyn DriverStatement>> {
        Box::pin(async move {
            if self.state.is_closed() {
                return Err(DriverError::Prepare("connection closed".to_string()));
            }
            if sql.trim().is_empty() {
                return Err(DriverError::Prepare("empty query".to_string()));
            }
            Ok(Box::new(MockStatement::new(sql, self.state.clone())) as Box<dyn DriverStatement>)
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str, max_rows: usize) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            self.state.check_query()?;
            Ok(self.state.rows(sql, &[], max_rows))
        })
    }

    fn execute<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            self.state.check_query()?;
            Ok(self.state.record_execution(sql, &[]))
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            hang_if_requested(&self.state).await;
            self.state.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Statement that records its closure on the parent connection's state.
#[derive(Debug)]
pub struct MockStatement {
    sql: String,
    parent: Arc<MockState>,
    closed: bool,
}

impl MockStatement {
    pub fn new(sql: &str, parent: Arc<MockState>) -> Self {
        Self {
            sql: sql.to_string(),
            parent,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Query("statement closed".to_string()));
        }
        self.parent.check_query()
    }
}

impl DriverStatement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn query<'a>(
        &'a mut self,
        params: &'a [SqlValue],
        max_rows: usize,
    ) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            self.check_open()?;
            Ok(self.parent.rows(&self.sql, params, max_rows))
        })
    }

    fn execute<'a>(&'a mut self, params: &'a [SqlValue]) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            self.check_open()?;
            Ok(self.parent.record_execution(&self.sql, params))
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                self.parent.statements_closed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}
