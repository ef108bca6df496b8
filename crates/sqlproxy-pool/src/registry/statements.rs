//! Per-connection prepared statement map.
//!
//! Pure bookkeeping: records are inserted, looked up and taken out here, and
//! the registry closes whatever it takes out. Statement handles are unique
//! within one connection only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::LastUsed;
use crate::driver::DriverStatement;

/// A statement shared with callers for the duration of one use.
pub type SharedStatement = Arc<Mutex<Box<dyn DriverStatement>>>;

#[derive(Debug)]
struct StatementRecord {
    statement: SharedStatement,
    last_used: LastUsed,
}

#[derive(Debug, Default)]
struct Slots {
    items: HashMap<String, StatementRecord>,
    /// Set once the owning connection is torn down; no inserts afterwards.
    closed: bool,
}

/// Statements prepared on a single pooled connection.
#[derive(Debug, Default)]
pub(crate) struct StatementRegistry {
    slots: RwLock<Slots>,
}

impl StatementRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a statement under a fresh handle.
    ///
    /// Hands the statement back if the owning connection is already closed,
    /// so the caller can release it.
    pub(crate) async fn insert(
        &self,
        statement: Box<dyn DriverStatement>,
    ) -> Result<String, Box<dyn DriverStatement>> {
        let mut slots = self.slots.write().await;
        if slots.closed {
            return Err(statement);
        }
        let handle = Uuid::new_v4().to_string();
        slots.items.insert(
            handle.clone(),
            StatementRecord {
                statement: Arc::new(Mutex::new(statement)),
                last_used: LastUsed::now(),
            },
        );
        Ok(handle)
    }

    /// Look up a statement, refreshing its last-used time.
    pub(crate) async fn get(&self, handle: &str) -> Option<SharedStatement> {
        let slots = self.slots.read().await;
        slots.items.get(handle).map(|record| {
            record.last_used.touch();
            Arc::clone(&record.statement)
        })
    }

    pub(crate) async fn remove(&self, handle: &str) -> Option<SharedStatement> {
        self.slots
            .write()
            .await
            .items
            .remove(handle)
            .map(|record| record.statement)
    }

    /// Take out every statement unused for longer than `idle_timeout`.
    pub(crate) async fn take_idle(&self, idle_timeout: Duration) -> Vec<(String, SharedStatement)> {
        let mut slots = self.slots.write().await;
        let idle: Vec<String> = slots
            .items
            .iter()
            .filter(|(_, record)| record.last_used.idle_for() > idle_timeout)
            .map(|(handle, _)| handle.clone())
            .collect();
        idle.into_iter()
            .filter_map(|handle| {
                slots
                    .items
                    .remove(&handle)
                    .map(|record| (handle, record.statement))
            })
            .collect()
    }

    /// Take out every statement and refuse further inserts.
    pub(crate) async fn take_all(&self) -> Vec<SharedStatement> {
        let mut slots = self.slots.write().await;
        slots.closed = true;
        slots
            .items
            .drain()
            .map(|(_, record)| record.statement)
            .collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.slots.read().await.items.len()
    }
}
