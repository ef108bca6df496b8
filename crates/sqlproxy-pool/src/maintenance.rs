//! Background maintenance: health checks and idle eviction.
//!
//! Every `maintenance_interval` the loop walks a snapshot of the registry:
//! connections idle beyond `idle_timeout` or failing their ping are marked,
//! idle statements of the surviving connections are closed, and finally the
//! marked connections are evicted. A connection held by a request is in use
//! and left alone until the next cycle. Nothing in a cycle is fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::registry::Registry;

/// Outcome of one maintenance cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,
    pub busy_connections: usize,
    pub dead_connections: usize,
    pub idle_connections: usize,
    pub evicted_statements: usize,
}

impl CycleReport {
    pub fn evicted_connections(&self) -> usize {
        self.dead_connections + self.idle_connections
    }
}

/// Periodic pruning task over a shared [`Registry`].
#[derive(Debug)]
pub struct Maintenance {
    registry: Arc<Registry>,
    interval: Duration,
    idle_timeout: Duration,
}

impl Maintenance {
    pub fn new(registry: Arc<Registry>) -> Self {
        let interval = registry.config().maintenance_interval;
        let idle_timeout = registry.config().idle_timeout;
        Self {
            registry,
            interval,
            idle_timeout,
        }
    }

    /// Run cycles until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "pool maintenance started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("pool maintenance shutting down");
                    break;
                }
            }
        }
    }

    /// Scan the registry once and evict what is dead or idle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let mut marked = Vec::new();

        for record in self.registry.records().await {
            report.scanned += 1;

            if record.is_busy() {
                debug!(handle = %record.handle, "connection in use, skipping");
                report.busy_connections += 1;
                continue;
            }

            // Idle connections go regardless of liveness, no ping needed.
            if record.idle_for() > self.idle_timeout {
                debug!(handle = %record.handle, "connection idle, marking for eviction");
                report.idle_connections += 1;
                marked.push(record.handle.clone());
                continue;
            }

            if let Err(e) = self.registry.check_alive(&record).await {
                debug!(
                    handle = %record.handle,
                    error = %e,
                    "connection failed ping, marking for eviction"
                );
                report.dead_connections += 1;
                marked.push(record.handle.clone());
                continue;
            }

            report.evicted_statements += self
                .registry
                .evict_idle_statements(&record, self.idle_timeout)
                .await;
        }

        for handle in &marked {
            self.registry.evict(handle).await;
        }

        if report.evicted_connections() > 0 || report.evicted_statements > 0 {
            info!(
                scanned = report.scanned,
                dead = report.dead_connections,
                idle = report.idle_connections,
                statements = report.evicted_statements,
                "pool maintenance evicted resources"
            );
        } else {
            debug!(scanned = report.scanned, "pool maintenance cycle complete");
        }
        report
    }
}
