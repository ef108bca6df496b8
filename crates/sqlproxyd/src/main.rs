//! sqlproxyd: the SQL proxy daemon.
//!
//! Single binary that assembles the proxy:
//! - Connection registry with engine drivers
//! - Pool maintenance loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! sqlproxyd serve --config /etc/sqlproxy/sqlproxy.toml --port 8080
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlproxy_drivers::EngineDriver;
use sqlproxy_pool::{Maintenance, Registry};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

const DEFAULT_LOG_FILTER: &str = "info,sqlproxyd=debug,sqlproxy_pool=debug";

#[derive(Parser)]
#[command(name = "sqlproxyd", about = "SQL proxy daemon", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API until interrupted.
    Serve {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to bind; `*` for all interfaces.
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Serve { config, bind, port } => {
            let mut daemon_config = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };
            daemon_config.apply_env(|key| std::env::var(key).ok());
            if let Some(bind) = bind {
                daemon_config.server.bind_address = bind;
            }
            if let Some(port) = port {
                daemon_config.server.bind_port = port;
            }
            run_serve(daemon_config).await
        }
    }
}

async fn run_serve(config: DaemonConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "SQL proxy starting");

    // ── Initialize subsystems ──────────────────────────────────

    let pool_config = config.pool_config()?;
    let engines: Vec<&str> = EngineDriver::supported_engines()
        .iter()
        .map(|engine| engine.as_str())
        .collect();
    info!(?engines, "database drivers available");

    let registry = Arc::new(Registry::new(pool_config.clone(), Arc::new(EngineDriver::new())));
    info!(
        maintenance_interval_secs = pool_config.maintenance_interval.as_secs(),
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        max_rows = pool_config.max_rows,
        "connection registry initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let maintenance = Maintenance::new(registry.clone());
    let maintenance_handle = tokio::spawn(async move {
        maintenance.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = sqlproxy_api::build_router(registry.clone(), config.server.max_body_bytes);
    let (host, port) = config.listen_target();
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    info!(addr = %listener.local_addr()?, "API server listening");

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for maintenance, then release every pooled session.
    let _ = maintenance_handle.await;
    let closed = registry.close_all().await;

    info!(closed, "SQL proxy stopped");
    Ok(())
}
