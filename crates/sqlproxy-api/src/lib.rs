//! sqlproxy-api: REST API for the SQL proxy.
//!
//! Thin axum layer over [`Registry`]: it maps found/not-found and error
//! signals from the pool to HTTP status codes. Handles travel as plain-text
//! bodies and headers; query results come back as a JSON envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/connection` | Get or open a pooled connection |
//! | DELETE | `/api/v1/connection` | Close a pooled connection |
//! | POST | `/api/v1/query` | Run a row-returning query |
//! | PUT | `/api/v1/query` | Execute a statement without rows |
//! | POST | `/api/v1/prepared` | Prepare a statement on a connection |
//! | DELETE | `/api/v1/prepared` | Close a prepared statement |
//! | POST | `/api/v1/prepared/query` | Run a prepared query with parameters |
//! | PUT | `/api/v1/prepared/query` | Execute a prepared statement with parameters |
//! | GET | `/healthz`, `/readyz`, `/livez` | Health checks |
//!
//! Every `/api/v1` request must carry `API-Version: 1`.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use sqlproxy_pool::Registry;

/// Protocol version accepted in the `API-Version` header.
pub const API_VERSION: &str = "1";

/// Default request body cap.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state for API handlers.
#[derive(Clone, Debug)]
pub struct ApiState {
    pub registry: Arc<Registry>,
}

/// Build the complete router (versioned API + health checks).
pub fn build_router(registry: Arc<Registry>, max_body_bytes: usize) -> Router {
    let api_state = ApiState { registry };

    let api_routes = Router::new()
        .route(
            "/connection",
            post(handlers::create_connection).delete(handlers::close_connection),
        )
        .route(
            "/query",
            post(handlers::select_query).put(handlers::execute_query),
        )
        .route(
            "/prepared",
            post(handlers::prepare_statement).delete(handlers::close_prepared_statement),
        )
        .route(
            "/prepared/query",
            post(handlers::prepared_select).put(handlers::prepared_execute),
        )
        .layer(middleware::from_fn(handlers::require_api_version))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/livez", get(handlers::livez))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
