//! REST API handlers.
//!
//! Success bodies are plain text (connection or statement handle) or, for
//! row-returning queries, a JSON [`ResponseEnvelope`]. Errors are a
//! plain-text message with the status code carrying the meaning: 400
//! malformed request, 403 unknown handle, 500 pool or backend failure, 501
//! unsupported API version.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use sqlproxy_pool::{ConnectionParams, DriverError, ResultSet, SqlValue};

use crate::{API_VERSION, ApiState};

pub const API_VERSION_HEADER: &str = "API-Version";
pub const CONNECTION_ID_HEADER: &str = "Connection-Id";
pub const STATEMENT_ID_HEADER: &str = "Statement-Id";

fn error_response(msg: &str, status: StatusCode) -> Response {
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), "{msg}");
    } else {
        tracing::warn!(status = status.as_u16(), "{msg}");
    }
    (status, msg.to_string()).into_response()
}

/// Non-empty header value, if present and valid UTF-8.
fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Rows returned by a query, one JSON object per row keyed by column name.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub api_version: u8,
    pub connection_id: String,
    pub info: String,
    pub rows_count: usize,
    pub exceeds_max_rows: bool,
    pub rows: Vec<serde_json::Map<String, SqlValue>>,
}

impl ResponseEnvelope {
    pub fn new(connection_id: &str, result: ResultSet) -> Self {
        let ResultSet {
            columns,
            rows,
            exceeds_max_rows,
        } = result;
        let rows: Vec<_> = rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect();
        Self {
            api_version: 1,
            connection_id: connection_id.to_string(),
            info: String::new(),
            rows_count: rows.len(),
            exceeds_max_rows,
            rows,
        }
    }
}

/// Statement parameters: a JSON array, or an empty / `null` body for none.
fn parse_params(body: &[u8]) -> Option<Vec<SqlValue>> {
    let body = body.trim_ascii();
    if body.is_empty() || body == b"null" {
        return Some(Vec::new());
    }
    serde_json::from_slice(body).ok()
}

// ── Middleware ─────────────────────────────────────────────────

/// Reject requests without `API-Version: 1` with 501.
pub async fn require_api_version(request: Request, next: Next) -> Response {
    if header(request.headers(), API_VERSION_HEADER) != Some(API_VERSION) {
        return error_response("Unsupported API version", StatusCode::NOT_IMPLEMENTED);
    }
    next.run(request).await
}

// ── Connections ────────────────────────────────────────────────

/// POST /api/v1/connection
pub async fn create_connection(State(state): State<ApiState>, body: Bytes) -> Response {
    let params: ConnectionParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(_) => return error_response("Error decoding JSON", StatusCode::BAD_REQUEST),
    };

    match state.registry.get_or_create(&params).await {
        Ok(handle) => handle.into_response(),
        Err(e) if e.is_client_error() => error_response(&e.to_string(), StatusCode::BAD_REQUEST),
        Err(e) => {
            tracing::error!(db = %params.target(), error = %e, "failed to get SQL connection");
            error_response("Failed to get SQL connection", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/v1/connection
///
/// Unknown handles are not an error.
pub async fn close_connection(State(state): State<ApiState>, body: String) -> Response {
    let handle = body.trim();
    if handle.is_empty() {
        return error_response("Error reading request body", StatusCode::BAD_REQUEST);
    }
    if !state.registry.delete(handle).await {
        tracing::debug!(handle = %handle, "delete for unknown connection ignored");
    }
    StatusCode::OK.into_response()
}

// ── Queries ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SelectParams {
    connection_id: Option<String>,
    sql: Option<String>,
}

/// POST /api/v1/query?connection_id=..&sql=..
pub async fn select_query(
    State(state): State<ApiState>,
    Query(params): Query<SelectParams>,
) -> Response {
    let conn_id = params.connection_id.as_deref().map(str::trim).unwrap_or_default();
    let sql = params.sql.as_deref().unwrap_or_default();
    if conn_id.is_empty() || sql.trim().is_empty() {
        return error_response("Missing parameter", StatusCode::BAD_REQUEST);
    }
    tracing::debug!(handle = %conn_id, sql = %sql, "query received");

    let Some(conn) = state.registry.get_by_handle(conn_id, true).await else {
        return error_response("Failed to get SQL connection", StatusCode::FORBIDDEN);
    };

    let max_rows = state.registry.config().max_rows;
    let result = conn.lock().await.query(sql, max_rows).await;
    match result {
        Ok(result) => Json(ResponseEnvelope::new(conn_id, result)).into_response(),
        Err(e) => query_failed(conn_id, &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    connection_id: String,
    sql: String,
}

/// PUT /api/v1/query
pub async fn execute_query(State(state): State<ApiState>, body: Bytes) -> Response {
    let request: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return error_response("Error decoding JSON", StatusCode::BAD_REQUEST),
    };
    tracing::debug!(handle = %request.connection_id, sql = %request.sql, "execute received");

    let Some(conn) = state.registry.get_by_handle(&request.connection_id, true).await else {
        return error_response("Invalid connection id", StatusCode::BAD_REQUEST);
    };

    let executed = conn.lock().await.execute(&request.sql).await;
    match executed {
        Ok(affected) => {
            tracing::debug!(handle = %request.connection_id, affected, "statement executed");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::warn!(handle = %request.connection_id, error = %e, "execute failed");
            error_response("Invalid SQL query", StatusCode::BAD_REQUEST)
        }
    }
}

fn query_failed(conn_id: &str, error: &DriverError) -> Response {
    tracing::error!(handle = %conn_id, error = %error, "SQL query error");
    error_response(&error.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

// ── Prepared statements ────────────────────────────────────────

/// POST /api/v1/prepared
pub async fn prepare_statement(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(conn_id) = header(&headers, CONNECTION_ID_HEADER) else {
        return error_response("Bad request", StatusCode::BAD_REQUEST);
    };
    if body.trim().is_empty() {
        return error_response("Bad request", StatusCode::BAD_REQUEST);
    }
    tracing::debug!(handle = %conn_id, sql = %body, "prepare statement received");

    let Some(conn) = state.registry.get_by_handle(conn_id, true).await else {
        return error_response("Invalid connection id", StatusCode::FORBIDDEN);
    };

    let prepared = conn.lock().await.prepare(&body).await;
    let statement = match prepared {
        Ok(statement) => statement,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };

    match state.registry.put_statement(conn_id, statement).await {
        Some(stmt_id) => stmt_id.into_response(),
        None => error_response(
            "Error saving statement into pool",
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// DELETE /api/v1/prepared
pub async fn close_prepared_statement(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Response {
    let (Some(conn_id), Some(stmt_id)) = (
        header(&headers, CONNECTION_ID_HEADER),
        header(&headers, STATEMENT_ID_HEADER),
    ) else {
        return error_response("Bad request", StatusCode::BAD_REQUEST);
    };
    tracing::debug!(handle = %conn_id, statement = %stmt_id, "close prepared statement received");

    if state.registry.close_statement(conn_id, stmt_id).await {
        StatusCode::OK.into_response()
    } else {
        error_response("Prepared statement not found", StatusCode::FORBIDDEN)
    }
}

/// POST /api/v1/prepared/query
pub async fn prepared_select(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_prepared(state, headers, body, false).await
}

/// PUT /api/v1/prepared/query
pub async fn prepared_execute(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_prepared(state, headers, body, true).await
}

async fn run_prepared(state: ApiState, headers: HeaderMap, body: Bytes, execute: bool) -> Response {
    let (Some(conn_id), Some(stmt_id)) = (
        header(&headers, CONNECTION_ID_HEADER),
        header(&headers, STATEMENT_ID_HEADER),
    ) else {
        return error_response("Bad request", StatusCode::BAD_REQUEST);
    };
    let Some(params) = parse_params(&body) else {
        return error_response("Bad request", StatusCode::BAD_REQUEST);
    };
    tracing::debug!(
        handle = %conn_id,
        statement = %stmt_id,
        params = params.len(),
        "prepared statement run received"
    );

    let (Some(conn), Some(statement)) = (
        state.registry.get_by_handle(conn_id, true).await,
        state.registry.get_statement(conn_id, stmt_id).await,
    ) else {
        return error_response("Prepared statement not found", StatusCode::FORBIDDEN);
    };

    // Holding the connection marks it busy, so maintenance leaves it alone
    // while the statement runs.
    let _conn = conn.lock().await;
    let mut statement = statement.lock().await;
    if execute {
        match statement.execute(&params).await {
            Ok(affected) => {
                tracing::debug!(handle = %conn_id, statement = %stmt_id, affected, "executed");
                StatusCode::OK.into_response()
            }
            Err(e) => query_failed(conn_id, &e),
        }
    } else {
        let max_rows = state.registry.config().max_rows;
        match statement.query(&params, max_rows).await {
            Ok(result) => Json(ResponseEnvelope::new(conn_id, result)).into_response(),
            Err(e) => query_failed(conn_id, &e),
        }
    }
}

// ── Health checks ──────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    "OK"
}

/// GET /readyz
pub async fn readyz() -> impl IntoResponse {
    "Ready"
}

/// GET /livez
pub async fn livez() -> impl IntoResponse {
    "Live"
}
