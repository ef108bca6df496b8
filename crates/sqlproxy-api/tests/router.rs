//! Router-level tests: full request → response through `build_router`.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use sqlproxy_api::{DEFAULT_MAX_BODY_BYTES, build_router};
use sqlproxy_pool::testing::MockDriver;
use sqlproxy_pool::{PoolConfig, Registry};
use serde_json::{Value, json};
use tower::ServiceExt;

const PARAMS: &str = r#"{"db_type":"mysql","host":"db.local","port":3306,"user":"app","password":"pw","db_name":"shop"}"#;

struct Harness {
    router: Router,
    registry: Arc<Registry>,
    driver: Arc<MockDriver>,
}

fn harness() -> Harness {
    harness_with(PoolConfig::default())
}

fn harness_with(config: PoolConfig) -> Harness {
    let driver = Arc::new(MockDriver::new());
    let registry = Arc::new(Registry::new(config, driver.clone()));
    Harness {
        router: build_router(registry.clone(), DEFAULT_MAX_BODY_BYTES),
        registry,
        driver,
    }
}

fn api(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("API-Version", "1")
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn open_connection(router: &Router) -> String {
    let request = api(Method::POST, "/api/v1/connection")
        .body(Body::from(PARAMS))
        .unwrap();
    let (status, handle) = send(router, request).await;
    assert_eq!(status, StatusCode::OK);
    handle
}

async fn prepare(router: &Router, conn_id: &str, sql: &str) -> (StatusCode, String) {
    let request = api(Method::POST, "/api/v1/prepared")
        .header("Connection-Id", conn_id)
        .body(Body::from(sql.to_string()))
        .unwrap();
    send(router, request).await
}

fn run_prepared(method: Method, conn_id: &str, stmt_id: &str, params: &str) -> Request<Body> {
    api(method, "/api/v1/prepared/query")
        .header("Connection-Id", conn_id)
        .header("Statement-Id", stmt_id)
        .body(Body::from(params.to_string()))
        .unwrap()
}

// ── Versioning ──────────────────────────────────────────────────────

#[tokio::test]
async fn missing_api_version_is_not_implemented() {
    let h = harness();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/connection")
        .body(Body::from(PARAMS))
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(h.driver.opens(), 0);
}

#[tokio::test]
async fn wrong_api_version_is_not_implemented() {
    let h = harness();
    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/api/v1/prepared")
        .header("API-Version", "2")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn health_endpoints_need_no_version() {
    let h = harness();
    for (path, expected) in [("/healthz", "OK"), ("/readyz", "Ready"), ("/livez", "Live")] {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let (status, body) = send(&h.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, expected);
    }
}

// ── Connections ─────────────────────────────────────────────────────

#[tokio::test]
async fn same_params_return_same_handle() {
    let h = harness();
    let first = open_connection(&h.router).await;
    let second = open_connection(&h.router).await;
    assert_eq!(first, second);
    assert_eq!(h.driver.opens(), 1);
}

#[tokio::test]
async fn unsupported_engine_is_bad_request() {
    let h = harness();
    let request = api(Method::POST, "/api/v1/connection")
        .body(Body::from(
            r#"{"db_type":"oracle","host":"db.local","port":1521,"user":"app","password":"pw","db_name":"x"}"#,
        ))
        .unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("oracle"));
}

#[tokio::test]
async fn unreachable_backend_is_internal_error() {
    let h = harness();
    h.driver.set_open_unhealthy(true);
    let request = api(Method::POST, "/api/v1/connection")
        .body(Body::from(PARAMS))
        .unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.contains("pw"));
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn delete_connection_and_unknown_handle() {
    let h = harness();
    let handle = open_connection(&h.router).await;

    let request = api(Method::DELETE, "/api/v1/connection")
        .body(Body::from(handle.clone()))
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.registry.get_by_handle(&handle, false).await.is_none());
    assert!(h.driver.last_connection().unwrap().is_closed());

    let request = api(Method::DELETE, "/api/v1/connection")
        .body(Body::from("no-such-handle"))
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);
}

// ── Prepared statements ─────────────────────────────────────────────

#[tokio::test]
async fn prepare_and_close_statement() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;

    let (status, stmt_id) = prepare(&h.router, &conn_id, "SELECT * FROM orders WHERE id = ?").await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.registry.get_statement(&conn_id, &stmt_id).await.is_some());

    let close = || {
        api(Method::DELETE, "/api/v1/prepared")
            .header("Connection-Id", conn_id.as_str())
            .header("Statement-Id", stmt_id.as_str())
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&h.router, close()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.registry.get_statement(&conn_id, &stmt_id).await.is_none());

    let (status, _) = send(&h.router, close()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn prepare_on_unknown_connection_is_forbidden() {
    let h = harness();
    let (status, _) = prepare(&h.router, "no-such-handle", "SELECT 1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn prepare_without_headers_or_body_is_bad_request() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;

    let (status, _) = prepare(&h.router, &conn_id, "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = api(Method::POST, "/api/v1/prepared")
        .body(Body::from("SELECT 1"))
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn prepare_failure_is_bad_request() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;

    // A session closed underneath the registry fails to prepare.
    let conn = h.registry.get_by_handle(&conn_id, false).await.unwrap();
    conn.lock().await.close().await.unwrap();

    let (status, body) = prepare(&h.router, &conn_id, "SELECT 1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("prepare failed"));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let driver = Arc::new(MockDriver::new());
    let registry = Arc::new(Registry::new(PoolConfig::default(), driver.clone()));
    let router = build_router(registry.clone(), 64);

    let request = api(Method::POST, "/api/v1/connection")
        .body(Body::from(PARAMS))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(driver.opens(), 0);

    let (status, _) = prepare(&router, "any", &"x".repeat(128)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

// ── Queries ─────────────────────────────────────────────────────────

#[tokio::test]
async fn select_query_returns_rows_envelope() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;

    let uri = format!("/api/v1/query?connection_id={conn_id}&sql=SELECT%20*%20FROM%20orders");
    let request = api(Method::POST, &uri).body(Body::empty()).unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let envelope: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(envelope["api_version"], json!(1));
    assert_eq!(envelope["connection_id"], json!(conn_id));
    assert_eq!(envelope["rows_count"], json!(1));
    assert_eq!(envelope["exceeds_max_rows"], json!(false));
    assert_eq!(
        envelope["rows"],
        json!([{"id": 1, "sql": "SELECT * FROM orders", "params": []}])
    );
}

#[tokio::test]
async fn select_query_caps_rows() {
    let h = harness_with(PoolConfig {
        max_rows: 2,
        ..PoolConfig::default()
    });
    let conn_id = open_connection(&h.router).await;
    h.driver.last_connection().unwrap().set_result_rows(5);

    let uri = format!("/api/v1/query?connection_id={conn_id}&sql=SELECT%201");
    let request = api(Method::POST, &uri).body(Body::empty()).unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let envelope: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(envelope["rows_count"], json!(2));
    assert_eq!(envelope["exceeds_max_rows"], json!(true));
    assert_eq!(envelope["rows"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn select_query_status_codes() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;

    let request = api(Method::POST, "/api/v1/query?sql=SELECT%201")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = api(Method::POST, "/api/v1/query?connection_id=nope&sql=SELECT%201")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    h.driver.last_connection().unwrap().set_fail_queries(true);
    let uri = format!("/api/v1/query?connection_id={conn_id}&sql=SELECT%20FROM");
    let request = api(Method::POST, &uri).body(Body::empty()).unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("syntax error"), "{body}");
}

#[tokio::test]
async fn execute_query_returns_empty_ok() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;

    let request = api(Method::PUT, "/api/v1/query")
        .body(Body::from(
            json!({"connection_id": conn_id, "sql": "UPDATE orders SET paid = 1"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let executed = h.driver.last_connection().unwrap().executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "UPDATE orders SET paid = 1");
}

// ── Prepared queries ────────────────────────────────────────────────

#[tokio::test]
async fn prepared_query_binds_parameters() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;
    let (_, stmt_id) = prepare(&h.router, &conn_id, "SELECT * FROM orders WHERE id = ?").await;

    let request = run_prepared(Method::POST, &conn_id, &stmt_id, r#"[42, "paid"]"#);
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let envelope: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(envelope["rows_count"], json!(1));
    assert_eq!(envelope["rows"][0]["params"], json!([42, "paid"]));
    assert_eq!(
        envelope["rows"][0]["sql"],
        json!("SELECT * FROM orders WHERE id = ?")
    );
}

#[tokio::test]
async fn prepared_execute_without_body_binds_nothing() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;
    let (_, stmt_id) = prepare(&h.router, &conn_id, "DELETE FROM carts").await;

    for body in ["", "null"] {
        let request = run_prepared(Method::PUT, &conn_id, &stmt_id, body);
        let (status, response) = send(&h.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.is_empty());
    }

    let executed = h.driver.last_connection().unwrap().executed();
    assert_eq!(executed, vec![("DELETE FROM carts".to_string(), vec![]); 2]);
}

#[tokio::test]
async fn prepared_query_status_codes() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;
    let (_, stmt_id) = prepare(&h.router, &conn_id, "SELECT ?").await;

    let request = api(Method::POST, "/api/v1/prepared/query")
        .header("Connection-Id", conn_id.as_str())
        .body(Body::from("[1]"))
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = run_prepared(Method::POST, &conn_id, &stmt_id, "not json");
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = run_prepared(Method::POST, &conn_id, "no-such-statement", "[1]");
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = run_prepared(Method::PUT, "no-such-connection", &stmt_id, "[1]");
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    h.driver.last_connection().unwrap().set_fail_queries(true);
    let request = run_prepared(Method::PUT, &conn_id, &stmt_id, "[1]");
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn closed_statement_is_no_longer_runnable() {
    let h = harness();
    let conn_id = open_connection(&h.router).await;
    let (_, stmt_id) = prepare(&h.router, &conn_id, "SELECT ?").await;

    let request = api(Method::DELETE, "/api/v1/prepared")
        .header("Connection-Id", conn_id.as_str())
        .header("Statement-Id", stmt_id.as_str())
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let request = run_prepared(Method::POST, &conn_id, &stmt_id, "[1]");
    let (status, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
