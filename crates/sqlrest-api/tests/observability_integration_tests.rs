//! Tests for the fully assembled application: configuration, middleware
//! and the Prometheus endpoint.
//!
//! Only one Prometheus recorder can be installed per process, so every
//! test that needs `/metrics` lives in a single test function.

mod common;

use std::io::Write;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::json;
use serial_test::serial;
use tempfile::NamedTempFile;
use tower::ServiceExt;

use sqlrest_api::http::{create_router_with_observability, AppState, RouterOptions};
use sqlrest_api::middleware::{RequestMetrics, REQUEST_ID_HEADER};
use sqlrest_api::observability::{init_metrics, MetricsState};
use sqlrest_server::{BatchEngine, ServerConfig};
use sqlrest_storage::{Database, MemoryDatabase};

use common::{op, read};

const CONFIG: &str = r#"
server:
  host: "127.0.0.1"
  port: 8080
  request_timeout_secs: 30

storage:
  backend: memory

metrics:
  enabled: true
  path: /custom-metrics

batch:
  max_operations: 10
  heartbeat_interval_ms: 50

auth:
  principal_header: X-User

resources:
  - name: notes
    columns:
      - { name: id, type: integer, nullable: false }
      - { name: title, type: text, unique: true }
    write: authenticated
"#;

fn load_config() -> ServerConfig {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    ServerConfig::load(file.path()).unwrap()
}

/// Builds the application the way the binary does.
async fn build_app(
    config: &ServerConfig,
    metrics_state: Option<MetricsState>,
    request_metrics: Arc<RequestMetrics>,
) -> (MemoryDatabase, Router) {
    let registry = Arc::new(config.registry().unwrap());
    let db = MemoryDatabase::new();
    db.migrate(&registry.tables()).await.unwrap();

    let engine = BatchEngine::builder(Arc::new(db.clone()), registry)
        .settings(config.batch.engine_settings())
        .build();
    let router = create_router_with_observability(
        AppState::from_config(engine, config),
        metrics_state,
        request_metrics,
        &RouterOptions::from_config(config),
    );
    (db, router)
}

fn put_batch(payload: &serde_json::Value, user: Option<&str>) -> Request<Body> {
    let mut request = Request::builder()
        .method("PUT")
        .uri("/batch")
        .header("content-type", "application/json");
    if let Some(user) = user {
        request = request.header("x-user", user);
    }
    request.body(Body::from(payload.to_string())).unwrap()
}

#[tokio::test]
#[serial]
async fn test_configured_application_end_to_end() {
    let config = load_config();
    let request_metrics = Arc::new(RequestMetrics::new());
    let metrics_state = init_metrics().unwrap();
    let (db, app) = build_app(&config, Some(metrics_state), Arc::clone(&request_metrics)).await;

    // The configured principal header gates writes.
    let payload = json!([op("PUT", "/notes/1", json!({"title": "first"}))]);
    let response = app.clone().oneshot(put_batch(&payload, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(put_batch(&payload, Some("alice")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    assert_eq!(db.committed_rows("notes").len(), 1);

    // The configured operation limit applies.
    let oversized = serde_json::Value::Array((0..11).map(|_| read("/notes/1")).collect());
    let response = app
        .clone()
        .oneshot(put_batch(&oversized, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/custom-metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("sqlrest_http_requests_total"));
    assert!(text.contains("sqlrest_batch_operations_total"));

    assert_eq!(request_metrics.get_request_count(), 4);
    assert_eq!(request_metrics.get_client_error_count(), 2);
}

#[tokio::test]
#[serial]
async fn test_metrics_route_absent_when_disabled() {
    let mut config = load_config();
    config.metrics.enabled = false;
    let (_db, app) = build_app(&config, None, Arc::new(RequestMetrics::new())).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/custom-metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
#[serial]
async fn test_request_id_is_propagated() {
    let config = load_config();
    let (_db, app) = build_app(&config, None, Arc::new(RequestMetrics::new())).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(REQUEST_ID_HEADER, "trace-me")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-me");
}
