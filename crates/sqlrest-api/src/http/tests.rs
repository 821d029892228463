//! Router tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use sqlrest_domain::{codes, Phase, ResourceRegistry, ResourceSettings};
use sqlrest_server::{BatchEngine, BatchSettings, PhaseHook};
use sqlrest_server::handlers::batch::Cohort;
use sqlrest_storage::{Database, MemoryDatabase};

use super::*;

// ============================================================
// Test Fixtures
// ============================================================

fn resources() -> Vec<ResourceSettings> {
    serde_json::from_value(json!([
        {
            "name": "communities",
            "columns": [
                {"name": "id", "type": "integer", "nullable": false},
                {"name": "name", "type": "text", "unique": true}
            ],
            "write": "authenticated"
        },
        {
            "name": "messages",
            "columns": [
                {"name": "id", "type": "integer", "nullable": false},
                {"name": "community_id", "type": "integer",
                 "references": {"table": "communities", "column": "id"}},
                {"name": "text", "type": "text"}
            ]
        }
    ]))
    .unwrap()
}

struct TestApp {
    db: MemoryDatabase,
    router: Router,
}

async fn app_with(settings: BatchSettings, hook: Option<Arc<dyn PhaseHook>>) -> TestApp {
    let registry = ResourceRegistry::from_settings(&resources()).unwrap();
    let db = MemoryDatabase::new();
    db.migrate(&registry.tables()).await.unwrap();
    db.seed(
        "communities",
        vec![json!({"id": 100, "name": "taken"})
            .as_object()
            .cloned()
            .unwrap()],
    )
    .unwrap();

    let mut builder =
        BatchEngine::builder(Arc::new(db.clone()), Arc::new(registry)).settings(settings);
    if let Some(hook) = hook {
        builder = builder.phase_hook(hook);
    }
    let state = AppState::new(builder.build()).with_heartbeat(Duration::from_millis(10));
    TestApp {
        db,
        router: create_router(state),
    }
}

async fn app() -> TestApp {
    app_with(BatchSettings::default(), None).await
}

fn put_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-principal", "alice")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn op(verb: &str, href: &str, body: Value) -> Value {
    json!({"verb": verb, "href": href, "body": body})
}

fn read(href: &str) -> Value {
    json!({"verb": "GET", "href": href})
}

fn statuses(body: &Value) -> Vec<u64> {
    body.as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_u64().unwrap())
        .collect()
}

// ============================================================
// Health and Readiness
// ============================================================

#[tokio::test]
async fn test_health_is_ok() {
    let app = app().await;
    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_ready_tracks_database_health() {
    let app = app().await;
    let (status, body) = send(&app.router, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");

    app.db.set_unavailable(true);
    let (status, body) = send(&app.router, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");
    assert_eq!(body["checks"]["database"], "unavailable");
}

// ============================================================
// PUT /batch
// ============================================================

#[tokio::test]
async fn test_batch_creates_and_commits() {
    let app = app().await;
    let payload = json!([
        op("PUT", "/communities/1", json!({"name": "rust"})),
        op("PUT", "/messages/1", json!({"community_id": 1, "text": "hi"})),
    ]);

    let (status, body) = send(&app.router, put_json("/batch", &payload)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(statuses(&body), vec![201, 201]);
    assert_eq!(body[0]["body"], json!({"id": 1, "name": "rust"}));
    assert_eq!(app.db.committed_rows("messages").len(), 1);
}

#[tokio::test]
async fn test_batch_conflict_cancels_other_lane() {
    let app = app().await;
    let payload = json!([
        [op("PUT", "/messages/1", json!({"community_id": 42, "text": "orphan"}))],
        [op("PUT", "/communities/1", json!({"name": "rust"}))],
    ]);

    let (status, body) = send(&app.router, put_json("/batch", &payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body[0][0]["status"], 409);
    assert_eq!(body[0][0]["body"]["errors"][0]["code"], codes::DB_CONSTRAINT_VIOLATION);
    assert_eq!(body[1][0]["status"], 202);
    assert_eq!(body[1][0]["body"]["errors"][0]["code"], codes::CANCELLED);
    assert_eq!(app.db.committed_rows("communities").len(), 1);
}

#[tokio::test]
async fn test_batch_response_carries_summary_for_the_request_span() {
    let app = app().await;
    let payload = json!([
        [op("PUT", "/messages/1", json!({"community_id": 42}))],
        [op("PUT", "/communities/1", json!({"name": "rust"})), read("/communities/100")],
    ]);

    let response = app
        .router
        .clone()
        .oneshot(put_json("/batch", &payload))
        .await
        .unwrap();
    assert_eq!(
        response.extensions().get::<crate::middleware::BatchSummary>(),
        Some(&crate::middleware::BatchSummary {
            status: 409,
            committed: false,
            operations: 3,
        })
    );

    let response = app.router.clone().oneshot(get("/health")).await.unwrap();
    assert!(response
        .extensions()
        .get::<crate::middleware::BatchSummary>()
        .is_none());
}

#[tokio::test]
async fn test_batch_malformed_json_is_bad_request() {
    let app = app().await;
    let request = Request::builder()
        .method("PUT")
        .uri("/batch")
        .header("content-type", "application/json")
        .body(Body::from("[{\"verb\": "))
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["code"], codes::BATCH_MALFORMED);
}

#[tokio::test]
async fn test_batch_without_verb_is_rejected_whole() {
    let app = app().await;
    let payload = json!([
        op("PUT", "/communities/1", json!({"name": "rust"})),
        {"href": "/communities/2"},
    ]);

    let (status, body) = send(&app.router, put_json("/batch", &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["code"], codes::NO_VERB);
    assert_eq!(app.db.committed_rows("communities").len(), 1);
}

#[tokio::test]
async fn test_resource_batch_enforces_boundary() {
    let app = app().await;
    let payload = json!([op("PUT", "/messages/1", json!({"community_id": 100}))]);

    let (status, body) = send(&app.router, put_json("/communities/batch", &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["code"], codes::HREF_ACROSS_BOUNDARY);

    let (status, _) = send(&app.router, put_json("/messages/batch", &payload)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_batch_over_operation_limit() {
    let app = app_with(
        BatchSettings {
            max_operations: 2,
            ..BatchSettings::default()
        },
        None,
    )
    .await;
    let payload = json!([
        read("/communities/100"),
        read("/communities/100"),
        read("/communities/100"),
    ]);

    let (status, body) = send(&app.router, put_json("/batch", &payload)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["errors"][0]["code"], codes::BATCH_TOO_LARGE);
}

#[tokio::test]
async fn test_body_limit() {
    let registry = ResourceRegistry::from_settings(&resources()).unwrap();
    let db = MemoryDatabase::new();
    db.migrate(&registry.tables()).await.unwrap();
    let engine = BatchEngine::new(Arc::new(db), Arc::new(registry));
    let router = create_router_with_body_limit(AppState::new(engine), 64);

    let payload = json!([op("PUT", "/messages/1", json!({"text": "x".repeat(200)}))]);
    let response = router.oneshot(put_json("/batch", &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_principal_header_reaches_access_rules() {
    let app = app().await;
    let payload = json!([op("PUT", "/communities/1", json!({"name": "rust"}))]);

    let anonymous = Request::builder()
        .method("PUT")
        .uri("/batch")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let (status, body) = send(&app.router, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body[0]["body"]["errors"][0]["code"], codes::UNAUTHENTICATED);

    let (status, _) = send(&app.router, put_json("/batch", &payload)).await;
    assert_eq!(status, StatusCode::CREATED);
}

// ============================================================
// Single operations
// ============================================================

#[tokio::test]
async fn test_single_operations() {
    let app = app().await;

    let (status, body) = send(&app.router, get("/communities/100")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": 100, "name": "taken"}));

    let (status, body) = send(&app.router, get("/communities/7")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errors"][0]["code"], codes::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        put_json("/communities/7", &json!({"name": "seven"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let patch = Request::builder()
        .method("PATCH")
        .uri("/communities/7")
        .header("content-type", "application/json")
        .header("x-principal", "alice")
        .body(Body::from(json!({"name": "renamed"}).to_string()))
        .unwrap();
    let (status, body) = send(&app.router, patch).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "renamed");

    let (status, body) = send(&app.router, get("/communities")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/communities/7")
        .header("x-principal", "alice")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.db.committed_rows("communities").len(), 1);
}

#[tokio::test]
async fn test_single_operation_on_unknown_resource() {
    let app = app().await;
    let (status, body) = send(&app.router, get("/widgets/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errors"][0]["code"], codes::NO_MATCHING_ROUTE);
}

// ============================================================
// PUT /batch_streaming
// ============================================================

async fn stream(router: &Router, payload: &Value) -> (StatusCode, String) {
    let response = router
        .clone()
        .oneshot(put_json("/batch_streaming", payload))
        .await
        .unwrap();
    let status = response.status();
    assert_eq!(response.headers()["content-type"], "application/json");
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_streaming_reports_failure_in_trailer() {
    let app = app().await;
    let payload = json!([
        [op("PUT", "/messages/1", json!({"community_id": 42, "text": "orphan"}))],
        [op("PUT", "/communities/1", json!({"name": "rust"}))],
    ]);

    let (status, text) = stream(&app.router, &payload).await;
    assert_eq!(status, StatusCode::OK);

    let elements: Vec<Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(elements.len(), 3);
    assert_eq!(elements[2], json!({"status": 409}));

    let mut seen: Vec<(u64, u64)> = elements[..2]
        .iter()
        .map(|e| (e["lane"].as_u64().unwrap(), e["status"].as_u64().unwrap()))
        .collect();
    seen.sort();
    assert_eq!(seen, vec![(0, 409), (1, 202)]);
    assert_eq!(elements[0]["verb"], "PUT");
}

#[tokio::test]
async fn test_streaming_success() {
    let app = app().await;
    let payload = json!([
        op("PUT", "/communities/1", json!({"name": "rust"})),
        read("/communities/100"),
    ]);

    let (status, text) = stream(&app.router, &payload).await;
    assert_eq!(status, StatusCode::OK);
    let elements: Vec<Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(elements.last().unwrap(), &json!({"status": 201}));
    assert_eq!(app.db.committed_rows("communities").len(), 2);
}

#[tokio::test]
async fn test_streaming_parse_error_is_a_lone_trailer() {
    let app = app().await;
    let payload = json!([{"href": "/communities/1"}]);

    let (status, text) = stream(&app.router, &payload).await;
    assert_eq!(status, StatusCode::OK);
    let elements: Vec<Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0]["status"], 400);
    assert_eq!(elements[0]["errors"][0]["code"], codes::NO_VERB);
}

/// Blocks the run at the persist gate long enough for heartbeats.
struct SlowPersist;

impl PhaseHook for SlowPersist {
    fn before_phase(&self, phase: Phase, _cohort: &mut Cohort) {
        if phase == Phase::Persist {
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_heartbeats_while_waiting() {
    let app = app_with(BatchSettings::default(), Some(Arc::new(SlowPersist))).await;
    let payload = json!([op("PUT", "/messages/1", json!({"community_id": 100}))]);

    let (status, text) = stream(&app.router, &payload).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.starts_with("[ "), "expected a heartbeat, got {text:?}");

    let elements: Vec<Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(elements.last().unwrap(), &json!({"status": 201}));
}
