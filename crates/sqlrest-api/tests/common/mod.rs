//! Shared test utilities for sqlrest API tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use sqlrest_api::http::{create_router, AppState};
use sqlrest_domain::{ResourceRegistry, ResourceSettings};
use sqlrest_server::BatchEngine;
use sqlrest_storage::{Database, MemoryDatabase, Row};

/// Header the test apps read the principal from.
pub const PRINCIPAL: &str = "x-principal";

/// Communities own messages; message writes need a principal.
pub fn resource_settings() -> Vec<ResourceSettings> {
    serde_json::from_value(json!([
        {
            "name": "communities",
            "columns": [
                {"name": "id", "type": "integer", "nullable": false},
                {"name": "name", "type": "text", "unique": true},
                {"name": "owner", "type": "text"}
            ],
            "hidden": ["owner"]
        },
        {
            "name": "messages",
            "columns": [
                {"name": "id", "type": "integer", "nullable": false},
                {"name": "community_id", "type": "integer",
                 "references": {"table": "communities", "column": "id"}},
                {"name": "text", "type": "text"}
            ],
            "write": "authenticated"
        }
    ]))
    .unwrap()
}

pub fn registry() -> ResourceRegistry {
    ResourceRegistry::from_settings(&resource_settings()).unwrap()
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

/// A migrated memory database holding community 100.
pub async fn seeded_database(registry: &ResourceRegistry) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.migrate(&registry.tables()).await.unwrap();
    db.seed(
        "communities",
        vec![row(json!({"id": 100, "name": "general", "owner": "root"}))],
    )
    .unwrap();
    db
}

/// Create a test app over `db`.
///
/// Each call creates a fresh `AppState`; clones of the database share rows.
pub fn create_test_app(db: &MemoryDatabase, registry: ResourceRegistry) -> Router {
    let engine = BatchEngine::new(Arc::new(db.clone()), Arc::new(registry));
    create_router(AppState::new(engine))
}

pub fn op(verb: &str, href: &str, body: Value) -> Value {
    json!({"verb": verb, "href": href, "body": body})
}

pub fn read(href: &str) -> Value {
    json!({"verb": "GET", "href": href})
}

/// PUT a JSON body as `principal`.
pub async fn put_json(
    app: &Router,
    uri: &str,
    body: &Value,
    principal: Option<&str>,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(principal) = principal {
        request = request.header(PRINCIPAL, principal);
    }
    send(app, request.body(Body::from(body.to_string())).unwrap()).await
}

pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

/// Reads a streamed batch to the end and parses it as one JSON array.
pub async fn put_streaming(app: &Router, body: &Value, principal: Option<&str>) -> Vec<Value> {
    let mut request = Request::builder()
        .method("PUT")
        .uri("/batch_streaming")
        .header("content-type", "application/json");
    if let Some(principal) = principal {
        request = request.header(PRINCIPAL, principal);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Status of every element of a flat batch response.
pub fn statuses(body: &Value) -> Vec<u64> {
    body.as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_u64().unwrap())
        .collect()
}

pub fn error_code(result: &Value) -> &str {
    result["body"]["errors"][0]["code"].as_str().unwrap_or("")
}
