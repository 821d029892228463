//! HTTP route definitions and handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::error;

use sqlrest_domain::OperationDescriptor;
use sqlrest_server::{BatchPlan, ServerConfig};

use super::error::{ApiError, ApiResult, JsonBadRequest};
use super::state::AppState;
use super::streaming::batch_streaming;
use crate::middleware::{
    cors_layer, BatchSummary, MetricsLayer, RequestIdLayer, RequestLoggingLayer, RequestMetrics,
    TracingLayer,
};
use crate::observability::{metrics_handler, MetricsState};

/// Default request body size limit (4 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Router knobs taken from the `server` and `metrics` configuration.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub body_limit: usize,
    /// Applies to the response head only; streamed bodies are not cut off.
    pub request_timeout: Option<Duration>,
    pub metrics_path: String,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            body_limit: DEFAULT_BODY_LIMIT,
            request_timeout: None,
            metrics_path: "/metrics".to_string(),
        }
    }
}

impl RouterOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            body_limit: config.server.body_limit_bytes,
            request_timeout: Some(Duration::from_secs(config.server.request_timeout_secs))
                .filter(|t| !t.is_zero()),
            metrics_path: config.metrics.path.clone(),
        }
    }
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/batch", put(batch))
        .route("/batch_streaming", put(batch_streaming))
        .route("/:resource", get(list_resource))
        .route("/:resource/batch", put(resource_batch))
        .route(
            "/:resource/:id",
            get(get_resource)
                .put(put_resource)
                .patch(patch_resource)
                .delete(delete_resource),
        )
        .route("/ready", get(readiness_check))
}

/// The API routes with the default body limit and no middleware.
pub fn create_router(state: AppState) -> Router {
    create_router_with_body_limit(state, DEFAULT_BODY_LIMIT)
}

pub fn create_router_with_body_limit(state: AppState, body_limit: usize) -> Router {
    api_routes()
        .route("/health", get(health_check))
        .with_state(Arc::new(state))
        .layer(RequestBodyLimitLayer::new(body_limit))
}

/// The full application: API routes, `/health`, `/metrics` when a
/// recorder is given, and the middleware stack.
pub fn create_router_with_observability(
    state: AppState,
    metrics_state: Option<MetricsState>,
    request_metrics: Arc<RequestMetrics>,
    options: &RouterOptions,
) -> Router {
    let mut api_router = api_routes()
        .with_state(Arc::new(state))
        .layer(RequestBodyLimitLayer::new(options.body_limit));
    if let Some(timeout) = options.request_timeout {
        api_router = api_router.layer(TimeoutLayer::new(timeout));
    }

    let mut observability_router = Router::new().route("/health", get(health_check));
    if let Some(metrics_state) = metrics_state {
        observability_router = observability_router.merge(
            Router::new()
                .route(&options.metrics_path, get(metrics_handler))
                .with_state(metrics_state),
        );
    }

    // The last layer added runs first.
    api_router
        .merge(observability_router)
        .layer(RequestLoggingLayer::new())
        .layer(TracingLayer::new())
        .layer(MetricsLayer::new(request_metrics))
        .layer(RequestIdLayer::new())
        .layer(cors_layer())
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

// ============================================================
// Batches
// ============================================================

async fn batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    JsonBadRequest(payload): JsonBadRequest<Value>,
) -> ApiResult<Response> {
    run_batch(&state, &headers, &payload, None).await
}

async fn resource_batch(
    State(state): State<Arc<AppState>>,
    Path(resource): Path<String>,
    headers: HeaderMap,
    JsonBadRequest(payload): JsonBadRequest<Value>,
) -> ApiResult<Response> {
    run_batch(&state, &headers, &payload, Some(&resource)).await
}

async fn run_batch(
    state: &AppState,
    headers: &HeaderMap,
    payload: &Value,
    boundary: Option<&str>,
) -> ApiResult<Response> {
    let outcome = state
        .engine
        .run(payload, boundary, state.principal(headers))
        .await?;
    let summary = BatchSummary {
        status: outcome.status,
        committed: outcome.committed,
        operations: outcome.results().count(),
    };
    let mut response = (status_code(outcome.status), Json(outcome.to_json())).into_response();
    response.extensions_mut().insert(summary);
    Ok(response)
}

// ============================================================
// Single operations
// ============================================================

async fn list_resource(
    State(state): State<Arc<AppState>>,
    Path(resource): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    single(&state, &headers, OperationDescriptor::get(format!("/{resource}"))).await
}

async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    single(&state, &headers, OperationDescriptor::get(format!("/{resource}/{id}"))).await
}

async fn put_resource(
    State(state): State<Arc<AppState>>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
    JsonBadRequest(body): JsonBadRequest<Value>,
) -> ApiResult<Response> {
    let descriptor = OperationDescriptor::put(format!("/{resource}/{id}"), body);
    single(&state, &headers, descriptor).await
}

async fn patch_resource(
    State(state): State<Arc<AppState>>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
    JsonBadRequest(body): JsonBadRequest<Value>,
) -> ApiResult<Response> {
    let descriptor = OperationDescriptor::patch(format!("/{resource}/{id}"), body);
    single(&state, &headers, descriptor).await
}

async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    single(&state, &headers, OperationDescriptor::delete(format!("/{resource}/{id}"))).await
}

/// Runs one operation as a batch of one and answers with its own status
/// and body.
async fn single(
    state: &AppState,
    headers: &HeaderMap,
    descriptor: OperationDescriptor,
) -> ApiResult<Response> {
    let plan = BatchPlan::flat(vec![descriptor]);
    state.engine.check(&plan)?;
    let outcome = state
        .engine
        .execute(plan, state.principal(headers))
        .await?;
    let result = outcome
        .results()
        .next()
        .ok_or_else(|| ApiError::internal("operation produced no result"))?;
    Ok((status_code(result.status), Json(result.body.clone())).into_response())
}

// ============================================================
// Health and Readiness Checks
// ============================================================

/// Liveness: the process is up. Does not touch the database.
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Readiness: the database answers a health check.
///
/// Failure details are logged, not returned.
async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = state.engine.database();
    let reason = match database.health_check().await {
        Ok(status) if status.healthy => None,
        Ok(status) => Some(status.message.unwrap_or_else(|| "unhealthy".to_string())),
        Err(err) => Some(err.to_string()),
    };
    match reason {
        None => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "database": "ok" }
            })),
        ),
        Some(reason) => {
            error!(backend = database.backend_name(), %reason, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not_ready",
                    "checks": { "database": "unavailable" }
                })),
            )
        }
    }
}
