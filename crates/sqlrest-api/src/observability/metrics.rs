//! Prometheus metrics.
//!
//! # Metrics Exposed
//!
//! - `sqlrest_http_requests_total` / `sqlrest_http_request_duration_seconds`
//! - `sqlrest_batch_runs_total` - Batch runs by outcome (committed, rolled_back)
//! - `sqlrest_batch_operations_total` - Finished operations by status
//! - `sqlrest_batch_duration_seconds` - Batch run duration
//! - `sqlrest_conflict_group_failures_total` - Rejected multi-row statements by kind
//! - `sqlrest_phase_hook_invocations_total` - Global phase hook calls
//! - `sqlrest_storage_query_duration_seconds` - Statement latency by operation and status
//! - `sqlrest_storage_query_timeout_total` - Statements that hit the query timeout
//! - `sqlrest_storage_pool_connections` - Pool connections by state

use std::sync::Arc;

use axum::{extract::State, http::header::CONTENT_TYPE, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Renders the installed recorder.
#[derive(Clone)]
pub struct MetricsState {
    handle: Arc<PrometheusHandle>,
}

impl MetricsState {
    pub fn new(handle: PrometheusHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus recorder: recorder already installed")]
    AlreadyInstalled,
}

/// Installs the global Prometheus recorder. Call once at startup.
pub fn init_metrics() -> Result<MetricsState, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|_| MetricsError::AlreadyInstalled)?;
    describe_metrics();
    Ok(MetricsState::new(handle))
}

fn describe_metrics() {
    metrics::describe_counter!("sqlrest_http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "sqlrest_http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    metrics::describe_counter!("sqlrest_batch_runs_total", "Batch runs by outcome");
    metrics::describe_counter!(
        "sqlrest_batch_operations_total",
        "Batch operations by final status"
    );
    metrics::describe_histogram!(
        "sqlrest_batch_duration_seconds",
        "Batch run duration in seconds"
    );
    metrics::describe_counter!(
        "sqlrest_conflict_group_failures_total",
        "Multi-row statements rejected by the database"
    );
    metrics::describe_counter!(
        "sqlrest_phase_hook_invocations_total",
        "Global phase hook invocations"
    );
    metrics::describe_histogram!(
        "sqlrest_storage_query_duration_seconds",
        "Storage statement duration in seconds by operation, backend and status"
    );
    metrics::describe_counter!(
        "sqlrest_storage_query_timeout_total",
        "Storage statements that exceeded the query timeout"
    );
    metrics::describe_histogram!(
        "sqlrest_storage_health_check_duration_seconds",
        "Storage health check duration in seconds"
    );
    metrics::describe_gauge!(
        "sqlrest_storage_pool_connections",
        "Database pool connections by state (active, idle)"
    );
}

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Handler for `/metrics`.
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], state.render())
}
