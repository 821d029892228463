//! HTTP middleware.
//!
//! Includes:
//! - Request ID generation and propagation
//! - Request logging
//! - Metrics collection
//! - Request tracing spans, with the outcome of batch requests
//! - CORS configuration

mod logging;
mod metrics;
mod request_id;
mod tracing_layer;

pub use logging::RequestLoggingLayer;
pub use metrics::{MetricsLayer, RequestMetrics};
pub use request_id::{RequestIdLayer, MAX_REQUEST_ID_LEN, REQUEST_ID_HEADER};
pub use tracing_layer::{BatchSummary, TracingLayer};

use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS: any origin, method and header.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}
