//! Metrics collection middleware.
//!
//! # Metrics Emitted
//!
//! - `sqlrest_http_requests_total` - Counter with labels: method, path, status_class
//! - `sqlrest_http_request_duration_seconds` - Histogram with the same labels
//!
//! Batch endpoints report their aggregate status here; per-operation
//! outcomes are counted by the engine.

use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    extract::MatchedPath,
    http::{Request, Response},
};
use tower::{Layer, Service};

/// Request counters, mirrored into the `metrics` facade.
///
/// The atomics let tests read counts back without a recorder installed.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    request_count: AtomicU64,
    total_duration_us: AtomicU64,
    success_count: AtomicU64,
    client_error_count: AtomicU64,
    server_error_count: AtomicU64,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one request. `path` should be the matched route pattern.
    pub fn record(&self, method: &str, path: &str, status: u16, duration_us: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_us
            .fetch_add(duration_us, Ordering::Relaxed);

        let status_class = match status {
            200..=299 => {
                self.success_count.fetch_add(1, Ordering::Relaxed);
                "2xx"
            }
            400..=499 => {
                self.client_error_count.fetch_add(1, Ordering::Relaxed);
                "4xx"
            }
            500..=599 => {
                self.server_error_count.fetch_add(1, Ordering::Relaxed);
                "5xx"
            }
            _ => "other",
        };

        let labels = [
            ("method", method.to_string()),
            ("path", path.to_string()),
            ("status_class", status_class.to_string()),
        ];
        metrics::counter!("sqlrest_http_requests_total", &labels).increment(1);
        metrics::histogram!("sqlrest_http_request_duration_seconds", &labels)
            .record(duration_us as f64 / 1_000_000.0);
    }

    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn get_success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn get_client_error_count(&self) -> u64 {
        self.client_error_count.load(Ordering::Relaxed)
    }

    pub fn get_server_error_count(&self) -> u64 {
        self.server_error_count.load(Ordering::Relaxed)
    }

    pub fn get_total_duration_us(&self) -> u64 {
        self.total_duration_us.load(Ordering::Relaxed)
    }
}

/// Layer that records [`RequestMetrics`] for every request.
#[derive(Clone)]
pub struct MetricsLayer {
    metrics: Arc<RequestMetrics>,
}

impl MetricsLayer {
    pub fn new(metrics: Arc<RequestMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> Arc<RequestMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<RequestMetrics>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let start = Instant::now();
        let method = request.method().to_string();
        // Route patterns keep label cardinality bounded; unmatched requests
        // fall back to a fixed label.
        let path = request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "unmatched".to_string());
        let metrics = Arc::clone(&self.metrics);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(request).await?;
            metrics.record(
                &method,
                &path,
                response.status().as_u16(),
                start.elapsed().as_micros() as u64,
            );
            Ok(response)
        })
    }
}
