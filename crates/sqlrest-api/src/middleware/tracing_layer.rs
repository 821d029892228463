//! Per-request tracing spans.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{debug, field::Empty, info_span, Instrument, Span};

use super::REQUEST_ID_HEADER;

/// How a batch request ended, attached to its response by the batch route.
///
/// [`TracingLayer`] copies it onto the request span, so the span that
/// closes a batch request carries the batch's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Aggregate status of the batch.
    pub status: u16,
    pub committed: bool,
    pub operations: usize,
}

/// Layer that runs each request inside an `http_request` span.
///
/// Batch runs started by the request nest their `batch_run` span under it,
/// so engine logs carry the request ID. Batch responses additionally record
/// `batch.status`, `batch.committed` and `batch.operations`.
#[derive(Clone, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService { inner }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TracingService<S>
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
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let span = info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            http.status_code = Empty,
            batch.status = Empty,
            batch.committed = Empty,
            batch.operations = Empty,
        );

        let mut inner = self.inner.clone();
        Box::pin(
            async move {
                let response = inner.call(request).await?;
                let span = Span::current();
                span.record("http.status_code", response.status().as_u16());
                if let Some(summary) = response.extensions().get::<BatchSummary>() {
                    span.record("batch.status", summary.status);
                    span.record("batch.committed", summary.committed);
                    span.record("batch.operations", summary.operations as u64);
                    debug!("batch request answered");
                }
                Ok(response)
            }
            .instrument(span),
        )
    }
}
