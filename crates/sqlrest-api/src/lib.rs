//! sqlrest-api: HTTP API layer
//!
//! This crate provides the API layer including:
//! - The batch, streaming batch and single-resource endpoints via Axum
//! - Middleware (request id, logging, metrics, tracing, CORS)
//! - Logging and Prometheus setup used by the `sqlrest` binary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 sqlrest-api                  │
//! ├─────────────────────────────────────────────┤
//! │  http/          - REST endpoints, streaming  │
//! │  middleware/    - Request id, logs, metrics  │
//! │  observability/ - Logging and Prometheus     │
//! └─────────────────────────────────────────────┘
//! ```

pub mod http;
pub mod middleware;
pub mod observability;
