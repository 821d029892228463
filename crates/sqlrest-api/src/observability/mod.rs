//! Observability setup for the sqlrest binary.
//!
//! This module provides:
//! - Structured logging configuration
//! - The Prometheus recorder and `/metrics` handler

mod logging;
mod metrics;

pub use logging::{create_json_layer, init_logging, parse_log_level, LoggingConfig};
pub use metrics::{init_metrics, metrics_handler, MetricsError, MetricsState};
