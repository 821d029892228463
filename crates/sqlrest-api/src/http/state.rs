//! Application state for HTTP handlers.

use std::time::Duration;

use axum::http::HeaderMap;

use sqlrest_server::{BatchEngine, ServerConfig};

/// Header carrying the caller's principal unless configured otherwise.
pub const DEFAULT_PRINCIPAL_HEADER: &str = "x-principal";

/// Default gap before the streaming gateway writes a keep-alive.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: BatchEngine,
    /// Lowercase header name the principal is read from.
    pub principal_header: String,
    pub heartbeat: Duration,
}

impl AppState {
    pub fn new(engine: BatchEngine) -> Self {
        Self {
            engine,
            principal_header: DEFAULT_PRINCIPAL_HEADER.to_string(),
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn from_config(engine: BatchEngine, config: &ServerConfig) -> Self {
        Self::new(engine)
            .with_principal_header(&config.auth.principal_header)
            .with_heartbeat(Duration::from_millis(config.batch.heartbeat_interval_ms))
    }

    pub fn with_principal_header(mut self, header: &str) -> Self {
        self.principal_header = header.trim().to_ascii_lowercase();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// The caller's principal. The header is trusted as-is; verifying it is
    /// left to whatever sits in front of the server.
    pub fn principal(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.principal_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}
