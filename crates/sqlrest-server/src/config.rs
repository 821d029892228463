//! Configuration management for the sqlrest server.
//!
//! Configuration is layered:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! # Configuration Hierarchy
//!
//! Environment variables take precedence over config file values,
//! which take precedence over defaults.
//!
//! # Example
//!
//! ```ignore
//! use sqlrest_server::config::ServerConfig;
//!
//! // Load from file with env overrides
//! let config = ServerConfig::load("sqlrest.yaml")?;
//!
//! // Or load from environment only
//! let config = ServerConfig::from_env()?;
//! ```

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use sqlrest_domain::{ResourceRegistry, ResourceSettings};

use crate::handlers::batch::BatchSettings;

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsSettings,

    /// Batch engine settings
    #[serde(default)]
    pub batch: BatchConfig,

    /// Principal extraction settings
    #[serde(default)]
    pub auth: AuthSettings,

    /// Mounted resources
    #[serde(default)]
    pub resources: Vec<ResourceSettings>,
}

/// Server network settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (not applied to streaming batches)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum accepted request body size
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_body_limit() -> usize {
    4 * 1024 * 1024
}

/// Storage backend settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    /// Storage backend: "memory" or "postgres"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database connection URL (required if backend is "postgres")
    pub database_url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Per-statement timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            database_url: None,
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_query_timeout() -> u64 {
    30
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricsSettings {
    /// Enable metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Batch engine settings.
///
/// Environment overrides use the `SQLREST_BATCH__` prefix, e.g.
/// `SQLREST_BATCH__MULTI_ROW=false` turns off multi-row statements.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BatchConfig {
    /// Largest number of operations accepted in one batch.
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,

    /// Largest number of rows folded into one statement.
    #[serde(default = "default_max_group_rows")]
    pub max_group_rows: usize,

    /// Fold consecutive compatible writes into multi-row statements.
    #[serde(default = "default_true")]
    pub multi_row: bool,

    /// Silence after which the streaming endpoint writes a keep-alive.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_group_rows: default_max_group_rows(),
            multi_row: true,
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl BatchConfig {
    /// Engine settings derived from this section.
    pub fn engine_settings(&self) -> BatchSettings {
        BatchSettings {
            max_operations: self.max_operations,
            max_group_rows: self.max_group_rows,
            multi_row: self.multi_row,
            ..BatchSettings::default()
        }
    }
}

fn default_max_operations() -> usize {
    1000
}

fn default_max_group_rows() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    5000
}

/// Principal extraction settings. Credentials are verified upstream.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuthSettings {
    /// Header carrying the authenticated principal.
    #[serde(default = "default_principal_header")]
    pub principal_header: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            principal_header: default_principal_header(),
        }
    }
}

fn default_principal_header() -> String {
    "x-principal".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `SQLREST_` and use `__` as separator.
    /// For example:
    /// - `SQLREST_SERVER__PORT=9090` overrides `server.port`
    /// - `SQLREST_STORAGE__DATABASE_URL=...` overrides `storage.database_url`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            // SQLREST_SERVER__PORT -> server.port
            .add_source(
                Environment::with_prefix("SQLREST")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Load configuration from environment variables only.
    ///
    /// Uses default values and allows overrides via SQLREST_ prefixed env vars.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(
                Environment::with_prefix("SQLREST")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Builds the resource registry described by `resources`.
    pub fn registry(&self) -> Result<ResourceRegistry, ConfigLoadError> {
        ResourceRegistry::from_settings(&self.resources).map_err(|e| ConfigLoadError::Invalid {
            message: format!("resources: {e}"),
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.server.port == 0 {
            return Err(invalid("server.port must be greater than 0"));
        }
        if self.server.body_limit_bytes == 0 {
            return Err(invalid("server.body_limit_bytes must be greater than 0"));
        }

        let valid_backends = ["memory", "postgres"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(invalid(format!(
                "storage.backend must be one of: {:?}, got: {}",
                valid_backends, self.storage.backend
            )));
        }

        if self.storage.backend == "postgres"
            && self
                .storage
                .database_url
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            return Err(invalid(
                "storage.database_url is required when backend is 'postgres'",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "logging.level must be one of: {:?}, got: {}",
                valid_levels, self.logging.level
            )));
        }

        if self.batch.max_operations == 0 {
            return Err(invalid("batch.max_operations must be greater than 0"));
        }
        if self.batch.max_group_rows == 0 {
            return Err(invalid("batch.max_group_rows must be greater than 0"));
        }
        if self.batch.heartbeat_interval_ms == 0 {
            return Err(invalid("batch.heartbeat_interval_ms must be greater than 0"));
        }

        if self.auth.principal_header.trim().is_empty() {
            return Err(invalid("auth.principal_header cannot be empty"));
        }

        self.registry()?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::Invalid {
        message: message.into(),
    }
}
