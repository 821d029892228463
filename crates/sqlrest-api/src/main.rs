//! sqlrest server binary
//!
//! Serves declared SQL tables as REST resources with transactional batches.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! sqlrest --config config.yaml
//!
//! # With environment variables only
//! SQLREST_STORAGE__BACKEND=memory sqlrest
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use sqlrest_api::http::{create_router_with_observability, AppState, RouterOptions};
use sqlrest_api::middleware::RequestMetrics;
use sqlrest_api::observability::{init_logging, init_metrics, parse_log_level, LoggingConfig};
use sqlrest_server::{BatchEngine, ServerConfig};
use sqlrest_storage::{Database, MemoryDatabase, PostgresConfig, PostgresDatabase};

/// sqlrest - declarative REST over SQL with transactional batches
#[derive(Parser, Debug)]
#[command(name = "sqlrest")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Both loaders validate.
    let config = if let Some(config_path) = args.config {
        ServerConfig::load(&config_path)?
    } else {
        ServerConfig::from_env()?
    };

    init_logging(LoggingConfig {
        json_format: config.logging.json,
        default_level: parse_log_level(&config.logging.level),
        include_spans: false,
    });

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sqlrest server");

    let metrics_state = if config.metrics.enabled {
        let state = init_metrics()?;
        info!(path = %config.metrics.path, "Metrics enabled");
        Some(state)
    } else {
        None
    };

    let registry = Arc::new(config.registry()?);
    let database = connect(&config).await?;

    info!(tables = registry.len(), "Running table migrations");
    database.migrate(&registry.tables()).await?;
    info!("Table migrations complete");

    let engine = BatchEngine::builder(database, registry)
        .settings(config.batch.engine_settings())
        .build();
    let state = AppState::from_config(engine, &config);
    let router = create_router_with_observability(
        state,
        metrics_state,
        Arc::new(RequestMetrics::new()),
        &RouterOptions::from_config(&config),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    run_http_server(router, addr).await
}

/// Opens the configured storage backend.
async fn connect(config: &ServerConfig) -> anyhow::Result<Arc<dyn Database>> {
    match config.storage.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage backend; data is lost on exit");
            Ok(Arc::new(MemoryDatabase::new()))
        }
        "postgres" => {
            let database_url = config.storage.database_url.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.database_url is required for postgres backend")
            })?;

            info!("Connecting to PostgreSQL database");
            let pg_config = PostgresConfig {
                database_url: database_url.clone(),
                max_connections: config.storage.pool_size,
                min_connections: 1,
                connect_timeout_secs: config.storage.connection_timeout_secs,
                query_timeout_secs: config.storage.query_timeout_secs,
                ..Default::default()
            };
            let database = PostgresDatabase::from_config(&pg_config).await?;
            info!("PostgreSQL connection established");
            Ok(Arc::new(database))
        }
        other => {
            error!("Unknown storage backend: {}", other);
            anyhow::bail!("Unknown storage backend: {}", other);
        }
    }
}

/// Run the HTTP server until a shutdown signal arrives.
///
/// In-flight batches finish before the process exits.
async fn run_http_server(router: axum::Router, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
