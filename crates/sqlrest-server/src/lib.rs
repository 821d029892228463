//! sqlrest-server: Configuration and the batch engine
//!
//! This crate contains the execution layer including:
//! - Layered configuration (defaults, YAML, environment)
//! - The batch engine: tree building, phase gates, conflict groups,
//!   cancellation, transaction handling and status aggregation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  sqlrest-server                   │
//! ├──────────────────────────────────────────────────┤
//! │  config.rs  - Configuration management            │
//! │  handlers/                                        │
//! │    batch/   - Transactional batch engine          │
//! │      tree.rs        - Payload to lanes            │
//! │      barrier.rs     - Phase gates                 │
//! │      conflict.rs    - Multi-row statements        │
//! │      transaction.rs - Commit / rollback scopes    │
//! │      handler.rs     - Batch runs                  │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod handlers;

// Re-exports for convenience
pub use config::{ConfigLoadError, ServerConfig};
pub use handlers::batch::{
    BatchEngine, BatchError, BatchEvent, BatchOutcome, BatchPlan, BatchSettings, PhaseHook,
};
