//! sqlrest-storage: Storage abstraction layer
//!
//! This crate provides the storage abstraction for sqlrest, including:
//! - Database and Transaction traits with multi-row statements
//! - In-memory implementation for testing
//! - PostgreSQL implementation for production
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  sqlrest-storage                  │
//! ├──────────────────────────────────────────────────┤
//! │  schema.rs   - Table schemas, rows, identifiers   │
//! │  traits.rs   - Database / Transaction traits      │
//! │  memory.rs   - In-memory implementation           │
//! │  postgres.rs - PostgreSQL implementation          │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod traits;

// Re-export commonly used types
pub use error::{ConstraintKind, StorageError, StorageResult};
pub use memory::MemoryDatabase;
pub use postgres::{PostgresConfig, PostgresDatabase};
pub use schema::{ColumnDef, ColumnType, ForeignKey, Row, TableSchema};
pub use traits::{Database, HealthStatus, MultiRowStatement, MutationKind, Transaction};
