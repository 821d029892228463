//! Database and Transaction trait definitions.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::schema::{Row, TableSchema};

/// The kind of row mutation a statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One SQL statement mutating any number of rows of a single table.
///
/// Insert and update rows carry every column of the table; delete rows only
/// need the key column. Update rows of one statement must name the same
/// columns: a column missing from a row would otherwise be nulled by the SQL
/// backend but left alone by the in-memory one.
#[derive(Debug, Clone)]
pub struct MultiRowStatement {
    pub table: TableSchema,
    pub kind: MutationKind,
    pub rows: Vec<Row>,
}

impl MultiRowStatement {
    pub fn new(table: TableSchema, kind: MutationKind, rows: Vec<Row>) -> Self {
        Self { table, kind, rows }
    }

    /// Checks the invariants every backend relies on.
    pub fn validate(&self) -> StorageResult<()> {
        if self.rows.is_empty() {
            return Err(StorageError::InvalidInput {
                message: format!("empty {} statement on {}", self.kind, self.table.name),
            });
        }
        for row in &self.rows {
            self.table.key_of(row)?;
            if self.kind == MutationKind::Delete {
                continue;
            }
            if self.kind == MutationKind::Update && !same_columns(&self.rows[0], row) {
                return Err(StorageError::InvalidInput {
                    message: format!(
                        "update rows for table '{}' set different columns",
                        self.table.name
                    ),
                });
            }
            for column in row.keys() {
                if self.table.column(column).is_none() {
                    return Err(StorageError::InvalidInput {
                        message: format!(
                            "unknown column '{}' for table '{}'",
                            column, self.table.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Key values of every row, in row order.
    pub fn keys(&self) -> StorageResult<Vec<&Value>> {
        self.rows.iter().map(|r| self.table.key_of(r)).collect()
    }
}

fn same_columns(a: &Row, b: &Row) -> bool {
    a.len() == b.len() && a.keys().all(|column| b.contains_key(column))
}

/// Health check status for a database backend.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency: Duration,
    pub message: Option<String>,
}

/// A database that hands out transactions.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Opens a new transaction.
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Ensures the given tables exist.
    async fn migrate(&self, tables: &[TableSchema]) -> StorageResult<()>;

    /// Checks connectivity.
    async fn health_check(&self) -> StorageResult<HealthStatus>;
}

/// A live database transaction.
///
/// Statements are atomic individually: when `execute` fails, none of that
/// statement's rows are applied and the transaction remains usable.
/// `commit` and `rollback` finish the transaction; calling either a second
/// time returns `StorageError::TransactionError`.
#[async_trait]
pub trait Transaction: Send {
    /// Fetches one row by key.
    async fn fetch(&mut self, table: &TableSchema, key: &Value) -> StorageResult<Option<Row>>;

    /// Fetches up to `limit` rows ordered by key.
    async fn fetch_all(&mut self, table: &TableSchema, limit: usize) -> StorageResult<Vec<Row>>;

    /// Executes a multi-row statement, returning the number of affected rows.
    async fn execute(&mut self, statement: &MultiRowStatement) -> StorageResult<u64>;

    /// Opens a nested scope.
    async fn savepoint(&mut self, name: &str) -> StorageResult<()>;

    /// Undoes everything since the named savepoint and closes it.
    async fn rollback_to_savepoint(&mut self, name: &str) -> StorageResult<()>;

    /// Keeps everything since the named savepoint and closes it.
    async fn release_savepoint(&mut self, name: &str) -> StorageResult<()>;

    async fn commit(&mut self) -> StorageResult<()>;

    async fn rollback(&mut self) -> StorageResult<()>;

    /// True once `commit` or `rollback` has been called.
    fn is_finished(&self) -> bool;
}

pub(crate) fn already_finished() -> StorageError {
    StorageError::TransactionError {
        message: "transaction already finished".to_string(),
    }
}
