//! In-memory storage implementation for testing and local development.
//!
//! Transactions are serialized: `begin` takes a writer lock that is held until
//! the transaction commits or rolls back, and each transaction works on a
//! private copy of the tables. This gives the same visibility a serializable
//! SQL transaction would, at the cost of concurrency.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::error::{ConstraintKind, StorageError, StorageResult};
use crate::schema::{key_string, Row, TableSchema};
use crate::traits::{
    already_finished, Database, HealthStatus, MultiRowStatement, MutationKind, Transaction,
};

type TableData = BTreeMap<String, Row>;
type Tables = HashMap<String, TableData>;

#[derive(Debug, Default)]
struct MemoryInner {
    schemas: DashMap<String, TableSchema>,
    tables: DashMap<String, TableData>,
    writer: Arc<Mutex<()>>,
    unavailable: AtomicBool,
    /// Tables whose statements fail with a query error (fault injection).
    failing_tables: DashMap<String, String>,
}

/// In-memory implementation of [`Database`].
///
/// Enforces primary key, unique, not-null and foreign key constraints
/// (including restrict-on-delete) per statement.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryInner>,
}

impl MemoryDatabase {
    /// Creates a new in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory database wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Committed rows of a table, ordered by key.
    pub fn committed_rows(&self, table: &str) -> Vec<Row> {
        let Some(data) = self.inner.tables.get(table) else {
            return Vec::new();
        };
        let mut rows: Vec<Row> = data.values().cloned().collect();
        if let Some(schema) = self.inner.schemas.get(table) {
            sort_by_key(&schema, &mut rows);
        }
        rows
    }

    /// Inserts committed rows directly, bypassing transactions and constraints.
    pub fn seed(&self, table: &str, rows: Vec<Row>) -> StorageResult<()> {
        let schema = self
            .inner
            .schemas
            .get(table)
            .map(|s| s.clone())
            .ok_or_else(|| StorageError::TableNotFound {
                table: table.to_string(),
            })?;
        let mut data = self.inner.tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = key_string(schema.key_of(&row)?);
            data.insert(key, complete_row(&schema, row));
        }
        Ok(())
    }

    /// Makes `begin` and `health_check` fail as if the server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner
            .unavailable
            .store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Makes every statement against `table` fail with a query error.
    pub fn fail_statements_on(&self, table: &str, message: &str) {
        self.inner
            .failing_tables
            .insert(table.to_string(), message.to_string());
    }

    /// Removes all injected statement failures.
    pub fn clear_failures(&self) {
        self.inner.failing_tables.clear();
    }

    fn is_unavailable(&self) -> bool {
        self.inner.unavailable.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        if self.is_unavailable() {
            return Err(StorageError::ConnectionError {
                message: "memory database marked unavailable".to_string(),
            });
        }
        let guard = Arc::clone(&self.inner.writer).lock_owned().await;
        let working: Tables = self
            .inner
            .tables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            working,
            savepoints: Vec::new(),
            guard: Some(guard),
        }))
    }

    async fn migrate(&self, tables: &[TableSchema]) -> StorageResult<()> {
        for schema in tables {
            schema.validate()?;
        }
        for schema in tables {
            for column in &schema.columns {
                if let Some(fk) = &column.references {
                    let known = tables.iter().any(|t| t.name == fk.table)
                        || self.inner.schemas.contains_key(&fk.table);
                    if !known {
                        return Err(StorageError::InvalidInput {
                            message: format!(
                                "column '{}.{}' references unknown table '{}'",
                                schema.name, column.name, fk.table
                            ),
                        });
                    }
                }
            }
        }
        for schema in tables {
            self.inner
                .schemas
                .insert(schema.name.clone(), schema.clone());
            self.inner.tables.entry(schema.name.clone()).or_default();
            debug!(table = %schema.name, "registered in-memory table");
        }
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let start = Instant::now();
        if self.is_unavailable() {
            return Err(StorageError::HealthCheckFailed {
                message: "memory database marked unavailable".to_string(),
            });
        }
        Ok(HealthStatus {
            healthy: true,
            latency: start.elapsed(),
            message: Some("in-memory database".to_string()),
        })
    }
}

/// A transaction over a private copy of the tables.
pub struct MemoryTransaction {
    inner: Arc<MemoryInner>,
    working: Tables,
    savepoints: Vec<(String, Tables)>,
    /// Writer lock; `None` once finished.
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.guard.is_none() {
            return Err(already_finished());
        }
        Ok(())
    }

    fn schema(&self, table: &str) -> StorageResult<TableSchema> {
        self.inner
            .schemas
            .get(table)
            .map(|s| s.clone())
            .ok_or_else(|| StorageError::TableNotFound {
                table: table.to_string(),
            })
    }

    fn savepoint_index(&self, name: &str) -> StorageResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StorageError::TransactionError {
                message: format!("savepoint '{name}' does not exist"),
            })
    }

    /// Applies a statement to a copy of the target table and checks constraints.
    fn apply(&self, schema: &TableSchema, statement: &MultiRowStatement) -> StorageResult<(TableData, u64)> {
        let mut table = self.working.get(&schema.name).cloned().unwrap_or_default();
        let mut affected = 0u64;
        let mut touched: Vec<String> = Vec::with_capacity(statement.rows.len());
        let mut removed: Vec<Row> = Vec::new();

        for row in &statement.rows {
            let key = key_string(schema.key_of(row)?);
            match statement.kind {
                MutationKind::Insert => {
                    if table.contains_key(&key) {
                        return Err(StorageError::constraint(
                            ConstraintKind::Unique,
                            format!("{}_pkey", schema.name),
                            format!("duplicate key ({})=({})", schema.key, key),
                        ));
                    }
                    table.insert(key.clone(), complete_row(schema, row.clone()));
                    touched.push(key);
                    affected += 1;
                }
                MutationKind::Update => {
                    if let Some(existing) = table.get_mut(&key) {
                        for (column, value) in row {
                            existing.insert(column.clone(), value.clone());
                        }
                        touched.push(key);
                        affected += 1;
                    }
                }
                MutationKind::Delete => {
                    if let Some(old) = table.remove(&key) {
                        removed.push(old);
                        affected += 1;
                    }
                }
            }
        }

        for key in &touched {
            if let Some(row) = table.get(key) {
                self.check_row(schema, row, &table)?;
            }
        }
        check_unique(schema, &table)?;
        if !removed.is_empty() {
            self.check_restrict(schema, &removed, &table)?;
        }
        Ok((table, affected))
    }

    fn check_row(&self, schema: &TableSchema, row: &Row, own: &TableData) -> StorageResult<()> {
        for column in &schema.columns {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if !column.nullable || column.name == schema.key {
                    return Err(StorageError::constraint(
                        ConstraintKind::NotNull,
                        format!("{}_{}_not_null", schema.name, column.name),
                        format!("null value in column '{}'", column.name),
                    ));
                }
                continue;
            }
            if !column.ty.accepts(value) {
                return Err(StorageError::QueryError {
                    message: format!(
                        "invalid value for column '{}' of type {}",
                        column.name,
                        column.ty.sql_type()
                    ),
                });
            }
            if let Some(fk) = &column.references {
                let target = if fk.table == schema.name {
                    Some(own)
                } else {
                    self.working.get(&fk.table)
                };
                let exists = target
                    .map(|rows| contains_value(&self.inner, &fk.table, rows, &fk.column, value))
                    .unwrap_or(false);
                if !exists {
                    return Err(StorageError::constraint(
                        ConstraintKind::ForeignKey,
                        format!("{}_{}_fkey", schema.name, column.name),
                        format!(
                            "key ({})=({}) is not present in table \"{}\"",
                            column.name,
                            key_string(value),
                            fk.table
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Rejects deletes of rows that other rows still reference.
    fn check_restrict(
        &self,
        schema: &TableSchema,
        removed: &[Row],
        own: &TableData,
    ) -> StorageResult<()> {
        for other in self.inner.schemas.iter() {
            for column in &other.columns {
                let Some(fk) = &column.references else {
                    continue;
                };
                if fk.table != schema.name {
                    continue;
                }
                let rows = if other.name == schema.name {
                    Some(own)
                } else {
                    self.working.get(&other.name)
                };
                let Some(rows) = rows else {
                    continue;
                };
                for old in removed {
                    let Some(value) = old.get(&fk.column).filter(|v| !v.is_null()) else {
                        continue;
                    };
                    if rows.values().any(|r| r.get(&column.name) == Some(value)) {
                        return Err(StorageError::constraint(
                            ConstraintKind::ForeignKey,
                            format!("{}_{}_fkey", other.name, column.name),
                            format!(
                                "key ({})=({}) is still referenced from table \"{}\"",
                                fk.column,
                                key_string(value),
                                other.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn fetch(&mut self, table: &TableSchema, key: &Value) -> StorageResult<Option<Row>> {
        self.ensure_open()?;
        let rows = self
            .working
            .get(&table.name)
            .ok_or_else(|| StorageError::TableNotFound {
                table: table.name.clone(),
            })?;
        Ok(rows.get(&key_string(key)).cloned())
    }

    async fn fetch_all(&mut self, table: &TableSchema, limit: usize) -> StorageResult<Vec<Row>> {
        self.ensure_open()?;
        let rows = self
            .working
            .get(&table.name)
            .ok_or_else(|| StorageError::TableNotFound {
                table: table.name.clone(),
            })?;
        let mut rows: Vec<Row> = rows.values().cloned().collect();
        sort_by_key(table, &mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    #[instrument(skip(self, statement), fields(table = %statement.table.name, kind = %statement.kind, rows = statement.rows.len()))]
    async fn execute(&mut self, statement: &MultiRowStatement) -> StorageResult<u64> {
        self.ensure_open()?;
        if let Some(message) = self.inner.failing_tables.get(&statement.table.name) {
            return Err(StorageError::QueryError {
                message: message.clone(),
            });
        }
        statement.validate()?;
        let schema = self.schema(&statement.table.name)?;
        let (table, affected) = self.apply(&schema, statement)?;
        self.working.insert(schema.name.clone(), table);
        Ok(affected)
    }

    async fn savepoint(&mut self, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.savepoints
            .push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let index = self.savepoint_index(name)?;
        let (_, snapshot) = self.savepoints.swap_remove(index);
        self.savepoints.truncate(index);
        self.working = snapshot;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let index = self.savepoint_index(name)?;
        self.savepoints.truncate(index);
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        let guard = self.guard.take().ok_or_else(already_finished)?;
        for (name, rows) in self.working.drain() {
            self.inner.tables.insert(name, rows);
        }
        self.savepoints.clear();
        drop(guard);
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let guard = self.guard.take().ok_or_else(already_finished)?;
        self.working.clear();
        self.savepoints.clear();
        drop(guard);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.guard.is_none()
    }
}

/// Fills columns missing from an inserted row with null.
fn complete_row(schema: &TableSchema, mut row: Row) -> Row {
    for column in &schema.columns {
        row.entry(column.name.clone()).or_insert(Value::Null);
    }
    row
}

fn check_unique(schema: &TableSchema, table: &TableData) -> StorageResult<()> {
    for column in schema.columns.iter().filter(|c| c.unique) {
        let mut seen: HashSet<String> = HashSet::with_capacity(table.len());
        for row in table.values() {
            let Some(value) = row.get(&column.name).filter(|v| !v.is_null()) else {
                continue;
            };
            if !seen.insert(value.to_string()) {
                return Err(StorageError::constraint(
                    ConstraintKind::Unique,
                    format!("{}_{}_key", schema.name, column.name),
                    format!(
                        "duplicate key ({})=({})",
                        column.name,
                        key_string(value)
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn contains_value(
    inner: &MemoryInner,
    table: &str,
    rows: &TableData,
    column: &str,
    value: &Value,
) -> bool {
    let is_key = inner
        .schemas
        .get(table)
        .map(|s| s.key == column)
        .unwrap_or(false);
    if is_key {
        return rows.contains_key(&key_string(value));
    }
    rows.values().any(|r| r.get(column) == Some(value))
}

fn sort_by_key(schema: &TableSchema, rows: &mut [Row]) {
    rows.sort_by(|a, b| compare_values(a.get(&schema.key), b.get(&schema.key)));
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => key_string(x).cmp(&key_string(y)),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
