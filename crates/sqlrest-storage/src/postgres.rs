//! PostgreSQL storage implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, QueryBuilder, Row as _};
use tracing::{debug, instrument};

use crate::error::{ConstraintKind, StorageError, StorageResult};
use crate::schema::{validate_identifier, ColumnType, Row, TableSchema};
use crate::traits::{
    already_finished, Database, HealthStatus, MultiRowStatement, MutationKind, Transaction,
};

/// Default health check timeout in seconds.
const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Default query timeout in seconds.
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Savepoint wrapped around every mutating statement so that a failed
/// statement leaves the enclosing transaction usable.
const STATEMENT_SAVEPOINT: &str = "sqlrest_stmt";

/// PostgreSQL configuration options.
#[derive(Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    pub min_connections: u32,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum time a single statement may run before it fails with
    /// `StorageError::QueryTimeout`.
    pub query_timeout_secs: u64,
    /// Timeout for health checks in seconds.
    pub health_check_timeout_secs: u64,
}

// Custom Debug implementation to hide credentials in database_url
impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("health_check_timeout_secs", &self.health_check_timeout_secs)
            .finish()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/sqlrest".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            health_check_timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
        }
    }
}

/// PostgreSQL implementation of [`Database`].
pub struct PostgresDatabase {
    pool: PgPool,
    query_timeout: Duration,
    health_check_timeout: Duration,
}

impl PostgresDatabase {
    /// Creates a database handle from an existing pool with default timeouts.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            health_check_timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
        }
    }

    /// Connects a pool using the given configuration.
    #[instrument(skip(config))]
    pub async fn from_config(config: &PostgresConfig) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| StorageError::ConnectionError {
                message: e.to_string(),
            })?;

        Ok(Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            health_check_timeout: Duration::from_secs(config.health_check_timeout_secs),
        })
    }

    /// Connects a pool from a database URL with default settings.
    pub async fn from_url(database_url: &str) -> StorageResult<Self> {
        let config = PostgresConfig {
            database_url: database_url.to_string(),
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Wraps an async operation with a timeout and records metrics.
///
/// # Metrics
/// - `sqlrest_storage_query_duration_seconds` - Histogram of query durations
/// - `sqlrest_storage_query_timeout_total` - Counter of timeout events
async fn execute_with_timeout_and_metrics<T, F>(
    operation: &str,
    timeout: Duration,
    future: F,
) -> StorageResult<T>
where
    F: std::future::Future<Output = StorageResult<T>>,
{
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, future).await;
    let duration = start.elapsed().as_secs_f64();

    let (status, final_result) = match result {
        Ok(Ok(value)) => ("success", Ok(value)),
        Ok(Err(e)) => ("error", Err(e)),
        Err(_elapsed) => (
            "timeout",
            Err(StorageError::QueryTimeout {
                operation: operation.to_string(),
                timeout,
            }),
        ),
    };

    metrics::histogram!(
        "sqlrest_storage_query_duration_seconds",
        "operation" => operation.to_string(),
        "backend" => "postgres",
        "status" => status
    )
    .record(duration);

    if status == "timeout" {
        metrics::counter!(
            "sqlrest_storage_query_timeout_total",
            "operation" => operation.to_string(),
            "backend" => "postgres"
        )
        .increment(1);
    }

    final_result
}

/// Maps a driver error, surfacing integrity violations by SQLSTATE.
fn map_sqlx_error(error: sqlx::Error) -> StorageError {
    match error {
        sqlx::Error::Database(db) => {
            if let Some(kind) = db.code().as_deref().and_then(ConstraintKind::from_sqlstate) {
                return StorageError::ConstraintViolation {
                    kind,
                    constraint: db.constraint().map(str::to_string),
                    message: db.message().to_string(),
                };
            }
            StorageError::QueryError {
                message: db.message().to_string(),
            }
        }
        e @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)) => {
            StorageError::ConnectionError {
                message: e.to_string(),
            }
        }
        other => StorageError::QueryError {
            message: other.to_string(),
        },
    }
}

/// A JSON value converted to the column's SQL type for binding.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Json(Option<Value>),
}

impl SqlValue {
    fn from_json(ty: ColumnType, column: &str, value: &Value) -> StorageResult<Self> {
        let mismatch = || StorageError::InvalidInput {
            message: format!(
                "invalid value for column '{column}' of type {}",
                ty.sql_type()
            ),
        };
        if value.is_null() {
            return Ok(match ty {
                ColumnType::Text => SqlValue::Text(None),
                ColumnType::Integer => SqlValue::Int(None),
                ColumnType::Float => SqlValue::Float(None),
                ColumnType::Boolean => SqlValue::Bool(None),
                ColumnType::Json => SqlValue::Json(None),
            });
        }
        match ty {
            ColumnType::Text => value
                .as_str()
                .map(|s| SqlValue::Text(Some(s.to_string())))
                .ok_or_else(mismatch),
            ColumnType::Integer => value
                .as_i64()
                .map(|n| SqlValue::Int(Some(n)))
                .ok_or_else(mismatch),
            ColumnType::Float => value
                .as_f64()
                .map(|n| SqlValue::Float(Some(n)))
                .ok_or_else(mismatch),
            ColumnType::Boolean => value
                .as_bool()
                .map(|b| SqlValue::Bool(Some(b)))
                .ok_or_else(mismatch),
            ColumnType::Json => Ok(SqlValue::Json(Some(value.clone()))),
        }
    }
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: SqlValue) {
    match value {
        SqlValue::Text(v) => builder.push_bind(v),
        SqlValue::Int(v) => builder.push_bind(v),
        SqlValue::Float(v) => builder.push_bind(v),
        SqlValue::Bool(v) => builder.push_bind(v),
        SqlValue::Json(v) => builder.push_bind(v),
    };
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(table: &TableSchema, prefix: &str) -> String {
    table
        .columns
        .iter()
        .map(|c| format!("{prefix}{}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn bind_column(
    builder: &mut QueryBuilder<'static, Postgres>,
    table: &TableSchema,
    column: &str,
    value: &Value,
) -> StorageResult<()> {
    let def = table.column(column).ok_or_else(|| StorageError::InvalidInput {
        message: format!("unknown column '{}' for table '{}'", column, table.name),
    })?;
    push_value(builder, SqlValue::from_json(def.ty, column, value)?);
    Ok(())
}

fn build_select_by_key(
    table: &TableSchema,
    key: &Value,
) -> StorageResult<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM {} WHERE {} = ",
        column_list(table, ""),
        quote_ident(&table.name),
        quote_ident(&table.key)
    ));
    bind_column(&mut builder, table, &table.key, key)?;
    Ok(builder)
}

fn build_select_all(table: &TableSchema, limit: usize) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM {} ORDER BY {} LIMIT ",
        column_list(table, ""),
        quote_ident(&table.name),
        quote_ident(&table.key)
    ));
    builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    builder
}

/// `INSERT INTO "t" ("a", "b") VALUES ($1, $2), ($3, $4)`
fn build_insert(statement: &MultiRowStatement) -> StorageResult<QueryBuilder<'static, Postgres>> {
    let table = &statement.table;
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_ident(&table.name),
        column_list(table, "")
    ));
    for (i, row) in statement.rows.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push("(");
        for (j, column) in table.columns.iter().enumerate() {
            if j > 0 {
                builder.push(", ");
            }
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            bind_column(&mut builder, table, &column.name, value)?;
        }
        builder.push(")");
    }
    Ok(builder)
}

/// `UPDATE "t" AS t SET "a" = v."a" FROM (VALUES ($1::BIGINT, $2::TEXT)) AS v("id", "a") WHERE t."id" = v."id"`
///
/// Columns absent from the rows are left untouched. Every row names the same
/// columns, which [`MultiRowStatement::validate`] checks before this runs.
fn build_update(statement: &MultiRowStatement) -> StorageResult<QueryBuilder<'static, Postgres>> {
    let table = &statement.table;
    let columns: Vec<&str> = table
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| {
            *name == table.key || statement.rows.iter().any(|r| r.contains_key(*name))
        })
        .collect();
    let set_columns: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|name| *name != table.key)
        .collect();
    let assignments = if set_columns.is_empty() {
        vec![format!(
            "{k} = v.{k}",
            k = quote_ident(&table.key)
        )]
    } else {
        set_columns
            .iter()
            .map(|c| format!("{q} = v.{q}", q = quote_ident(c)))
            .collect()
    };

    let mut builder = QueryBuilder::new(format!(
        "UPDATE {} AS t SET {} FROM (VALUES ",
        quote_ident(&table.name),
        assignments.join(", ")
    ));
    for (i, row) in statement.rows.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push("(");
        for (j, column) in columns.iter().enumerate() {
            if j > 0 {
                builder.push(", ");
            }
            let value = row.get(*column).unwrap_or(&Value::Null);
            bind_column(&mut builder, table, column, value)?;
            if let Some(def) = table.column(column) {
                builder.push("::");
                builder.push(def.ty.sql_type());
            }
        }
        builder.push(")");
    }
    builder.push(format!(
        ") AS v({}) WHERE t.{k} = v.{k}",
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        k = quote_ident(&table.key)
    ));
    Ok(builder)
}

/// `DELETE FROM "t" WHERE "id" IN ($1, $2)`
fn build_delete(statement: &MultiRowStatement) -> StorageResult<QueryBuilder<'static, Postgres>> {
    let table = &statement.table;
    let mut builder = QueryBuilder::new(format!(
        "DELETE FROM {} WHERE {} IN (",
        quote_ident(&table.name),
        quote_ident(&table.key)
    ));
    for (i, key) in statement.keys()?.into_iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        bind_column(&mut builder, table, &table.key, key)?;
    }
    builder.push(")");
    Ok(builder)
}

fn build_statement(
    statement: &MultiRowStatement,
) -> StorageResult<QueryBuilder<'static, Postgres>> {
    match statement.kind {
        MutationKind::Insert => build_insert(statement),
        MutationKind::Update => build_update(statement),
        MutationKind::Delete => build_delete(statement),
    }
}

/// `CREATE TABLE IF NOT EXISTS` for one table.
fn create_table_sql(table: &TableSchema) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.name), c.ty.sql_type());
            if c.name == table.key {
                def.push_str(" PRIMARY KEY");
            } else {
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                if c.unique {
                    def.push_str(" UNIQUE");
                }
            }
            if let Some(fk) = &c.references {
                def.push_str(&format!(
                    " REFERENCES {} ({})",
                    quote_ident(&fk.table),
                    quote_ident(&fk.column)
                ));
            }
            def
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.name),
        columns.join(", ")
    )
}

fn decode_row(table: &TableSchema, row: &PgRow) -> StorageResult<Row> {
    let mut out = Row::new();
    for column in &table.columns {
        let name = column.name.as_str();
        let value = match column.ty {
            ColumnType::Text => row
                .try_get::<Option<String>, _>(name)
                .map(|v| v.map(Value::from)),
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(name)
                .map(|v| v.map(Value::from)),
            ColumnType::Float => row
                .try_get::<Option<f64>, _>(name)
                .map(|v| v.map(Value::from)),
            ColumnType::Boolean => row
                .try_get::<Option<bool>, _>(name)
                .map(|v| v.map(Value::from)),
            ColumnType::Json => row.try_get::<Option<Value>, _>(name),
        }
        .map_err(|e| StorageError::SerializationError {
            message: format!("failed to decode column '{name}': {e}"),
        })?;
        out.insert(column.name.clone(), value.unwrap_or(Value::Null));
    }
    Ok(out)
}

#[async_trait]
impl Database for PostgresDatabase {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        let tx = execute_with_timeout_and_metrics("begin", self.query_timeout, async {
            self.pool.begin().await.map_err(map_sqlx_error)
        })
        .await?;
        Ok(Box::new(PostgresTransaction {
            tx: Some(tx),
            query_timeout: self.query_timeout,
        }))
    }

    /// Tables are created in the given order, so referenced tables must come
    /// before the tables referencing them.
    #[instrument(skip(self, tables))]
    async fn migrate(&self, tables: &[TableSchema]) -> StorageResult<()> {
        debug!(count = tables.len(), "Running table migrations");
        for table in tables {
            table.validate()?;
            let sql = create_table_sql(table);
            execute_with_timeout_and_metrics("migrate", self.query_timeout, async {
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let start = Instant::now();

        let check_result = tokio::time::timeout(self.health_check_timeout, async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::HealthCheckFailed {
                    message: format!("database ping failed: {e}"),
                })
        })
        .await;

        let latency = start.elapsed();

        let status = match &check_result {
            Ok(Ok(_)) => "success",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };

        metrics::histogram!(
            "sqlrest_storage_health_check_duration_seconds",
            "backend" => "postgres",
            "status" => status
        )
        .record(latency.as_secs_f64());

        match check_result {
            Ok(result) => {
                result?;
            }
            Err(_elapsed) => {
                return Err(StorageError::QueryTimeout {
                    operation: "health_check".to_string(),
                    timeout: self.health_check_timeout,
                });
            }
        }

        let total_connections = self.pool.size();
        let idle_connections = self.pool.num_idle() as u32;
        metrics::gauge!(
            "sqlrest_storage_pool_connections",
            "backend" => "postgres",
            "state" => "active"
        )
        .set(total_connections.saturating_sub(idle_connections) as f64);
        metrics::gauge!(
            "sqlrest_storage_pool_connections",
            "backend" => "postgres",
            "state" => "idle"
        )
        .set(idle_connections as f64);

        Ok(HealthStatus {
            healthy: true,
            latency,
            message: Some("postgresql".to_string()),
        })
    }
}

impl std::fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("pool", &"PgPool")
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

/// A transaction on one pooled connection.
///
/// Dropping an unfinished transaction rolls it back.
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    query_timeout: Duration,
}

impl PostgresTransaction {
    fn conn(&mut self) -> StorageResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or_else(already_finished)
    }

    async fn simple(&mut self, operation: &str, sql: &str) -> StorageResult<()> {
        let timeout = self.query_timeout;
        let tx = self.conn()?;
        execute_with_timeout_and_metrics(operation, timeout, async {
            (&mut **tx)
                .execute(sql)
                .await
                .map(|_| ())
                .map_err(map_sqlx_error)
        })
        .await
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn fetch(&mut self, table: &TableSchema, key: &Value) -> StorageResult<Option<Row>> {
        let mut builder = build_select_by_key(table, key)?;
        let timeout = self.query_timeout;
        let tx = self.conn()?;
        let row = execute_with_timeout_and_metrics("fetch", timeout, async {
            builder
                .build()
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;
        row.map(|r| decode_row(table, &r)).transpose()
    }

    async fn fetch_all(&mut self, table: &TableSchema, limit: usize) -> StorageResult<Vec<Row>> {
        let mut builder = build_select_all(table, limit);
        let timeout = self.query_timeout;
        let tx = self.conn()?;
        let rows = execute_with_timeout_and_metrics("fetch_all", timeout, async {
            builder
                .build()
                .fetch_all(&mut **tx)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;
        rows.iter().map(|r| decode_row(table, r)).collect()
    }

    #[instrument(skip(self, statement), fields(table = %statement.table.name, kind = %statement.kind, rows = statement.rows.len()))]
    async fn execute(&mut self, statement: &MultiRowStatement) -> StorageResult<u64> {
        statement.validate()?;
        let mut builder = build_statement(statement)?;
        self.simple("savepoint", &format!("SAVEPOINT {STATEMENT_SAVEPOINT}"))
            .await?;

        let timeout = self.query_timeout;
        let tx = self.conn()?;
        let result = execute_with_timeout_and_metrics(statement.kind.as_str(), timeout, async {
            builder
                .build()
                .execute(&mut **tx)
                .await
                .map(|r| r.rows_affected())
                .map_err(map_sqlx_error)
        })
        .await;

        match result {
            Ok(affected) => {
                self.simple(
                    "release_savepoint",
                    &format!("RELEASE SAVEPOINT {STATEMENT_SAVEPOINT}"),
                )
                .await?;
                Ok(affected)
            }
            Err(e) => {
                debug!(error = %e, "statement failed, rolling back to statement savepoint");
                self.simple(
                    "rollback_to_savepoint",
                    &format!("ROLLBACK TO SAVEPOINT {STATEMENT_SAVEPOINT}"),
                )
                .await?;
                self.simple(
                    "release_savepoint",
                    &format!("RELEASE SAVEPOINT {STATEMENT_SAVEPOINT}"),
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn savepoint(&mut self, name: &str) -> StorageResult<()> {
        validate_identifier(name)?;
        self.simple("savepoint", &format!("SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> StorageResult<()> {
        validate_identifier(name)?;
        let name = quote_ident(name);
        self.simple(
            "rollback_to_savepoint",
            &format!("ROLLBACK TO SAVEPOINT {name}"),
        )
        .await?;
        self.simple("release_savepoint", &format!("RELEASE SAVEPOINT {name}"))
            .await
    }

    async fn release_savepoint(&mut self, name: &str) -> StorageResult<()> {
        validate_identifier(name)?;
        self.simple(
            "release_savepoint",
            &format!("RELEASE SAVEPOINT {}", quote_ident(name)),
        )
        .await
    }

    async fn commit(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or_else(already_finished)?;
        execute_with_timeout_and_metrics("commit", self.query_timeout, async {
            tx.commit().await.map_err(map_sqlx_error)
        })
        .await
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or_else(already_finished)?;
        execute_with_timeout_and_metrics("rollback", self.query_timeout, async {
            tx.rollback().await.map_err(map_sqlx_error)
        })
        .await
    }

    fn is_finished(&self) -> bool {
        self.tx.is_none()
    }
}
