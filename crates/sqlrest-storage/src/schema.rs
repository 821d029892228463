//! Table schemas and row values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

/// A row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Maximum length of a table or column identifier (PostgreSQL NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// SQL column types supported by the mapping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Json,
}

impl ColumnType {
    /// PostgreSQL type name used in DDL and casts.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Json => "JSONB",
        }
    }

    /// Returns true if `value` is acceptable for this column type.
    ///
    /// `null` is always accepted here; nullability is a separate check.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Text, Value::String(_)) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Json, _) => true,
            _ => false,
        }
    }

    /// Parses an identifier taken from a URL path segment into a typed value.
    pub fn parse_key(&self, raw: &str) -> Option<Value> {
        match self {
            ColumnType::Text => Some(Value::String(raw.to_string())),
            ColumnType::Integer => raw.parse::<i64>().ok().map(Value::from),
            _ => None,
        }
    }
}

/// A foreign key reference from one column to another table's column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub references: Option<ForeignKey>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            unique: false,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }
}

/// Schema of one mapped table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Primary key column. Always one of `columns`.
    pub key: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn key_column(&self) -> StorageResult<&ColumnDef> {
        self.column(&self.key)
            .ok_or_else(|| StorageError::InvalidInput {
                message: format!(
                    "key column '{}' is not a column of table '{}'",
                    self.key, self.name
                ),
            })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Validates identifiers and the key column.
    pub fn validate(&self) -> StorageResult<()> {
        validate_identifier(&self.name)?;
        if self.columns.is_empty() {
            return Err(StorageError::InvalidInput {
                message: format!("table '{}' has no columns", self.name),
            });
        }
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if let Some(fk) = &column.references {
                validate_identifier(&fk.table)?;
                validate_identifier(&fk.column)?;
            }
        }
        let key = self.key_column()?;
        if !matches!(key.ty, ColumnType::Text | ColumnType::Integer) {
            return Err(StorageError::InvalidInput {
                message: format!(
                    "key column '{}' of table '{}' must be text or integer",
                    self.key, self.name
                ),
            });
        }
        Ok(())
    }

    /// Returns the key value of a row, rejecting rows without one.
    pub fn key_of<'r>(&self, row: &'r Row) -> StorageResult<&'r Value> {
        match row.get(&self.key) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(StorageError::constraint(
                crate::error::ConstraintKind::NotNull,
                format!("{}_pkey", self.name),
                format!("null value in key column '{}'", self.key),
            )),
        }
    }
}

/// Validates a SQL identifier.
///
/// Identifiers are always quoted when rendered, but are still restricted to
/// `[A-Za-z_][A-Za-z0-9_]*` so that configuration cannot smuggle SQL.
pub fn validate_identifier(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start
        || name.len() > MAX_IDENTIFIER_LENGTH
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StorageError::InvalidInput {
            message: format!("invalid identifier: '{name}'"),
        });
    }
    Ok(())
}

/// Canonical string form of a key value, used as a map key.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
