//! Storage error types.

use std::time::Duration;

use thiserror::Error;

/// The class of integrity constraint a statement violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Primary key or unique index collision.
    Unique,
    /// Referenced row missing, or a referenced row was deleted.
    ForeignKey,
    /// CHECK constraint rejected the row.
    Check,
    /// A NOT NULL column received a null.
    NotNull,
}

impl ConstraintKind {
    /// Maps a PostgreSQL SQLSTATE to a constraint kind.
    pub fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            "23505" => Some(Self::Unique),
            "23503" => Some(Self::ForeignKey),
            "23514" => Some(Self::Check),
            "23502" => Some(Self::NotNull),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unique => "unique",
            Self::ForeignKey => "foreign_key",
            Self::Check => "check",
            Self::NotNull => "not_null",
        }
    }
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A statement was rejected by an integrity constraint.
    ///
    /// For multi-row statements the driver does not say which row triggered
    /// the violation, only which constraint.
    #[error("{kind} constraint violation{}: {message}", constraint.as_ref().map(|c| format!(" on {c}")).unwrap_or_default())]
    ConstraintViolation {
        kind: ConstraintKind,
        constraint: Option<String>,
        message: String,
    },

    /// Table is not known to the backend.
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Database connection error.
    #[error("database connection error: {message}")]
    ConnectionError { message: String },

    /// Database query error.
    #[error("database query error: {message}")]
    QueryError { message: String },

    /// Query exceeded its configured timeout.
    #[error("query timeout after {timeout:?} during {operation}")]
    QueryTimeout {
        operation: String,
        timeout: Duration,
    },

    /// Transaction error.
    #[error("transaction error: {message}")]
    TransactionError { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Serialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// Health check failed.
    #[error("health check failed: {message}")]
    HealthCheckFailed { message: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    InternalError { message: String },
}

impl StorageError {
    /// Returns true when the error came from an integrity constraint.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StorageError::ConstraintViolation { .. })
    }

    /// Returns the violated constraint kind, if any.
    pub fn constraint_kind(&self) -> Option<ConstraintKind> {
        match self {
            StorageError::ConstraintViolation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn constraint(
        kind: ConstraintKind,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        StorageError::ConstraintViolation {
            kind,
            constraint: Some(constraint.into()),
            message: message.into(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(
            ConstraintKind::from_sqlstate("23505"),
            Some(ConstraintKind::Unique)
        );
        assert_eq!(
            ConstraintKind::from_sqlstate("23503"),
            Some(ConstraintKind::ForeignKey)
        );
        assert_eq!(
            ConstraintKind::from_sqlstate("23514"),
            Some(ConstraintKind::Check)
        );
        assert_eq!(
            ConstraintKind::from_sqlstate("23502"),
            Some(ConstraintKind::NotNull)
        );
        assert_eq!(ConstraintKind::from_sqlstate("42P01"), None);
    }

    #[test]
    fn test_constraint_violation_display_names_constraint() {
        let err = StorageError::constraint(
            ConstraintKind::Unique,
            "users_email_key",
            "duplicate value",
        );
        assert!(err.is_constraint_violation());
        assert_eq!(err.constraint_kind(), Some(ConstraintKind::Unique));
        assert_eq!(
            err.to_string(),
            "unique constraint violation on users_email_key: duplicate value"
        );
    }
}
