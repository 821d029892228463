//! Domain error types for resource definitions.

use thiserror::Error;

/// Errors raised while building or registering resource definitions.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A resource definition is internally inconsistent.
    #[error("invalid resource '{name}': {message}")]
    InvalidResource { name: String, message: String },

    /// Two resources were registered under the same name.
    #[error("duplicate resource: {name}")]
    DuplicateResource { name: String },

    /// A column references a table no registered resource maps.
    #[error("resource '{resource}' references unknown table '{table}'")]
    UnknownReference { resource: String, table: String },

    /// An access rule string could not be parsed.
    #[error("invalid access rule: {value}")]
    InvalidAccessRule { value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
