//! Per-operation errors and their wire codes.

use serde_json::{json, Value};
use thiserror::Error;

use sqlrest_storage::{MutationKind, StorageError};

/// Error codes carried in `{errors: [{code, ...}]}` bodies.
pub mod codes {
    pub const NO_VERB: &str = "no.verb";
    pub const HREF_ACROSS_BOUNDARY: &str = "href.across.boundary";
    pub const NO_MATCHING_ROUTE: &str = "no.matching.route";
    pub const BATCH_MALFORMED: &str = "batch.malformed";
    pub const BATCH_TOO_LARGE: &str = "batch.too.large";
    pub const NOT_FOUND: &str = "not.found";
    pub const NO_BODY: &str = "no.body";
    pub const VALIDATION_FAILED: &str = "validation.failed";
    pub const UNAUTHENTICATED: &str = "unauthenticated";
    pub const FORBIDDEN: &str = "forbidden";
    pub const VERB_UNSUPPORTED: &str = "verb.unsupported";
    pub const DB_CONSTRAINT_VIOLATION: &str = "db.constraint.violation";
    pub const MULTI_INSERT_FAILED: &str = "multi.insert.failed";
    pub const MULTI_UPDATE_FAILED: &str = "multi.update.failed";
    pub const MULTI_DELETE_FAILED: &str = "multi.delete.failed";
    pub const CANCELLED: &str = "cancelled";
    pub const DB_ERROR: &str = "db.error";
    pub const INTERNAL: &str = "internal";
}

/// A structured failure of one operation, or of a whole batch at parse time.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code} ({status}): {message}")]
pub struct OperationError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub detail: Option<Value>,
}

impl OperationError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn no_verb(index: usize) -> Self {
        Self::new(400, codes::NO_VERB, format!("operation {index} has no verb"))
    }

    pub fn href_across_boundary(href: &str, boundary: &str) -> Self {
        Self::new(
            400,
            codes::HREF_ACROSS_BOUNDARY,
            format!("'{href}' is outside the '/{boundary}' batch boundary"),
        )
    }

    pub fn no_matching_route(href: &str) -> Self {
        Self::new(
            404,
            codes::NO_MATCHING_ROUTE,
            format!("no resource matches '{href}'"),
        )
    }

    pub fn not_found(href: &str) -> Self {
        Self::new(404, codes::NOT_FOUND, format!("'{href}' does not exist"))
    }

    pub fn no_body() -> Self {
        Self::new(400, codes::NO_BODY, "request body is required")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(409, codes::VALIDATION_FAILED, message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(401, codes::UNAUTHENTICATED, "authentication required")
    }

    pub fn forbidden() -> Self {
        Self::new(403, codes::FORBIDDEN, "access denied")
    }

    pub fn verb_unsupported(verb: &str, href: &str) -> Self {
        Self::new(
            405,
            codes::VERB_UNSUPPORTED,
            format!("verb '{verb}' is not supported on '{href}'"),
        )
    }

    /// Constraint violation of a statement carrying a single row.
    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::new(409, codes::DB_CONSTRAINT_VIOLATION, message)
    }

    /// Constraint violation of a statement folding several operations.
    pub fn multi_failed(kind: MutationKind, message: impl Into<String>) -> Self {
        let code = match kind {
            MutationKind::Insert => codes::MULTI_INSERT_FAILED,
            MutationKind::Update => codes::MULTI_UPDATE_FAILED,
            MutationKind::Delete => codes::MULTI_DELETE_FAILED,
        };
        Self::new(409, code, message)
    }

    pub fn cancelled() -> Self {
        Self::new(
            202,
            codes::CANCELLED,
            "not executed because the batch transaction was rolled back",
        )
    }

    pub fn db_error(message: impl Into<String>) -> Self {
        Self::new(500, codes::DB_ERROR, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, codes::INTERNAL, message)
    }

    /// True for infrastructure failures (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// Wire body: `{"errors": [{"code", "message", "detail"?}]}`.
    pub fn to_body(&self) -> Value {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let (Some(detail), Some(map)) = (&self.detail, error.as_object_mut()) {
            map.insert("detail".to_string(), detail.clone());
        }
        json!({ "errors": [error] })
    }
}

impl From<StorageError> for OperationError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::ConstraintViolation {
                kind, constraint, ..
            } => {
                let mut e = OperationError::constraint_violation(err.to_string());
                e.detail = Some(json!({
                    "constraint": constraint,
                    "kind": kind.as_str(),
                }));
                e
            }
            _ => OperationError::db_error(err.to_string()),
        }
    }
}
