//! Types for the batch engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use sqlrest_domain::{OperationDescriptor, OperationError, OperationResponse};
use sqlrest_storage::StorageError;

/// Default maximum number of operations in a single batch.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Default maximum number of rows folded into one statement.
pub const MAX_GROUP_ROWS: usize = 100;

/// How deep internal batches may nest inside each other.
pub const MAX_NESTING_DEPTH: usize = 8;

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_operations: usize,
    pub max_group_rows: usize,
    /// When false every write is persisted by its own statement.
    pub multi_row: bool,
    pub max_nesting_depth: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_operations: MAX_BATCH_SIZE,
            max_group_rows: MAX_GROUP_ROWS,
            multi_row: true,
            max_nesting_depth: MAX_NESTING_DEPTH,
        }
    }
}

/// Index of an operation inside its batch run, in payload order.
pub type OperationId = usize;

/// How one lane was written in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneShape {
    /// A nested array: `[[a, b], ...]`.
    Sequence,
    /// A bare object among arrays: `[a, [b, c]]`.
    Single,
}

/// Shape of the submitted payload, mirrored by the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchShape {
    /// `[a, b, c]`: one sequential lane.
    Flat,
    /// `[[a, b], [c], d]`: independent lanes.
    Lanes(Vec<LaneShape>),
}

/// A parsed batch: lanes of operations, in payload order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub shape: BatchShape,
    pub lanes: Vec<Vec<OperationDescriptor>>,
}

impl BatchPlan {
    /// A flat plan holding one lane.
    pub fn flat(operations: Vec<OperationDescriptor>) -> Self {
        let lanes = if operations.is_empty() {
            Vec::new()
        } else {
            vec![operations]
        };
        Self {
            shape: BatchShape::Flat,
            lanes,
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.lanes.iter().flatten()
    }
}

/// Lifecycle of one operation.
///
/// `Pending -> Running -> {Succeeded, Failed}`; `Pending | Running -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

/// One element of a batch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub href: String,
    pub verb: String,
    pub status: u16,
    pub body: Value,
}

impl OperationResult {
    pub fn new(descriptor: &OperationDescriptor, response: OperationResponse) -> Self {
        Self {
            href: descriptor.href.clone(),
            verb: descriptor.verb.clone(),
            status: response.status,
            body: response.body,
        }
    }
}

/// Progress notifications for observers such as the streaming gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// An operation reached a terminal state.
    Completed {
        lane: usize,
        index: usize,
        result: OperationResult,
    },
    /// The run ended and its transaction was committed or rolled back.
    Finished { status: u16, committed: bool },
}

/// Final state of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    /// Aggregate status.
    pub status: u16,
    pub shape: BatchShape,
    pub lanes: Vec<Vec<OperationResult>>,
    /// True when the transaction (or savepoint) was committed.
    pub committed: bool,
    /// Number of phase gates that ran global hooks.
    pub phase_gates: usize,
}

impl BatchOutcome {
    pub fn results(&self) -> impl Iterator<Item = &OperationResult> {
        self.lanes.iter().flatten()
    }

    /// The response body, mirroring the payload's shape.
    pub fn to_json(&self) -> Value {
        match &self.shape {
            BatchShape::Flat => Value::Array(self.results().map(result_json).collect()),
            BatchShape::Lanes(shapes) => Value::Array(
                shapes
                    .iter()
                    .zip(&self.lanes)
                    .map(|(shape, lane)| match shape {
                        LaneShape::Single => lane
                            .first()
                            .map(result_json)
                            .unwrap_or(Value::Null),
                        LaneShape::Sequence => Value::Array(lane.iter().map(result_json).collect()),
                    })
                    .collect(),
            ),
        }
    }
}

fn result_json(result: &OperationResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

/// Errors that reject a whole batch before any operation runs.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BatchError {
    #[error("batch payload is malformed: {message}")]
    Malformed { message: String },

    #[error("batch of {size} operations exceeds the maximum of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("operation {index} has no verb")]
    NoVerb { index: usize },

    #[error("'{href}' is outside the '/{boundary}' batch boundary")]
    HrefAcrossBoundary { href: String, boundary: String },

    #[error("no resource matches '{href}'")]
    NoMatchingRoute { href: String },

    #[error("could not open the batch transaction: {message}")]
    Storage { message: String },
}

impl BatchError {
    pub fn malformed(message: impl Into<String>) -> Self {
        BatchError::Malformed {
            message: message.into(),
        }
    }

    /// The wire error for this failure.
    pub fn to_operation_error(&self) -> OperationError {
        match self {
            BatchError::Malformed { message } => OperationError::new(
                400,
                sqlrest_domain::codes::BATCH_MALFORMED,
                message.clone(),
            ),
            BatchError::TooLarge { .. } => OperationError::new(
                413,
                sqlrest_domain::codes::BATCH_TOO_LARGE,
                self.to_string(),
            ),
            BatchError::NoVerb { index } => OperationError::no_verb(*index),
            BatchError::HrefAcrossBoundary { href, boundary } => {
                OperationError::href_across_boundary(href, boundary)
            }
            BatchError::NoMatchingRoute { href } => OperationError::no_matching_route(href),
            BatchError::Storage { message } => OperationError::db_error(message.clone()),
        }
    }

    pub fn status(&self) -> u16 {
        self.to_operation_error().status
    }
}

impl From<StorageError> for BatchError {
    fn from(err: StorageError) -> Self {
        BatchError::Storage {
            message: err.to_string(),
        }
    }
}

/// Result type for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;
