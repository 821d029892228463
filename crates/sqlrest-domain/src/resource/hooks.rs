//! Per-resource hooks and the nested-batch interface they may use.

use async_trait::async_trait;

use sqlrest_storage::Row;

use crate::executor::PendingWrite;
use crate::operation::{OperationDescriptor, OperationError, OperationResponse};

/// Result of a nested batch issued from a hook.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedOutcome {
    /// Aggregate status of the nested batch.
    pub status: u16,
    /// False when the nested batch was rolled back to its savepoint.
    pub committed: bool,
    /// One response per submitted operation, in order.
    pub responses: Vec<OperationResponse>,
}

/// Issues internal batches inside the current batch's transaction.
///
/// Implemented by the batch engine. A nested batch runs its own full phase
/// cycle inside a savepoint of the enclosing transaction.
#[async_trait]
pub trait InternalRequester: Send + Sync {
    /// Runs `operations` as one sequential lane. `Err` means the batch could
    /// not be parsed and nothing ran.
    async fn batch(
        &self,
        operations: Vec<OperationDescriptor>,
    ) -> Result<NestedOutcome, OperationError>;
}

/// What a hook sees about the operation it runs for.
pub struct HookContext<'a> {
    pub descriptor: &'a OperationDescriptor,
    pub principal: Option<&'a str>,
    /// The row as it was before this operation.
    pub existing: Option<&'a Row>,
    pub requester: &'a dyn InternalRequester,
}

/// Resource-level hooks around persistence. Both default to no-ops.
#[async_trait]
pub trait ResourceHooks: Send + Sync {
    /// Runs before the write is persisted; may rewrite the row or reject.
    async fn before(
        &self,
        _ctx: &HookContext<'_>,
        _write: &mut PendingWrite,
    ) -> Result<(), OperationError> {
        Ok(())
    }

    /// Runs after the write was persisted; may reject or issue nested batches.
    async fn after(
        &self,
        _ctx: &HookContext<'_>,
        _write: &PendingWrite,
    ) -> Result<(), OperationError> {
        Ok(())
    }
}
