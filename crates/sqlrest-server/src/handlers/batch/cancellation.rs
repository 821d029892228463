//! Cancellation propagator.
//!
//! Once a run is doomed its transaction will be rolled back, so every write
//! that has not reached a terminal state is cancelled. That includes writes
//! whose statement already ran: their rows are discarded with the
//! transaction, and they must not run after hooks against it. Reads are
//! never cancelled. The sweep runs at every phase gate, before anyone is
//! released into the next phase.

use tracing::debug;

use sqlrest_domain::OperationError;

use super::state::OperationTable;
use super::types::OperationId;

/// True when a failure makes the run's transaction non-committable:
/// any failed write, and any infrastructure failure.
pub fn dooms(is_write: bool, error: &OperationError) -> bool {
    is_write || error.is_server_error()
}

/// Cancels every live write of a doomed run.
pub fn sweep(operations: &OperationTable) -> Vec<OperationId> {
    if !operations.is_doomed() {
        return Vec::new();
    }
    let cancelled: Vec<OperationId> = (0..operations.len())
        .filter(|&id| operations.is_live(id) && operations.is_write(id))
        .filter(|&id| operations.cancel(id))
        .collect();
    if !cancelled.is_empty() {
        debug!(count = cancelled.len(), "cancelled pending writes");
    }
    cancelled
}
