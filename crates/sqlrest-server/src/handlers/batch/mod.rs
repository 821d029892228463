//! The transactional batch engine.
//!
//! A batch is a JSON array of `{href, verb, body?}` operations. A flat array
//! is one sequential lane; nested arrays are independent lanes. Every
//! operation of a batch shares one database transaction and advances through
//! the same phases in lockstep:
//!
//! 1. **Tree building**: the payload is parsed into lanes; malformed
//!    payloads, missing verbs and unknown routes reject the whole batch
//! 2. **Phase gates**: all live operations meet before each phase; global
//!    phase hooks run once per gate and see the whole cohort
//! 3. **Conflict groups**: consecutive compatible writes of a lane are
//!    persisted by one multi-row statement
//! 4. **Cancellation**: after a write fails, every write that has not
//!    finished is cancelled (202) at the next gate
//! 5. **Commit or rollback**: exactly once, after every operation ends
//!
//! Internal batches issued by resource hooks run the same cycle inside a
//! savepoint of the enclosing transaction.

mod aggregate;
mod barrier;
mod cancellation;
mod conflict;
mod handler;
mod hooks;
mod state;
mod transaction;
mod tree;
mod types;

pub use aggregate::{aggregate_status, severity};
pub use barrier::{BarrierSlot, GateGuard, GateWaiter, PhaseBarrier};
pub use conflict::{ConflictGroup, ConflictResolver, GroupOutcome, PendingRow};
pub use handler::{BatchEngine, BatchEngineBuilder};
pub use hooks::{Cohort, CohortEntry, PhaseHook};
pub use transaction::{TransactionManager, TransactionOutcome, TransactionScope};
pub use tree::BatchTreeBuilder;
pub use types::{
    BatchError, BatchEvent, BatchOutcome, BatchPlan, BatchResult, BatchSettings, BatchShape,
    LaneShape, OperationId, OperationResult, OperationStatus, MAX_BATCH_SIZE, MAX_GROUP_ROWS,
    MAX_NESTING_DEPTH,
};
