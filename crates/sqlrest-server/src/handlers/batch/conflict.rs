//! Multi-row conflict resolver.
//!
//! Consecutive writes of one lane that target the same table with the same
//! mutation kind are folded into a single statement. The driver cannot say
//! which row broke a constraint, so a rejected statement fails every member
//! of its group.
//!
//! Groups never span lanes. Lanes are independent of each other and ordered
//! only within themselves: a group mixing lanes would report one lane's
//! constraint failure as `multi.*.failed` on the writes of another, and
//! pulling a later write of a lane ahead of an earlier one on a different
//! table would break that lane's payload order.

use tracing::{debug, warn};

use sqlrest_domain::{OperationError, SharedTransaction};
use sqlrest_storage::{MultiRowStatement, MutationKind, Row, StorageError, TableSchema};

use super::state::OperationTable;
use super::types::OperationId;

/// A write waiting for the persist phase.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub id: OperationId,
    pub table: TableSchema,
    pub kind: MutationKind,
    pub row: Row,
}

/// Writes executed by one statement.
#[derive(Debug, Clone)]
pub struct ConflictGroup {
    pub table: TableSchema,
    pub kind: MutationKind,
    pub members: Vec<OperationId>,
    rows: Vec<Row>,
}

impl ConflictGroup {
    fn start(pending: PendingRow) -> Self {
        Self {
            table: pending.table,
            kind: pending.kind,
            members: vec![pending.id],
            rows: vec![pending.row],
        }
    }

    fn accepts(&self, pending: &PendingRow, max_rows: usize) -> bool {
        self.table.name == pending.table.name
            && self.kind == pending.kind
            && self.members.len() < max_rows
    }

    fn push(&mut self, pending: PendingRow) {
        self.members.push(pending.id);
        self.rows.push(pending.row);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// How a group's statement ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOutcome {
    Persisted,
    Failed,
    /// The run was doomed before the statement was issued.
    Cancelled,
}

/// Partitions pending writes and executes one statement per group.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    max_group_rows: usize,
    multi_row: bool,
}

impl ConflictResolver {
    pub fn new(max_group_rows: usize, multi_row: bool) -> Self {
        Self {
            max_group_rows: max_group_rows.max(1),
            multi_row,
        }
    }

    /// Splits one lane's writes, in lane order, into groups of consecutive
    /// compatible writes.
    pub fn partition(&self, pending: Vec<PendingRow>) -> Vec<ConflictGroup> {
        let max_rows = if self.multi_row { self.max_group_rows } else { 1 };
        let mut groups: Vec<ConflictGroup> = Vec::new();
        for row in pending {
            match groups.last_mut() {
                Some(group) if group.accepts(&row, max_rows) => group.push(row),
                _ => groups.push(ConflictGroup::start(row)),
            }
        }
        groups
    }

    /// Executes `group` unless the run is already doomed.
    ///
    /// The transaction stays locked until every member's state reflects
    /// the result, so the next group observes this one's doom.
    pub async fn persist(
        &self,
        group: ConflictGroup,
        transaction: &SharedTransaction,
        operations: &OperationTable,
    ) -> GroupOutcome {
        let mut tx = transaction.lock().await;

        if operations.is_doomed() {
            for id in &group.members {
                operations.cancel(*id);
            }
            return GroupOutcome::Cancelled;
        }

        let size = group.len();
        let statement = MultiRowStatement::new(group.table, group.kind, group.rows);
        match tx.execute(&statement).await {
            Ok(affected) => {
                debug!(
                    table = %statement.table.name,
                    kind = %statement.kind,
                    rows = size,
                    affected,
                    "persisted conflict group"
                );
                GroupOutcome::Persisted
            }
            Err(err) => {
                warn!(
                    table = %statement.table.name,
                    kind = %statement.kind,
                    rows = size,
                    error = %err,
                    "conflict group rejected"
                );
                metrics::counter!(
                    "sqlrest_conflict_group_failures_total",
                    "kind" => statement.kind.as_str()
                )
                .increment(1);
                let error = group_error(statement.kind, size, err);
                for id in &group.members {
                    operations.fail(*id, &error);
                }
                GroupOutcome::Failed
            }
        }
    }
}

/// The error reported to every member of a rejected group.
pub fn group_error(kind: MutationKind, size: usize, err: StorageError) -> OperationError {
    if err.is_constraint_violation() && size > 1 {
        OperationError::multi_failed(kind, err.to_string())
    } else {
        OperationError::from(err)
    }
}
