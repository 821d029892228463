//! Global phase hooks and the cohort they observe.

use sqlrest_domain::{OperationDescriptor, OperationError, OperationResponse, Phase};

use super::types::{OperationId, OperationStatus};

/// One operation as seen from a phase hook.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortEntry {
    pub id: OperationId,
    pub lane: usize,
    /// Position inside the lane.
    pub index: usize,
    pub descriptor: OperationDescriptor,
    pub status: OperationStatus,
    /// Last phase the operation entered.
    pub phase: Option<Phase>,
    /// Result body or error detail, once the operation has ended.
    pub response: Option<OperationResponse>,
}

/// Every operation of a run, frozen at a phase gate.
#[derive(Debug)]
pub struct Cohort {
    depth: usize,
    entries: Vec<CohortEntry>,
    failures: Vec<(OperationId, OperationError)>,
}

impl Cohort {
    pub(crate) fn new(depth: usize, entries: Vec<CohortEntry>) -> Self {
        Self {
            depth,
            entries,
            failures: Vec::new(),
        }
    }

    /// 0 for a top-level batch, 1 for a batch issued from one of its hooks, ...
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn operations(&self) -> &[CohortEntry] {
        &self.entries
    }

    /// Operations that will enter the next phase unless failed here.
    pub fn live(&self) -> impl Iterator<Item = &CohortEntry> {
        self.entries.iter().filter(move |e| {
            !e.status.is_terminal() && !self.failures.iter().any(|(id, _)| *id == e.id)
        })
    }

    pub fn get(&self, id: OperationId) -> Option<&CohortEntry> {
        self.entries.get(id)
    }

    /// Fails a live operation before the next phase starts.
    ///
    /// Returns false for unknown, finished or already failed operations.
    pub fn fail(&mut self, id: OperationId, error: OperationError) -> bool {
        let live = self.live().any(|e| e.id == id);
        if live {
            self.failures.push((id, error));
        }
        live
    }

    pub(crate) fn into_failures(self) -> Vec<(OperationId, OperationError)> {
        self.failures
    }
}

/// Runs once per phase gate, after every live operation has arrived and
/// before any of them is released.
pub trait PhaseHook: Send + Sync {
    fn before_phase(&self, phase: Phase, cohort: &mut Cohort);
}
