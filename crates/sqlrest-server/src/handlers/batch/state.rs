//! Per-operation state owned by a batch run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use sqlrest_domain::{OperationDescriptor, OperationError, OperationResponse, Phase};

use super::cancellation;
use super::hooks::CohortEntry;
use super::types::{BatchEvent, BatchPlan, OperationId, OperationResult, OperationStatus};

#[derive(Debug)]
struct OperationState {
    lane: usize,
    index: usize,
    descriptor: OperationDescriptor,
    status: OperationStatus,
    phase: Option<Phase>,
    response: Option<OperationResponse>,
}

/// Every operation of one run, indexed by [`OperationId`].
///
/// Ids are assigned lane by lane in payload order. Terminal transitions
/// happen at most once and are reported to the observer, if any.
pub struct OperationTable {
    states: Vec<Mutex<OperationState>>,
    lanes: usize,
    doomed: AtomicBool,
    events: Option<UnboundedSender<BatchEvent>>,
}

impl OperationTable {
    pub fn new(plan: &BatchPlan, events: Option<UnboundedSender<BatchEvent>>) -> Self {
        let states = plan
            .lanes
            .iter()
            .enumerate()
            .flat_map(|(lane, ops)| {
                ops.iter().enumerate().map(move |(index, descriptor)| {
                    Mutex::new(OperationState {
                        lane,
                        index,
                        descriptor: descriptor.clone(),
                        status: OperationStatus::Pending,
                        phase: None,
                        response: None,
                    })
                })
            })
            .collect();
        Self {
            states,
            lanes: plan.lanes.len(),
            doomed: AtomicBool::new(false),
            events,
        }
    }

    fn state(&self, id: OperationId) -> Option<MutexGuard<'_, OperationState>> {
        self.states
            .get(id)
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn status(&self, id: OperationId) -> Option<OperationStatus> {
        self.state(id).map(|s| s.status)
    }

    pub fn is_live(&self, id: OperationId) -> bool {
        self.status(id).map_or(false, |s| !s.is_terminal())
    }

    pub fn is_write(&self, id: OperationId) -> bool {
        self.state(id).map_or(false, |s| s.descriptor.is_write())
    }

    /// True once the run's transaction can no longer be committed.
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    pub fn doom(&self) {
        if !self.doomed.swap(true, Ordering::SeqCst) {
            debug!("batch transaction doomed");
        }
    }

    pub fn begin_phase(&self, id: OperationId, phase: Phase) {
        if let Some(mut state) = self.state(id) {
            if !state.status.is_terminal() {
                state.status = OperationStatus::Running;
                state.phase = Some(phase);
            }
        }
    }

    pub fn succeed(&self, id: OperationId, response: OperationResponse) -> bool {
        self.finish(id, OperationStatus::Succeeded, response)
    }

    /// Fails a live operation, dooming the run when the failure calls for it.
    pub fn fail(&self, id: OperationId, error: &OperationError) -> bool {
        let is_write = self.is_write(id);
        let failed = self.finish(id, OperationStatus::Failed, OperationResponse::from(error));
        if failed && cancellation::dooms(is_write, error) {
            self.doom();
        }
        failed
    }

    pub fn cancel(&self, id: OperationId) -> bool {
        self.finish(
            id,
            OperationStatus::Cancelled,
            OperationResponse::from(&OperationError::cancelled()),
        )
    }

    fn finish(&self, id: OperationId, status: OperationStatus, response: OperationResponse) -> bool {
        let event = {
            let Some(mut state) = self.state(id) else {
                return false;
            };
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.response = Some(response.clone());
            metrics::counter!("sqlrest_batch_operations_total", "status" => response.status.to_string())
                .increment(1);
            BatchEvent::Completed {
                lane: state.lane,
                index: state.index,
                result: OperationResult::new(&state.descriptor, response),
            }
        };
        self.notify(event);
        true
    }

    /// Forwards `event` to the observer, if any.
    pub fn notify(&self, event: BatchEvent) {
        if let Some(events) = &self.events {
            // A closed channel only means the observer went away.
            let _ = events.send(event);
        }
    }

    /// Live operation ids grouped by lane.
    pub fn live_by_lane(&self) -> Vec<Vec<OperationId>> {
        let mut lanes = vec![Vec::new(); self.lanes];
        for (id, state) in self.states.iter().enumerate() {
            let state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.status.is_terminal() {
                lanes[state.lane].push(id);
            }
        }
        lanes
    }

    pub fn live_count(&self) -> usize {
        (0..self.len()).filter(|id| self.is_live(*id)).count()
    }

    /// A consistent view of every operation, for phase hooks.
    pub fn snapshot(&self) -> Vec<CohortEntry> {
        self.states
            .iter()
            .enumerate()
            .map(|(id, state)| {
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                CohortEntry {
                    id,
                    lane: state.lane,
                    index: state.index,
                    descriptor: state.descriptor.clone(),
                    status: state.status,
                    phase: state.phase,
                    response: state.response.clone(),
                }
            })
            .collect()
    }

    /// Final results by lane. An operation that never reached a terminal
    /// state is reported as an internal error.
    pub fn results(&self) -> Vec<Vec<OperationResult>> {
        let mut lanes = vec![Vec::new(); self.lanes];
        for state in &self.states {
            let state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let response = match (&state.response, state.status.is_terminal()) {
                (Some(response), true) => response.clone(),
                _ => OperationResponse::from(&OperationError::internal(
                    "operation did not complete",
                )),
            };
            lanes[state.lane].push(OperationResult::new(&state.descriptor, response));
        }
        lanes
    }
}
