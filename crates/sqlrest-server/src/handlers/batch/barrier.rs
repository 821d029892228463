//! Reusable phase barrier shared by every operation of a batch run.
//!
//! Each gate is crossed once per phase. Arrivals are counted in operations;
//! the arrival that completes the count becomes the gate's leader, runs the
//! once-per-phase work, then releases everyone, itself included.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Result of arriving at a gate.
pub enum BarrierSlot<'a> {
    /// Last to arrive. Must call [`GateGuard::release`] when done.
    Leader(GateGuard<'a>),
    /// Others are still on their way; wait for the leader.
    Follower(GateWaiter),
}

#[derive(Debug)]
struct BarrierState {
    generation: u64,
    expected: usize,
    arrived: usize,
}

/// Counts operations reaching the current phase.
#[derive(Debug)]
pub struct PhaseBarrier {
    state: Mutex<BarrierState>,
    released: watch::Sender<u64>,
}

impl PhaseBarrier {
    /// A barrier whose first gate waits for `expected` operations.
    pub fn new(expected: usize) -> Self {
        let (released, _) = watch::channel(0);
        Self {
            state: Mutex::new(BarrierState {
                generation: 0,
                expected,
                arrived: 0,
            }),
            released,
        }
    }

    fn state(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `count` operations at the current gate.
    pub fn arrive(&self, count: usize) -> BarrierSlot<'_> {
        let mut state = self.state();
        state.arrived += count;
        if state.arrived >= state.expected {
            BarrierSlot::Leader(GateGuard {
                barrier: self,
                released: false,
            })
        } else {
            BarrierSlot::Follower(GateWaiter {
                receiver: self.released.subscribe(),
                generation: state.generation,
            })
        }
    }

    /// Number of gates released so far.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    fn release(&self, next_expected: usize) {
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.arrived = 0;
            state.expected = next_expected;
            state.generation
        };
        self.released.send_replace(generation);
    }
}

/// Held by the leader of a gate.
///
/// Dropping it without calling `release` still opens the gate, so a
/// panicking leader never strands its followers.
pub struct GateGuard<'a> {
    barrier: &'a PhaseBarrier,
    released: bool,
}

impl GateGuard<'_> {
    /// Opens the gate; the next one waits for `next_expected` operations.
    pub fn release(mut self, next_expected: usize) {
        self.barrier.release(next_expected);
        self.released = true;
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.barrier.release(0);
        }
    }
}

/// Held by followers until the leader opens the gate.
pub struct GateWaiter {
    receiver: watch::Receiver<u64>,
    generation: u64,
}

impl GateWaiter {
    pub async fn wait(mut self) {
        let generation = self.generation;
        // The sender lives as long as the barrier, which outlives every waiter.
        let _ = self.receiver.wait_for(|g| *g > generation).await;
    }
}
