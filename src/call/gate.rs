//! Enclave entry gate
//!
//! One call chain runs inside the enclave at a time. The chain holding the gate
//! may re-enter it any number of times (nested calls coming back in), while other
//! chains queue and are admitted in arrival order.

use super::frame::ChainId;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct GateState {
    owner: Option<ChainId>,
    depth: usize,
    next_ticket: u64,
    serving: u64,
}

#[derive(Default)]
pub struct ChainGate {
    state: Mutex<GateState>,
    turn: Condvar,
}

impl ChainGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `chain` may run, then hold the gate until the guard drops
    pub fn enter(&self, chain: ChainId) -> GateGuard<'_> {
        let mut state = self.lock();
        if state.owner == Some(chain) {
            state.depth += 1;
            return GateGuard { gate: self };
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.owner.is_some() || state.serving != ticket {
            state = self
                .turn
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.serving += 1;
        state.owner = Some(chain);
        state.depth = 1;
        log::debug!("Gate admitted chain {:?}", chain);
        GateGuard { gate: self }
    }

    /// Chain currently inside, if any
    pub fn owner(&self) -> Option<ChainId> {
        self.lock().owner
    }

    fn leave(&self) {
        let mut state = self.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.turn.notify_all();
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct GateGuard<'a> {
    gate: &'a ChainGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
