//! Coordinator finite state machine.
//!
//! Idle -> WaitingForClients -> Fitting -> Aggregating -> Evaluating -> AggregatingEval,
//! then back to WaitingForClients for the next round or into Finished. Any state may
//! fall into AbortedFatal. Finished and AbortedFatal are terminal.
//!
//! Tracks how long each state was held, in order.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    WaitingForClients,
    Fitting,
    Aggregating,
    Evaluating,
    AggregatingEval,
    Finished,
    AbortedFatal,
}

impl CoordinatorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CoordinatorState::Finished | CoordinatorState::AbortedFatal)
    }

    pub fn can_transition_to(self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        if next == AbortedFatal {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, WaitingForClients)
                | (WaitingForClients, Fitting)
                // fit phase failed below its minimum: retry the round
                | (Fitting, WaitingForClients)
                | (Fitting, Aggregating)
                | (Aggregating, Evaluating)
                // evaluation skipped (fraction_evaluate = 0)
                | (Aggregating, WaitingForClients)
                | (Aggregating, Finished)
                | (Evaluating, AggregatingEval)
                | (AggregatingEval, WaitingForClients)
                | (AggregatingEval, Finished)
        )
    }
}

#[derive(Debug)]
pub struct StateMachine {
    state: CoordinatorState,
    entered_at: Instant,
    durations: Vec<(CoordinatorState, Duration)>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self { state: CoordinatorState::Idle, entered_at: Instant::now(), durations: Vec::new() }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn transition(&mut self, next: CoordinatorState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(FlError::InvalidTransition { from: self.state, to: next });
        }
        let now = Instant::now();
        self.durations.push((self.state, now - self.entered_at));
        debug!(from = ?self.state, to = ?next, "state_transition");
        self.state = next;
        self.entered_at = now;
        Ok(())
    }

    pub fn durations(&self) -> &[(CoordinatorState, Duration)] {
        &self.durations
    }
}
