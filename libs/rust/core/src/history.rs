//! Per-round records and the summary a finished run hands back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::{AggregatedMetrics, EvaluateAggregate};
use crate::error::AbortReason;
use crate::parameters::ParameterSet;
use crate::protocol::ClientId;
use crate::state::CoordinatorState;

#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub round: u64,
    pub fit_participants: Vec<ClientId>,
    pub fit_accepted: usize,
    pub fit_failed: usize,
    pub fit_metrics: AggregatedMetrics,
    /// Absent when evaluation was skipped.
    pub evaluation: Option<EvaluateAggregate>,
    pub eval_accepted: usize,
    pub eval_failed: usize,
    /// Attempts needed before the fit phase met its minimum.
    pub retries: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

impl RoundRecord {
    pub fn loss(&self) -> Option<f64> {
        self.evaluation.as_ref().map(|e| e.loss)
    }
}

/// Outcome of `Coordinator::run`.
#[derive(Debug)]
pub struct RunSummary {
    pub state: CoordinatorState,
    /// Last round the coordinator worked on.
    pub round: u64,
    pub rounds_completed: u64,
    pub history: Vec<RoundRecord>,
    pub abort: Option<AbortReason>,
    pub final_parameters: Arc<ParameterSet>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.state == CoordinatorState::Finished
    }

    /// `(round, loss)` for every round that was evaluated.
    pub fn losses(&self) -> Vec<(u64, f64)> {
        self.history.iter().filter_map(|r| r.loss().map(|l| (r.round, l))).collect()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
