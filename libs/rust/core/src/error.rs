//! Error taxonomy for the coordination engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parameters::TensorLayout;
use crate::state::CoordinatorState;

/// The two sub-steps of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fit,
    Evaluate,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Fit => "fit",
            Phase::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FlError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not enough clients: {available} available, {required} required")]
    NotEnoughClients { available: usize, required: usize },
    #[error("client {client} did not respond before the deadline")]
    ClientTimeout { client: String },
    #[error("shape mismatch at tensor {index}: expected {expected}, found {found}")]
    ShapeMismatch { index: usize, expected: String, found: String },
    #[error("no results to aggregate")]
    NoResultsToAggregate,
    #[error("protocol error from client {client}: {reason}")]
    Protocol { client: String, reason: String },
    #[error("insufficient clients in {phase} phase of round {round}: {received} results, {required} required")]
    InsufficientClientsFatal { phase: Phase, round: u64, received: usize, required: usize },
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: CoordinatorState, to: CoordinatorState },
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlError {
    pub fn config(msg: impl Into<String>) -> Self {
        FlError::Configuration(msg.into())
    }

    pub(crate) fn shape_mismatch(index: usize, expected: Option<&TensorLayout>, found: Option<&TensorLayout>) -> Self {
        let render = |l: Option<&TensorLayout>| l.map(|l| l.to_string()).unwrap_or_else(|| "<absent>".into());
        FlError::ShapeMismatch { index, expected: render(expected), found: render(found) }
    }

    /// Errors that end the run rather than a single client's participation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FlError::NotEnoughClients { .. } | FlError::ClientTimeout { .. } | FlError::Protocol { .. })
    }
}

/// Failure of a single call to a single client. Never escalates on its own.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("client reported failure: {0}")]
    Remote(String),
}

impl ClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Transport(_) => "transport",
            ClientError::Timeout => "timeout",
            ClientError::Protocol(_) => "protocol",
            ClientError::Remote(_) => "remote",
        }
    }

    /// Whether the session should be torn down after this failure.
    pub fn disconnects(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Protocol(_))
    }
}

/// Why a run ended in `AbortedFatal`.
#[derive(Debug)]
pub struct AbortReason {
    pub phase: Option<Phase>,
    pub round: u64,
    pub error: FlError,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "round {} aborted during {} phase: {}", self.round, phase, self.error),
            None => write!(f, "round {} aborted: {}", self.round, self.error),
        }
    }
}

impl std::error::Error for AbortReason {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type Result<T, E = FlError> = std::result::Result<T, E>;
