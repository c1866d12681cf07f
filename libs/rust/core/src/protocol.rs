//! Logical message contract between coordinator and clients.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TrainConfig;
use crate::parameters::ParameterSet;
use crate::state::CoordinatorState;

/// Opaque client identity (partition id, connection id, ...). Ordered for deterministic tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

pub type Metrics = BTreeMap<String, f64>;

/// Largest sample count a result may report; weights stay exact as `f64` up to here.
pub const MAX_NUM_EXAMPLES: u64 = 1 << 53;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client_id: ClientId,
    /// Base URL where the client serves fit/evaluate requests.
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAck {
    pub client_id: ClientId,
    pub accepted: bool,
    pub connection_id: Option<Uuid>,
    pub round: u64,
    pub message: String,
}

impl SessionAck {
    pub fn rejected(client_id: ClientId, round: u64, message: impl Into<String>) -> Self {
        Self { client_id, accepted: false, connection_id: None, round, message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub client_id: ClientId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitIns {
    pub round: u64,
    pub parameters: Arc<ParameterSet>,
    pub config: TrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateIns {
    pub round: u64,
    pub parameters: Arc<ParameterSet>,
    pub config: TrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    pub client_id: ClientId,
    pub parameters: ParameterSet,
    pub num_examples: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResult {
    pub client_id: ClientId,
    pub loss: f64,
    pub num_examples: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

fn check_common(expected: &ClientId, actual: &ClientId, num_examples: u64, metrics: &Metrics) -> Result<(), String> {
    if actual != expected {
        return Err(format!("result claims client id {actual}"));
    }
    if num_examples == 0 {
        return Err("sample count must be at least 1".into());
    }
    if num_examples > MAX_NUM_EXAMPLES {
        return Err(format!("sample count {num_examples} exceeds {MAX_NUM_EXAMPLES}"));
    }
    if let Some((k, v)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
        return Err(format!("metric {k} is not finite ({v})"));
    }
    Ok(())
}

impl FitResult {
    /// Well-formedness checks; tensor layout is checked against the broadcast set separately.
    pub fn validate(&self, expected: &ClientId) -> Result<(), String> {
        check_common(expected, &self.client_id, self.num_examples, &self.metrics)
    }
}

impl EvaluateResult {
    pub fn validate(&self, expected: &ClientId) -> Result<(), String> {
        check_common(expected, &self.client_id, self.num_examples, &self.metrics)?;
        if !self.loss.is_finite() {
            return Err(format!("loss is not finite ({})", self.loss));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownNotice {
    pub reason: String,
    pub state: CoordinatorState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: CoordinatorState,
    pub round: u64,
    pub rounds_completed: u64,
    pub num_rounds: u64,
    pub connected_clients: usize,
    pub parameters_digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_flags_malformed_results() {
        let me = ClientId::from("7");
        let ok = EvaluateResult { client_id: me.clone(), loss: 0.5, num_examples: 3, metrics: Metrics::new() };
        assert!(ok.validate(&me).is_ok());

        let zero = EvaluateResult { num_examples: 0, ..ok.clone() };
        assert!(zero.validate(&me).is_err());
        let huge = EvaluateResult { num_examples: u64::MAX, ..ok.clone() };
        assert!(huge.validate(&me).unwrap_err().contains("sample count"));
        let limit = EvaluateResult { num_examples: MAX_NUM_EXAMPLES, ..ok.clone() };
        assert!(limit.validate(&me).is_ok());
        let nan = EvaluateResult { loss: f64::NAN, ..ok.clone() };
        assert!(nan.validate(&me).is_err());
        assert!(ok.validate(&ClientId::from("8")).is_err());

        let mut metrics = Metrics::new();
        metrics.insert("accuracy".into(), f64::INFINITY);
        let fit = FitResult { client_id: me.clone(), parameters: ParameterSet::default(), num_examples: 1, metrics };
        assert!(fit.validate(&me).unwrap_err().contains("accuracy"));
    }

    #[test]
    fn client_ids_order_lexicographically() {
        let mut ids: Vec<ClientId> = ["b", "a", "c"].into_iter().map(ClientId::from).collect();
        ids.sort();
        assert_eq!(ids.iter().map(ClientId::as_str).collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }
}
