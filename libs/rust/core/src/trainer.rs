//! Local Trainer: the client-side collaborator that owns the model computation.

use crate::config::{Device, TrainConfig};
use crate::parameters::ParameterSet;
use crate::protocol::Metrics;

#[derive(Debug, Clone)]
pub struct FitOutput {
    pub parameters: ParameterSet,
    pub num_examples: u64,
    pub metrics: Metrics,
}

#[derive(Debug, Clone)]
pub struct EvaluateOutput {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// Runs on the client. Calls may block for a long time; async callers should move
/// them onto a blocking thread.
pub trait LocalTrainer: Send + 'static {
    /// Current local parameters.
    fn get_parameters(&self) -> ParameterSet;

    /// Train starting from `parameters` and return the updated set.
    fn fit(&mut self, parameters: &ParameterSet, config: &TrainConfig, device: Device) -> anyhow::Result<FitOutput>;

    /// Score `parameters` on local held-out data.
    fn evaluate(&mut self, parameters: &ParameterSet, config: &TrainConfig, device: Device) -> anyhow::Result<EvaluateOutput>;
}
