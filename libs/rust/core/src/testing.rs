use anyhow::bail;

use crate::config::{Device, TrainConfig};
use crate::parameters::{ParameterSet, Tensor, TensorData};
use crate::protocol::Metrics;
use crate::trainer::{EvaluateOutput, FitOutput, LocalTrainer};

/// Echoes whatever parameters it is given.
pub struct ConstantTrainer {
    params: ParameterSet,
    num_examples: u64,
    fail: bool,
}

impl ConstantTrainer {
    pub fn new(values: &[f32], num_examples: u64) -> Self {
        let t = Tensor::new("w", vec![values.len()], TensorData::F32(values.to_vec())).unwrap();
        Self { params: ParameterSet::new(vec![t]), num_examples, fail: false }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl LocalTrainer for ConstantTrainer {
    fn get_parameters(&self) -> ParameterSet {
        self.params.clone()
    }

    fn fit(&mut self, parameters: &ParameterSet, _config: &TrainConfig, _device: Device) -> anyhow::Result<FitOutput> {
        if self.fail {
            bail!("configured to fail");
        }
        self.params = parameters.clone();
        Ok(FitOutput { parameters: parameters.clone(), num_examples: self.num_examples, metrics: Metrics::new() })
    }

    fn evaluate(&mut self, _parameters: &ParameterSet, _config: &TrainConfig, _device: Device) -> anyhow::Result<EvaluateOutput> {
        if self.fail {
            bail!("configured to fail");
        }
        Ok(EvaluateOutput { loss: 1.0, num_examples: self.num_examples, metrics: Metrics::new() })
    }
}
