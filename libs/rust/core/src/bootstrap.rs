//! Initial parameters: fresh random tensors for a declared model, or a persisted snapshot.

use std::path::PathBuf;
use std::str::FromStr;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FlError, Result};
use crate::parameters::{element_count, DType, ParameterSet, Tensor, TensorData};
use crate::snapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorSpec {
    fn f32(name: &str, shape: &[usize]) -> Self {
        Self { name: name.into(), shape: shape.to_vec(), dtype: DType::F32 }
    }
}

/// The model's declared tensor ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub tensors: Vec<TensorSpec>,
}

impl ModelSpec {
    /// `y = x · Wᵀ + b` with a single output.
    pub fn linear(features: usize) -> Self {
        Self { tensors: vec![TensorSpec::f32("linear.weight", &[1, features]), TensorSpec::f32("linear.bias", &[1])] }
    }

    /// LeNet-style CIFAR-10 network: two 5x5 convolutions and three dense layers.
    pub fn cifar_cnn() -> Self {
        Self {
            tensors: vec![
                TensorSpec::f32("conv1.weight", &[6, 3, 5, 5]),
                TensorSpec::f32("conv1.bias", &[6]),
                TensorSpec::f32("conv2.weight", &[16, 6, 5, 5]),
                TensorSpec::f32("conv2.bias", &[16]),
                TensorSpec::f32("fc1.weight", &[120, 400]),
                TensorSpec::f32("fc1.bias", &[120]),
                TensorSpec::f32("fc2.weight", &[84, 120]),
                TensorSpec::f32("fc2.bias", &[84]),
                TensorSpec::f32("fc3.weight", &[10, 84]),
                TensorSpec::f32("fc3.bias", &[10]),
            ],
        }
    }

    /// Fail unless `params` carries exactly these tensors, in this order.
    pub fn check(&self, params: &ParameterSet) -> Result<()> {
        if params.len() != self.tensors.len() {
            return Err(FlError::config(format!(
                "snapshot has {} tensors, model declares {}",
                params.len(),
                self.tensors.len()
            )));
        }
        for (i, (spec, t)) in self.tensors.iter().zip(params.iter()).enumerate() {
            if spec.name != t.name() || spec.shape != t.shape() || spec.dtype != t.dtype() {
                return Err(FlError::config(format!(
                    "tensor {i}: model declares {} {}{:?}, snapshot has {} {}{:?}",
                    spec.name,
                    spec.dtype,
                    spec.shape,
                    t.name(),
                    t.dtype(),
                    t.shape()
                )));
            }
        }
        Ok(())
    }

    /// Kaiming-uniform style initialization: weights in `±1/sqrt(fan_in)`, biases zero.
    pub fn random_parameters(&self, seed: u64) -> Result<ParameterSet> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.tensors
            .iter()
            .map(|spec| {
                let len = element_count(&spec.shape)?;
                let values: Vec<f64> = if spec.shape.len() < 2 {
                    vec![0.0; len]
                } else {
                    let fan_in = element_count(&spec.shape[1..])?.max(1) as f64;
                    let bound = 1.0 / fan_in.sqrt();
                    (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
                };
                Tensor::new(spec.name.clone(), spec.shape.clone(), TensorData::from_f64(spec.dtype, values))
            })
            .collect::<Result<Vec<_>>>()
            .map(ParameterSet::new)
    }
}

impl FromStr for ModelSpec {
    type Err = FlError;

    /// `linear:<features>` or `cifar-cnn`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            None if s == "cifar-cnn" => Ok(ModelSpec::cifar_cnn()),
            Some(("linear", n)) => {
                let features: usize =
                    n.parse().map_err(|_| FlError::config(format!("invalid feature count {n:?} in model {s:?}")))?;
                if features == 0 {
                    return Err(FlError::config("linear model needs at least one feature"));
                }
                Ok(ModelSpec::linear(features))
            }
            _ => Err(FlError::config(format!("unknown model {s:?} (expected linear:<features> or cifar-cnn)"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum InitialSource {
    Random { model: ModelSpec, seed: u64 },
    Snapshot { path: PathBuf, expected: Option<ModelSpec> },
}

pub fn load_initial_parameters(source: &InitialSource) -> Result<ParameterSet> {
    let params = match source {
        InitialSource::Random { model, seed } => {
            let params = model.random_parameters(*seed)?;
            info!(tensors = params.len(), elements = params.num_elements(), seed, "initialized_random_parameters");
            params
        }
        InitialSource::Snapshot { path, expected } => {
            let snap = snapshot::load(path).map_err(|e| FlError::config(format!("initial snapshot: {e}")))?;
            if let Some(model) = expected {
                model.check(&snap.tensors)?;
            }
            info!(path = %path.display(), tensors = snap.tensors.len(), checksum = %snap.checksum, "loaded_initial_parameters");
            snap.tensors
        }
    };
    if params.is_empty() {
        return Err(FlError::config("initial parameter set is empty"));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_init_matches_declared_shapes() {
        let model = ModelSpec::cifar_cnn();
        let params = model.random_parameters(7).unwrap();
        model.check(&params).unwrap();
        assert_eq!(params.num_elements(), 62006);
        let bound = 1.0 / (400f64).sqrt();
        if let TensorData::F32(v) = params.tensors()[4].data() {
            assert!(v.iter().all(|x| (*x as f64).abs() <= bound));
        } else {
            panic!("fc1.weight should be f32");
        }
    }

    #[test]
    fn random_init_is_reproducible() {
        let model = ModelSpec::linear(4);
        let a = model.random_parameters(11).unwrap();
        let b = model.random_parameters(11).unwrap();
        let c = model.random_parameters(12).unwrap();
        assert!(a.bit_eq(&b));
        assert!(!a.bit_eq(&c));
    }

    #[test]
    fn model_spec_parses() {
        assert_eq!("linear:3".parse::<ModelSpec>().unwrap(), ModelSpec::linear(3));
        assert_eq!("cifar-cnn".parse::<ModelSpec>().unwrap(), ModelSpec::cifar_cnn());
        assert!("linear:0".parse::<ModelSpec>().is_err());
        assert!("resnet".parse::<ModelSpec>().is_err());
    }

    #[test]
    fn snapshot_not_matching_model_is_configuration_error() {
        let dir = std::env::temp_dir().join(format!("fedround-bootstrap-{}", uuid::Uuid::new_v4().simple()));
        let path = dir.join("init.json");
        let params = ModelSpec::linear(3).random_parameters(1).unwrap();
        snapshot::save(&path, &params, None).unwrap();

        let ok = load_initial_parameters(&InitialSource::Snapshot { path: path.clone(), expected: Some(ModelSpec::linear(3)) });
        assert!(ok.unwrap().bit_eq(&params));

        let err = load_initial_parameters(&InitialSource::Snapshot { path: path.clone(), expected: Some(ModelSpec::linear(4)) })
            .unwrap_err();
        assert!(matches!(err, FlError::Configuration(_)));

        let reordered = ParameterSet::new(params.tensors().iter().rev().cloned().collect());
        snapshot::save(&path, &reordered, None).unwrap();
        let err = load_initial_parameters(&InitialSource::Snapshot { path, expected: Some(ModelSpec::linear(3)) }).unwrap_err();
        assert!(matches!(err, FlError::Configuration(_)));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
