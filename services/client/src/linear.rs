//! Reference Local Trainer: linear regression fitted by mini-batch SGD on a deterministic
//! synthetic partition.
//!
//! Every partition shares one ground-truth model (derived from the data seed) but draws its
//! inputs from a shifted range, so partitions are not identically distributed.

use anyhow::{bail, Context, Result};
use fedround_core::config::{Device, TrainConfig};
use fedround_core::protocol::Metrics;
use fedround_core::{DType, EvaluateOutput, FitOutput, LocalTrainer, ModelSpec, ParameterSet, Tensor, TensorData};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

const VALIDATION_FRACTION: f64 = 0.2;
const SPLIT_SEED: u64 = 42;
const NOISE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSpec {
    pub partition_id: u32,
    pub num_partitions: u32,
    /// Samples before the train/validation split.
    pub samples: usize,
    pub seed: u64,
}

#[derive(Debug, Clone)]
struct Sample {
    x: Vec<f64>,
    y: f64,
}

#[derive(Debug, Clone)]
pub struct SyntheticPartition {
    train: Vec<Sample>,
    validation: Vec<Sample>,
}

impl SyntheticPartition {
    pub fn generate(spec: &PartitionSpec, features: usize) -> Result<Self> {
        if spec.num_partitions == 0 || spec.partition_id >= spec.num_partitions {
            bail!("partition {} is outside 0..{}", spec.partition_id, spec.num_partitions);
        }
        if spec.samples < 2 {
            bail!("a partition needs at least 2 samples, got {}", spec.samples);
        }
        if features == 0 {
            bail!("linear model needs at least one feature");
        }
        let mut truth = StdRng::seed_from_u64(spec.seed);
        let weights: Vec<f64> = (0..features).map(|_| truth.gen_range(-2.0..2.0)).collect();
        let bias = truth.gen_range(-1.0..1.0);

        let shift = (spec.partition_id as f64 + 0.5) / spec.num_partitions as f64 - 0.5;
        let mut rng = StdRng::seed_from_u64(spec.seed ^ (spec.partition_id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut samples: Vec<Sample> = (0..spec.samples)
            .map(|_| {
                let x: Vec<f64> = (0..features).map(|_| rng.gen_range(-1.0..1.0) + shift).collect();
                let y = x.iter().zip(&weights).map(|(a, b)| a * b).sum::<f64>() + bias + rng.gen_range(-NOISE..NOISE);
                Sample { x, y }
            })
            .collect();

        samples.shuffle(&mut StdRng::seed_from_u64(SPLIT_SEED));
        let held_out = ((spec.samples as f64 * VALIDATION_FRACTION).ceil() as usize).clamp(1, spec.samples - 1);
        let validation = samples.split_off(spec.samples - held_out);
        Ok(Self { train: samples, validation })
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn validation_len(&self) -> usize {
        self.validation.len()
    }
}

pub struct LinearRegressionTrainer {
    data: SyntheticPartition,
    features: usize,
    weights: Vec<f64>,
    bias: f64,
    shuffle_seed: u64,
    epochs_run: u64,
}

impl LinearRegressionTrainer {
    /// Zero-initialized model over `features` inputs.
    pub fn new(spec: &PartitionSpec, features: usize) -> Result<Self> {
        Ok(Self {
            data: SyntheticPartition::generate(spec, features)?,
            features,
            weights: vec![0.0; features],
            bias: 0.0,
            shuffle_seed: spec.seed.wrapping_add(spec.partition_id as u64),
            epochs_run: 0,
        })
    }

    /// Size the model from the global parameters and start from them.
    pub fn from_global(spec: &PartitionSpec, global: &ParameterSet) -> Result<Self> {
        let features = match global.tensors().first().map(Tensor::shape) {
            Some([1, f]) => *f,
            other => bail!("global parameters are not a single-output linear model (first tensor shape {other:?})"),
        };
        let mut trainer = Self::new(spec, features)?;
        trainer.load(global)?;
        Ok(trainer)
    }

    pub fn partition(&self) -> &SyntheticPartition {
        &self.data
    }

    fn load(&mut self, params: &ParameterSet) -> Result<()> {
        ModelSpec::linear(self.features).check(params).context("parameters do not fit the linear model")?;
        let [weight, bias] = params.tensors() else {
            bail!("expected weight and bias tensors");
        };
        self.weights = (0..weight.len()).map(|j| weight.data().get_f64(j)).collect();
        self.bias = bias.data().get_f64(0);
        Ok(())
    }

    fn to_parameters(&self) -> Result<ParameterSet> {
        let weight = Tensor::new("linear.weight", vec![1, self.features], TensorData::from_f64(DType::F32, self.weights.clone()))?;
        let bias = Tensor::new("linear.bias", vec![1], TensorData::from_f64(DType::F32, vec![self.bias]))?;
        Ok(ParameterSet::new(vec![weight, bias]))
    }

    fn predict(&self, x: &[f64]) -> f64 {
        x.iter().zip(&self.weights).map(|(a, b)| a * b).sum::<f64>() + self.bias
    }

    /// Mean squared error and mean absolute error.
    fn score(&self, samples: &[Sample]) -> (f64, f64) {
        let (se, ae) = samples.iter().fold((0.0, 0.0), |(se, ae), s| {
            let err = self.predict(&s.x) - s.y;
            (se + err * err, ae + err.abs())
        });
        let n = samples.len() as f64;
        (se / n, ae / n)
    }
}

fn ensure_cpu(device: Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        other => bail!("device {other} is not supported by the linear trainer"),
    }
}

impl LocalTrainer for LinearRegressionTrainer {
    fn get_parameters(&self) -> ParameterSet {
        // construction only fails on an element-count mismatch, which these shapes rule out
        self.to_parameters().unwrap_or_default()
    }

    fn fit(&mut self, parameters: &ParameterSet, config: &TrainConfig, device: Device) -> Result<FitOutput> {
        ensure_cpu(device)?;
        self.load(parameters)?;
        let mut order: Vec<usize> = (0..self.data.train.len()).collect();
        for _ in 0..config.local_epochs {
            order.shuffle(&mut StdRng::seed_from_u64(self.shuffle_seed.wrapping_add(self.epochs_run)));
            for batch in order.chunks(config.batch_size.max(1)) {
                let mut grad_w = vec![0.0; self.features];
                let mut grad_b = 0.0;
                for &i in batch {
                    let sample = &self.data.train[i];
                    let err = self.predict(&sample.x) - sample.y;
                    for (g, x) in grad_w.iter_mut().zip(&sample.x) {
                        *g += err * x;
                    }
                    grad_b += err;
                }
                let step = 2.0 * config.learning_rate / batch.len() as f64;
                for (w, g) in self.weights.iter_mut().zip(&grad_w) {
                    *w -= step * g;
                }
                self.bias -= step * grad_b;
            }
            self.epochs_run += 1;
        }
        let (train_loss, _) = self.score(&self.data.train);
        if !train_loss.is_finite() {
            bail!("training diverged with learning rate {}", config.learning_rate);
        }
        Ok(FitOutput {
            parameters: self.to_parameters()?,
            num_examples: self.data.train.len() as u64,
            metrics: Metrics::from([("train_loss".to_string(), train_loss)]),
        })
    }

    fn evaluate(&mut self, parameters: &ParameterSet, _config: &TrainConfig, device: Device) -> Result<EvaluateOutput> {
        ensure_cpu(device)?;
        self.load(parameters)?;
        let (loss, mae) = self.score(&self.data.validation);
        Ok(EvaluateOutput {
            loss,
            num_examples: self.data.validation.len() as u64,
            metrics: Metrics::from([("mae".to_string(), mae)]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedround_core::aggregate_fit;
    use fedround_core::protocol::FitResult;

    fn spec(partition_id: u32) -> PartitionSpec {
        PartitionSpec { partition_id, num_partitions: 4, samples: 200, seed: 7 }
    }

    fn config(local_epochs: u32) -> TrainConfig {
        TrainConfig { local_epochs, learning_rate: 0.05, batch_size: 16 }
    }

    #[test]
    fn split_is_eighty_twenty() {
        let p = SyntheticPartition::generate(&spec(0), 3).unwrap();
        assert_eq!(p.train_len(), 160);
        assert_eq!(p.validation_len(), 40);
        assert!(SyntheticPartition::generate(&PartitionSpec { partition_id: 4, ..spec(0) }, 3).is_err());
        assert!(SyntheticPartition::generate(&PartitionSpec { samples: 1, ..spec(0) }, 3).is_err());
    }

    #[test]
    fn partitions_are_deterministic() {
        let mut a = LinearRegressionTrainer::new(&spec(1), 3).unwrap();
        let mut b = LinearRegressionTrainer::new(&spec(1), 3).unwrap();
        let start = a.get_parameters();
        let fa = a.fit(&start, &config(2), Device::Cpu).unwrap();
        let fb = b.fit(&start, &config(2), Device::Cpu).unwrap();
        assert!(fa.parameters.bit_eq(&fb.parameters));
    }

    #[test]
    fn training_lowers_validation_loss() {
        let mut t = LinearRegressionTrainer::new(&spec(0), 3).unwrap();
        let start = t.get_parameters();
        let before = t.evaluate(&start, &config(1), Device::Cpu).unwrap();
        let fit = t.fit(&start, &config(20), Device::Cpu).unwrap();
        let after = t.evaluate(&fit.parameters, &config(1), Device::Cpu).unwrap();
        assert!(after.loss < before.loss / 10.0, "{} -> {}", before.loss, after.loss);
        assert!(after.metrics["mae"] < 0.2);
        assert_eq!(fit.num_examples, 160);
        assert_eq!(after.num_examples, 40);
    }

    #[test]
    fn federated_average_of_partitions_generalizes() {
        let start = ModelSpec::linear(3).random_parameters(1).unwrap();
        let results: Vec<FitResult> = (0..4)
            .map(|p| {
                let mut t = LinearRegressionTrainer::new(&spec(p), 3).unwrap();
                let out = t.fit(&start, &config(10), Device::Cpu).unwrap();
                FitResult { client_id: format!("{p}").into(), parameters: out.parameters, num_examples: out.num_examples, metrics: out.metrics }
            })
            .collect();
        let global = aggregate_fit(&results).unwrap();
        for p in 0..4 {
            let mut t = LinearRegressionTrainer::new(&spec(p), 3).unwrap();
            let eval = t.evaluate(&global, &config(1), Device::Cpu).unwrap();
            assert!(eval.loss < 0.1, "partition {p}: {}", eval.loss);
        }
    }

    #[test]
    fn rejects_foreign_layouts_and_devices() {
        let cnn = ModelSpec::cifar_cnn().random_parameters(0).unwrap();
        assert!(LinearRegressionTrainer::from_global(&spec(0), &cnn).is_err());
        let mut t = LinearRegressionTrainer::new(&spec(0), 3).unwrap();
        let wrong = ModelSpec::linear(4).random_parameters(0).unwrap();
        assert!(t.fit(&wrong, &config(1), Device::Cpu).is_err());
        let own = t.get_parameters();
        assert!(t.fit(&own, &config(1), Device::Cuda(0)).is_err());
    }

    #[test]
    fn from_global_adopts_the_global_parameters() {
        let global = ModelSpec::linear(5).random_parameters(3).unwrap();
        let t = LinearRegressionTrainer::from_global(&spec(2), &global).unwrap();
        let own = t.get_parameters();
        assert!(own.bit_eq(&global));
    }
}
