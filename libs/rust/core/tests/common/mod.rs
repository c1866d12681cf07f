//! Scripted clients for driving the coordinator without a network.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedround_core::protocol::{EvaluateIns, EvaluateResult, FitIns, FitResult, Metrics, ShutdownNotice};
use fedround_core::{ClientError, ClientId, ClientProxy, Coordinator, ParameterSet, RunSummary, ServerConfig, Tensor, TensorData};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub enum Behavior {
    Honest,
    /// Sleeps before answering fit and evaluate.
    Slow(Duration),
    FailFit,
    WrongShape(Vec<Vec<usize>>),
    ZeroExamples,
}

pub struct ScriptedClient {
    id: ClientId,
    value: f32,
    num_examples: u64,
    layout: Vec<Vec<usize>>,
    behavior: Behavior,
    fit_calls: AtomicUsize,
    evaluate_calls: AtomicUsize,
    shutdowns: Mutex<Vec<ShutdownNotice>>,
}

impl ScriptedClient {
    /// Answers every fit with all elements set to `value`, and every evaluate with loss `value`.
    pub fn new(id: &str, value: f32, num_examples: u64, layout: &[Vec<usize>]) -> Self {
        Self {
            id: ClientId::from(id),
            value,
            num_examples,
            layout: layout.to_vec(),
            behavior: Behavior::Honest,
            fit_calls: AtomicUsize::new(0),
            evaluate_calls: AtomicUsize::new(0),
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn fit_calls(&self) -> usize {
        self.fit_calls.load(Ordering::SeqCst)
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> Vec<ShutdownNotice> {
        self.shutdowns.lock().clone()
    }
}

pub fn filled(layout: &[Vec<usize>], value: f32) -> ParameterSet {
    layout
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            let n = shape.iter().product();
            Tensor::new(format!("layer{i}"), shape.clone(), TensorData::F32(vec![value; n])).unwrap()
        })
        .collect()
}

#[async_trait]
impl ClientProxy for ScriptedClient {
    fn client_id(&self) -> &ClientId {
        &self.id
    }

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
        Ok(filled(&self.layout, 0.0))
    }

    async fn fit(&self, ins: FitIns) -> Result<FitResult, ClientError> {
        self.fit_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(ins.parameters.len(), self.layout.len());
        let mut parameters = filled(&self.layout, self.value);
        let mut num_examples = self.num_examples;
        match &self.behavior {
            Behavior::Honest => {}
            Behavior::Slow(d) => tokio::time::sleep(*d).await,
            Behavior::FailFit => return Err(ClientError::Remote("scripted failure".into())),
            Behavior::WrongShape(shapes) => parameters = filled(shapes, self.value),
            Behavior::ZeroExamples => num_examples = 0,
        }
        let metrics = Metrics::from([("train_loss".to_string(), self.value as f64)]);
        Ok(FitResult { client_id: self.id.clone(), parameters, num_examples, metrics })
    }

    async fn evaluate(&self, _ins: EvaluateIns) -> Result<EvaluateResult, ClientError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        if let Behavior::Slow(d) = &self.behavior {
            tokio::time::sleep(*d).await;
        }
        Ok(EvaluateResult {
            client_id: self.id.clone(),
            loss: self.value as f64,
            num_examples: self.num_examples,
            metrics: Metrics::new(),
        })
    }

    async fn shutdown(&self, notice: ShutdownNotice) -> Result<(), ClientError> {
        self.shutdowns.lock().push(notice);
        Ok(())
    }
}

/// Small timeouts and delays; every minimum set to `clients`.
pub fn fast_config(num_rounds: u64, clients: usize) -> ServerConfig {
    ServerConfig {
        num_rounds,
        min_fit_clients: clients,
        min_evaluate_clients: clients,
        min_available_clients: clients,
        fit_timeout_ms: 2_000,
        evaluate_timeout_ms: 2_000,
        poll_interval_ms: 10,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 40,
        ..ServerConfig::default()
    }
}

/// Start the coordinator, connect every client, and wait for the run to end.
pub async fn run_with(config: ServerConfig, initial: ParameterSet, clients: &[Arc<ScriptedClient>]) -> RunSummary {
    let (coordinator, handle) = Coordinator::new(config, initial).expect("valid configuration");
    let run = tokio::spawn(coordinator.run());
    for client in clients {
        let ack = handle.connect(client.clone()).await;
        assert!(ack.accepted, "{}: {}", ack.client_id, ack.message);
    }
    tokio::time::timeout(Duration::from_secs(30), run).await.expect("run did not finish").expect("run task panicked")
}
