//! Coordinator-side handles to clients, polymorphic over GetParameters / Fit / Evaluate.
//!
//! `RemoteClientProxy` speaks JSON over HTTP to a client process; `LocalClientProxy`
//! drives a `LocalTrainer` in-process, which is how the round engine is exercised without
//! a network.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::config::Device;
use crate::error::ClientError;
use crate::parameters::ParameterSet;
use crate::protocol::{ClientId, EvaluateIns, EvaluateResult, FitIns, FitResult, ShutdownNotice};
use crate::trainer::LocalTrainer;

#[async_trait]
pub trait ClientProxy: Send + Sync {
    fn client_id(&self) -> &ClientId;

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError>;

    async fn fit(&self, ins: FitIns) -> Result<FitResult, ClientError>;

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateResult, ClientError>;

    /// Tell the client the run is over. Best effort.
    async fn shutdown(&self, notice: ShutdownNotice) -> Result<(), ClientError>;
}

pub struct RemoteClientProxy {
    client_id: ClientId,
    endpoint: String,
    http: reqwest::Client,
}

impl RemoteClientProxy {
    pub fn new(client_id: ClientId, endpoint: &str, http: reqwest::Client) -> Self {
        Self { client_id, endpoint: endpoint.trim_end_matches('/').to_string(), http }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn decode<O: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<O, ClientError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Remote(format!("{status}: {body}")));
        }
        resp.json::<O>().await.map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn post<I: Serialize + ?Sized, O: DeserializeOwned>(&self, path: &str, body: &I) -> Result<O, ClientError> {
        debug!(client_id = %self.client_id, path, "client_request");
        let resp = self.http.post(self.url(path)).json(body).send().await.map_err(transport_error)?;
        self.decode(resp).await
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Transport(e.to_string())
    }
}

#[async_trait]
impl ClientProxy for RemoteClientProxy {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
        let resp = self.http.get(self.url("/v1/parameters")).send().await.map_err(transport_error)?;
        self.decode(resp).await
    }

    async fn fit(&self, ins: FitIns) -> Result<FitResult, ClientError> {
        self.post("/v1/fit", &ins).await
    }

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateResult, ClientError> {
        self.post("/v1/evaluate", &ins).await
    }

    async fn shutdown(&self, notice: ShutdownNotice) -> Result<(), ClientError> {
        let resp = self.http.post(self.url("/v1/shutdown")).json(&notice).send().await.map_err(transport_error)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Remote(resp.status().to_string()))
        }
    }
}

/// In-process client wrapping a `LocalTrainer`. Trainer calls run on the blocking pool.
pub struct LocalClientProxy<T: LocalTrainer> {
    client_id: ClientId,
    trainer: Arc<Mutex<T>>,
    device: Device,
}

impl<T: LocalTrainer> LocalClientProxy<T> {
    pub fn new(client_id: ClientId, trainer: T) -> Self {
        Self { client_id, trainer: Arc::new(Mutex::new(trainer)), device: Device::Cpu }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    async fn run<R, F>(&self, f: F) -> Result<R, ClientError>
    where
        R: Send + 'static,
        F: FnOnce(&mut T, Device) -> anyhow::Result<R> + Send + 'static,
    {
        let trainer = Arc::clone(&self.trainer);
        let device = self.device;
        tokio::task::spawn_blocking(move || {
            let mut guard = trainer.lock();
            f(&mut *guard, device)
        })
        .await
        .map_err(|e| ClientError::Remote(format!("trainer task failed: {e}")))?
        .map_err(|e| ClientError::Remote(format!("{e:#}")))
    }
}

#[async_trait]
impl<T: LocalTrainer> ClientProxy for LocalClientProxy<T> {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
        self.run(|t, _| Ok(t.get_parameters())).await
    }

    async fn fit(&self, ins: FitIns) -> Result<FitResult, ClientError> {
        let client_id = self.client_id.clone();
        self.run(move |t, device| {
            let out = t.fit(&ins.parameters, &ins.config, device)?;
            Ok(FitResult { client_id, parameters: out.parameters, num_examples: out.num_examples, metrics: out.metrics })
        })
        .await
    }

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateResult, ClientError> {
        let client_id = self.client_id.clone();
        self.run(move |t, device| {
            let out = t.evaluate(&ins.parameters, &ins.config, device)?;
            Ok(EvaluateResult { client_id, loss: out.loss, num_examples: out.num_examples, metrics: out.metrics })
        })
        .await
    }

    async fn shutdown(&self, notice: ShutdownNotice) -> Result<(), ClientError> {
        debug!(client_id = %self.client_id, reason = %notice.reason, "local_client_shutdown");
        Ok(())
    }
}
