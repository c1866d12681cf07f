//! Client process lifecycle: fetch the global model, serve the trainer, register, and wait
//! for the coordinator to end the run.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fedround_core::protocol::{ConnectRequest, DisconnectRequest, SessionAck, ShutdownNotice};
use fedround_core::{ClientId, Device, LocalClientProxy, ParameterSet};
use fedround_resilience::{retry_async, RetryConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::linear::{LinearRegressionTrainer, PartitionSpec};
use crate::server::{router, ClientState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Coordinator base URL.
    pub server: String,
    pub client_id: ClientId,
    pub partition: PartitionSpec,
    pub listen: SocketAddr,
    /// Host the coordinator should use to reach this client.
    pub advertise_host: String,
    pub device: Device,
    pub retry: RetryConfig,
}

#[derive(Debug)]
pub enum ClientExit {
    /// The coordinator ended the run.
    Shutdown(ShutdownNotice),
    /// Interrupted locally before the run ended.
    Interrupted,
}

pub async fn run_client(opts: ClientOptions) -> Result<ClientExit> {
    run_client_until(opts, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Like [`run_client`], with `interrupt` standing in for Ctrl-C.
pub async fn run_client_until<F>(opts: ClientOptions, interrupt: F) -> Result<ClientExit>
where
    F: std::future::Future<Output = ()>,
{
    let server = opts.server.trim_end_matches('/').to_string();
    let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

    let global: ParameterSet = retry_async(&opts.retry, |attempt| {
        let http = http.clone();
        let url = format!("{server}/v1/parameters");
        async move {
            if attempt > 0 {
                info!(attempt, "retrying_parameter_fetch");
            }
            let resp = http.get(url).send().await?.error_for_status()?;
            anyhow::Ok(resp.json::<ParameterSet>().await?)
        }
    })
    .await
    .context("fetching global parameters")?;

    let trainer = LinearRegressionTrainer::from_global(&opts.partition, &global)?;
    info!(
        partition = opts.partition.partition_id,
        train = trainer.partition().train_len(),
        validation = trainer.partition().validation_len(),
        "partition_loaded"
    );
    let proxy = LocalClientProxy::new(opts.client_id.clone(), trainer).with_device(opts.device);
    let (state, notice) = ClientState::new(Arc::new(proxy));

    let listener = TcpListener::bind(opts.listen).await?;
    let port = listener.local_addr()?.port();
    let endpoint = format!("http://{}:{port}", opts.advertise_host);
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                let _ = stopped.await;
            })
            .await
    });

    let outcome = serve_session(&http, &server, &opts, endpoint, notice, interrupt).await;
    let _ = stop.send(());
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "http_server_error"),
        Err(e) => warn!(error = %e, "http_server_task_failed"),
    }
    outcome
}

async fn serve_session<F>(
    http: &reqwest::Client,
    server: &str,
    opts: &ClientOptions,
    endpoint: String,
    notice: oneshot::Receiver<ShutdownNotice>,
    interrupt: F,
) -> Result<ClientExit>
where
    F: std::future::Future<Output = ()>,
{
    let req = ConnectRequest { client_id: opts.client_id.clone(), endpoint };
    let ack: SessionAck = retry_async(&opts.retry, |_| {
        let http = http.clone();
        let url = format!("{server}/v1/connect");
        let req = req.clone();
        // a rejection carries a SessionAck body too, so decode regardless of status
        async move { anyhow::Ok(http.post(url).json(&req).send().await?.json::<SessionAck>().await?) }
    })
    .await
    .context("connecting to the coordinator")?;
    if !ack.accepted {
        bail!("coordinator rejected {}: {}", ack.client_id, ack.message);
    }
    info!(client_id = %ack.client_id, connection_id = ?ack.connection_id, round = ack.round, endpoint = %req.endpoint, "connected");

    tokio::select! {
        received = notice => match received {
            Ok(notice) => {
                info!(state = ?notice.state, reason = %notice.reason, "run_ended");
                Ok(ClientExit::Shutdown(notice))
            }
            Err(_) => bail!("shutdown channel closed without a notice"),
        },
        _ = interrupt => {
            info!("interrupted");
            let body = DisconnectRequest { client_id: opts.client_id.clone(), reason: Some("client interrupted".into()) };
            if let Err(e) = http.post(format!("{server}/v1/disconnect")).json(&body).send().await {
                warn!(error = %e, "disconnect_failed");
            }
            Ok(ClientExit::Interrupted)
        }
    }
}
