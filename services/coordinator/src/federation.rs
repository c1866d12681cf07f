use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use fedround_core::{clear_ready, mark_ready, Coordinator, CoordinatorHandle, ParameterSet, RunSummary, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::http::{router, AppState};

const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound HTTP listener plus the coordinator it fronts.
pub struct Federation {
    listener: TcpListener,
    coordinator: Coordinator,
    handle: CoordinatorHandle,
    http: reqwest::Client,
}

impl Federation {
    pub async fn bind(addr: SocketAddr, config: ServerConfig, initial: ParameterSet) -> Result<Self> {
        let (coordinator, handle) = Coordinator::new(config, initial)?;
        let http = reqwest::Client::builder().connect_timeout(CLIENT_CONNECT_TIMEOUT).build()?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "federation_module_initialized");
        Ok(Self { listener, coordinator, handle, http })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Serve the transport while the coordinator runs; stop serving once it terminates.
    pub async fn run(self) -> Result<RunSummary> {
        let Federation { listener, coordinator, handle, http } = self;
        let app = router(AppState { handle, http });
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
        });
        mark_ready();
        let summary = coordinator.run().await;
        clear_ready();
        let _ = stop.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "http_server_error"),
            Err(e) => warn!(error = %e, "http_server_task_failed"),
        }
        info!(state = ?summary.state, round = summary.round, "federation_module_shutdown");
        Ok(summary)
    }
}
