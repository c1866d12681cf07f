//! Client-side HTTP routes answering the coordinator's instructions.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fedround_core::protocol::{EvaluateIns, FitIns, ShutdownNotice};
use fedround_core::{ClientError, ClientProxy};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ClientState {
    pub proxy: Arc<dyn ClientProxy>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<ShutdownNotice>>>>,
}

impl ClientState {
    /// State plus the receiver that resolves when the coordinator ends the run.
    pub fn new(proxy: Arc<dyn ClientProxy>) -> (Self, oneshot::Receiver<ShutdownNotice>) {
        let (tx, rx) = oneshot::channel();
        (Self { proxy, shutdown: Arc::new(Mutex::new(Some(tx))) }, rx)
    }
}

struct ApiError(ClientError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "trainer_request_failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl From<ClientError> for ApiError {
    fn from(e: ClientError) -> Self {
        Self(e)
    }
}

pub fn router(state: ClientState) -> Router {
    Router::new()
        .route("/v1/parameters", get(parameters))
        .route("/v1/fit", post(fit))
        .route("/v1/evaluate", post(evaluate))
        .route("/v1/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn parameters(State(st): State<ClientState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(st.proxy.get_parameters().await?))
}

async fn fit(State(st): State<ClientState>, Json(ins): Json<FitIns>) -> Result<impl IntoResponse, ApiError> {
    let round = ins.round;
    let result = st.proxy.fit(ins).await?;
    info!(round, num_examples = result.num_examples, "fit_done");
    Ok(Json(result))
}

async fn evaluate(State(st): State<ClientState>, Json(ins): Json<EvaluateIns>) -> Result<impl IntoResponse, ApiError> {
    let round = ins.round;
    let result = st.proxy.evaluate(ins).await?;
    info!(round, loss = result.loss, num_examples = result.num_examples, "evaluate_done");
    Ok(Json(result))
}

async fn shutdown(State(st): State<ClientState>, Json(notice): Json<ShutdownNotice>) -> StatusCode {
    info!(state = ?notice.state, reason = %notice.reason, "shutdown_notice");
    if let Some(tx) = st.shutdown.lock().take() {
        let _ = tx.send(notice);
    }
    StatusCode::NO_CONTENT
}
