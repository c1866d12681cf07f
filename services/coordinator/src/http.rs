//! Coordinator-side HTTP routes.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fedround_core::protocol::{ConnectRequest, DisconnectRequest, SessionAck};
use fedround_core::{metrics, CoordinatorHandle, RemoteClientProxy};
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub handle: CoordinatorHandle,
    /// Shared by every `RemoteClientProxy`.
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/connect", post(connect))
        .route("/v1/disconnect", post(disconnect))
        .route("/v1/parameters", get(parameters))
        .route("/v1/status", get(status))
        .route("/metrics", get(metrics_text))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn connect(State(st): State<AppState>, Json(req): Json<ConnectRequest>) -> (StatusCode, Json<SessionAck>) {
    if let Err(e) = reqwest::Url::parse(&req.endpoint) {
        let round = st.handle.status().round;
        let ack = SessionAck::rejected(req.client_id, round, format!("invalid endpoint {:?}: {e}", req.endpoint));
        return (StatusCode::BAD_REQUEST, Json(ack));
    }
    info!(client_id = %req.client_id, endpoint = %req.endpoint, "connect_request");
    let proxy = Arc::new(RemoteClientProxy::new(req.client_id, &req.endpoint, st.http.clone()));
    let ack = st.handle.connect(proxy).await;
    let code = if ack.accepted { StatusCode::OK } else { StatusCode::CONFLICT };
    (code, Json(ack))
}

async fn disconnect(State(st): State<AppState>, Json(req): Json<DisconnectRequest>) -> StatusCode {
    let reason = req.reason.unwrap_or_else(|| "client requested disconnect".into());
    if st.handle.disconnect(req.client_id, reason).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn parameters(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.handle.parameters())
}

async fn status(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.handle.status())
}

async fn metrics_text() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], metrics::encode())
}

async fn live() -> impl IntoResponse {
    Json(serde_json::json!({ "live": fedround_core::is_live() }))
}

async fn ready(State(st): State<AppState>) -> impl IntoResponse {
    let state = st.handle.status().state;
    let ready = fedround_core::is_ready() && !state.is_terminal();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(serde_json::json!({ "ready": ready, "state": state })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use fedround_core::protocol::StatusResponse;
    use fedround_core::{Coordinator, CoordinatorState, ParameterSet, ServerConfig, Tensor, TensorData};
    use tower::ServiceExt;

    fn app() -> (Router, Coordinator) {
        let params = ParameterSet::new(vec![Tensor::new("w", vec![2], TensorData::F32(vec![0.5, -0.5])).unwrap()]);
        let (coordinator, handle) = Coordinator::new(ServerConfig::default(), params).unwrap();
        (router(AppState { handle, http: reqwest::Client::new() }), coordinator)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_idle_before_run() {
        let (app, _coordinator) = app();
        let resp = app.oneshot(Request::get("/v1/status").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status: StatusResponse = body_json(resp).await;
        assert_eq!(status.state, CoordinatorState::Idle);
        assert_eq!(status.num_rounds, 5);
        assert_eq!(status.connected_clients, 0);
    }

    #[tokio::test]
    async fn parameters_round_trip_over_json() {
        let (app, _coordinator) = app();
        let resp = app.oneshot(Request::get("/v1/parameters").body(Body::empty()).unwrap()).await.unwrap();
        let params: ParameterSet = body_json(resp).await;
        assert_eq!(params.len(), 1);
        assert_eq!(params.tensors()[0].data().get_f64(1), -0.5);
    }

    #[tokio::test]
    async fn connect_with_bad_endpoint_is_rejected() {
        let (app, _coordinator) = app();
        let body = serde_json::json!({ "client_id": "7", "endpoint": "not a url" }).to_string();
        let req = Request::post("/v1/connect").header(header::CONTENT_TYPE, "application/json").body(Body::from(body)).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let ack: SessionAck = body_json(resp).await;
        assert!(!ack.accepted);
    }

    #[tokio::test]
    async fn metrics_are_exposed_as_text() {
        let (app, _coordinator) = app();
        let resp = app.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = String::from_utf8(to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
        assert!(text.contains("fedround_connected_clients"));
    }
}
