//! HTTP surface of the control plane: health, metrics and debug endpoints,
//! plus aggregated discovery as JSON frames over a WebSocket for tooling
//! that cannot speak gRPC. Proxies use the gRPC service in `ads`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use jetty_proto::discovery::{DiscoveryRequest, DiscoveryResponse};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::coordinator::PushCoordinator;
use crate::session::{SessionError, SessionManager, SessionSummary};

pub const DISCOVERY_PATH: &str = "/v3/discovery/aggregated";

#[derive(Clone)]
pub struct ControlPlaneState {
    pub coordinator: Arc<PushCoordinator>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: ControlPlaneState) -> Router {
    Router::new()
        .route(DISCOVERY_PATH, get(discovery_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/debug/sessions", get(debug_sessions))
        .route("/debug/snapshot", get(debug_snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn discovery_handler(
    ws: WebSocketUpgrade,
    State(state): State<ControlPlaneState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_stream(socket, state))
}

async fn serve_stream(socket: WebSocket, state: ControlPlaneState) {
    let (sink, stream) = socket.split();
    let tx = sink
        .sink_map_err(|err| SessionError::Transport(err.to_string()))
        .with(|response: DiscoveryResponse| future::ready(encode_response(&response)));
    let rx = stream.filter_map(|frame| future::ready(decode_frame(frame)));
    futures_util::pin_mut!(tx);
    futures_util::pin_mut!(rx);

    // Outcome is logged by the session manager.
    let _ = state.sessions.serve(&state.coordinator, tx, rx).await;
}

fn encode_response(response: &DiscoveryResponse) -> Result<Message, SessionError> {
    serde_json::to_string(response)
        .map(Message::Text)
        .map_err(|err| SessionError::Encode(err.to_string()))
}

/// Maps a WebSocket frame onto a request. Control frames yield nothing; the
/// stream ends after the peer's close frame.
fn decode_frame(
    frame: Result<Message, axum::Error>,
) -> Option<Result<DiscoveryRequest, SessionError>> {
    match frame {
        Ok(Message::Text(text)) => Some(
            serde_json::from_str(&text).map_err(|err| SessionError::Decode(err.to_string())),
        ),
        Ok(Message::Binary(bytes)) => Some(
            serde_json::from_slice(&bytes).map_err(|err| SessionError::Decode(err.to_string())),
        ),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Ok(Message::Close(frame)) => {
            debug!(?frame, "discovery client sent close");
            None
        }
        Err(err) => Some(Err(SessionError::Transport(err.to_string()))),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<ControlPlaneState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn debug_sessions(State(state): State<ControlPlaneState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.summaries())
}

#[derive(Debug, Serialize)]
struct SnapshotView {
    version: u64,
    stale: bool,
    generated_at: chrono::DateTime<chrono::Utc>,
    cluster_digest: String,
    route_digest: String,
    clusters: usize,
    virtual_hosts: usize,
}

async fn debug_snapshot(State(state): State<ControlPlaneState>) -> Json<SnapshotView> {
    let snapshot = state.coordinator.current();
    Json(SnapshotView {
        version: snapshot.version,
        stale: snapshot.stale,
        generated_at: snapshot.generated_at,
        cluster_digest: snapshot.cluster_digest.clone(),
        route_digest: snapshot.route_digest.clone(),
        clusters: snapshot.clusters.len(),
        virtual_hosts: snapshot.routes.virtual_hosts.len(),
    })
}
