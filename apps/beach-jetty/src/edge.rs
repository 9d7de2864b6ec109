//! Edge HTTP surface.
//!
//! Every request lands in one fallback handler keyed by `Host`. Upgrade
//! requests for routable sandboxes are proxied; everything else is traffic
//! the routing layer could not deliver and gets the health engine's answer.

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jetty_proto::host::parse_host;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::generator::EDGE_HEALTH_PATH;
use crate::health::{BodyFormat, HealthEngine, HealthResponse, UnhealthySignal};
use crate::registry::SandboxDirectory;
use crate::websocket::{proxy_upgrade, PairView, ProxySettings, RelayRegistry, UpgradeRequest};

pub struct EdgeState {
    pub domain: String,
    pub directory: Arc<SandboxDirectory>,
    pub health: Arc<HealthEngine>,
    pub relay: RelayRegistry,
    pub proxy: ProxySettings,
    pub metrics: Option<PrometheusHandle>,
}

pub fn edge_router(state: Arc<EdgeState>) -> Router {
    Router::new()
        .fallback(edge_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Operator endpoints, served on a separate listener from sandbox traffic.
pub fn admin_router(state: Arc<EdgeState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/debug/stats", get(stats_handler))
        .with_state(state)
}

fn request_host<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
}

async fn edge_handler(
    State(state): State<Arc<EdgeState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    ws: Option<WebSocketUpgrade>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let host = request_host(&headers, &uri).unwrap_or_default().to_string();
    let target = match parse_host(&host, &state.domain) {
        Ok(target) => target,
        // Proxies health-check the edge cluster with their own host name.
        Err(_) if uri.path() == EDGE_HEALTH_PATH => return (StatusCode::OK, "ok").into_response(),
        Err(err) => {
            debug!(host = %host, error = %err, "request for unknown host");
            metrics::counter!("jetty_edge_unknown_host_total", 1);
            let retry_after = state.health.settings().default_retry_after;
            return HealthResponse::unknown_host(&host, retry_after).into_response();
        }
    };

    let upstream = state
        .directory
        .lookup(&target.sandbox_id)
        .and_then(|record| record.upstream_for(&target.region, target.port));

    match (ws, upstream) {
        (Some(ws), Some(upstream)) => {
            proxy_upgrade(
                ws,
                state.relay.clone(),
                state.proxy.clone(),
                UpgradeRequest {
                    target,
                    upstream,
                    uri,
                    headers,
                    client_addr: connect.map(|ConnectInfo(addr)| addr),
                },
            )
            .await
        }
        (_, upstream) => {
            // A routable target only reaches the edge when its upstream failed.
            let signal = if upstream.is_some() {
                UnhealthySignal::UpstreamUnavailable
            } else {
                UnhealthySignal::NoRoute
            };
            state
                .health
                .respond(&target, signal, BodyFormat::from_headers(&headers))
                .into_response()
        }
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<EdgeState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_pairs: usize,
    total_pairs: u64,
    directory_size: usize,
    directory_stale: bool,
    pairs: Vec<PairView>,
}

async fn stats_handler(State(state): State<Arc<EdgeState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        active_pairs: state.relay.active(),
        total_pairs: state.relay.opened(),
        directory_size: state.directory.len(),
        directory_stale: state.directory.is_stale(),
        pairs: state.relay.snapshot(),
    })
}
