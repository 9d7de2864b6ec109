//! Process wiring: registry construction, listeners and shutdown.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ads::AggregatedDiscoveryServer;
use crate::config::{ControlPlaneConfig, EdgeConfig, RegistrySource};
use crate::coordinator::PushCoordinator;
use crate::discovery::{self, ControlPlaneState};
use crate::edge::{admin_router, edge_router, EdgeState};
use crate::health::HealthEngine;
use crate::registry::{InMemoryRegistry, RedisRegistry, RegistryHandle, SandboxDirectory};
use crate::session::SessionManager;
use crate::wake::{HttpWaker, NoopWaker, SandboxWaker, WakeTrigger};
use crate::websocket::RelayRegistry;

pub async fn build_registry(source: &RegistrySource) -> Result<RegistryHandle> {
    let registry: RegistryHandle = match source {
        RegistrySource::Redis(url) => RedisRegistry::connect(url)
            .await
            .context("failed to connect to the redis registry")?,
        RegistrySource::Seed(path) => InMemoryRegistry::from_seed_file(path)
            .with_context(|| format!("failed to load seed file {}", path.display()))?,
        RegistrySource::Empty => {
            warn!("no registry configured; every sandbox lookup will miss");
            InMemoryRegistry::new()
        }
    };
    Ok(registry)
}

/// Cancels the returned token on Ctrl-C.
pub fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        trigger.cancel();
    });
    cancel
}

async fn bind(addr: SocketAddr, what: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {what} listener on {addr}"))
}

pub async fn run_control_plane(
    config: ControlPlaneConfig,
    registry: RegistryHandle,
    metrics: Option<PrometheusHandle>,
    cancel: CancellationToken,
) -> Result<()> {
    let coordinator = PushCoordinator::new(registry, config.generator, config.coordinator);
    let coordinator_task = coordinator.spawn(cancel.clone());
    let sessions = SessionManager::new(config.session);
    let ads = AggregatedDiscoveryServer::new(coordinator.clone(), sessions.clone(), cancel.clone());
    let router = discovery::router(ControlPlaneState {
        coordinator,
        sessions: sessions.clone(),
        metrics,
    });

    let grpc_listener = bind(config.listen_addr, "control plane").await?;
    let http_listener = bind(config.http_addr, "control plane http").await?;
    info!(
        addr = %config.listen_addr,
        http_addr = %config.http_addr,
        websocket_path = discovery::DISCOVERY_PATH,
        "control plane listening"
    );
    let grpc = async {
        let result = ads.serve(grpc_listener).await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    };
    let http = async {
        let result = axum::serve(http_listener, router)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    };
    let (grpc_result, http_result) = tokio::join!(grpc, http);
    grpc_result.context("aggregated discovery server failed")?;
    http_result.context("control plane http server failed")?;

    wait_for_drain("discovery sessions", config.shutdown_grace, || sessions.len()).await;
    if let Err(err) = coordinator_task.await {
        warn!(error = %err, "push coordinator task failed");
    }
    info!("control plane stopped");
    Ok(())
}

pub async fn run_edge(
    config: EdgeConfig,
    registry: RegistryHandle,
    metrics: Option<PrometheusHandle>,
    cancel: CancellationToken,
) -> Result<()> {
    let directory = SandboxDirectory::new();
    let sync_task = directory.spawn_sync(registry, config.resync_interval, cancel.clone());

    let waker: Arc<dyn SandboxWaker> = match &config.wake_url {
        Some(url) => Arc::new(
            HttpWaker::new(url.clone(), config.wake_timeout)
                .context("failed to build wake client")?,
        ),
        None => {
            info!("no wake endpoint configured; hibernating sandboxes will not be woken");
            Arc::new(NoopWaker)
        }
    };
    let wakes = WakeTrigger::new(waker, config.health.wake_dedup_ttl);
    let relay = RelayRegistry::new();
    let state = Arc::new(EdgeState {
        domain: config.domain.clone(),
        directory: directory.clone(),
        health: Arc::new(HealthEngine::new(directory, config.health.clone(), wakes)),
        relay: relay.clone(),
        proxy: config.proxy.clone(),
        metrics,
    });

    let edge_listener = bind(config.listen_addr, "edge").await?;
    let admin_listener = bind(config.admin_addr, "admin").await?;
    info!(
        addr = %config.listen_addr,
        admin_addr = %config.admin_addr,
        domain = %config.domain,
        "edge listening"
    );

    let edge = axum::serve(
        edge_listener,
        edge_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.clone().cancelled_owned());
    let admin = axum::serve(admin_listener, admin_router(state))
        .with_graceful_shutdown(cancel.clone().cancelled_owned());
    let (edge_result, admin_result) = tokio::join!(async { edge.await }, async { admin.await });
    edge_result.context("edge server failed")?;
    admin_result.context("admin server failed")?;

    wait_for_drain("websocket pairs", config.shutdown_grace, || relay.active()).await;
    if let Err(err) = sync_task.await {
        warn!(error = %err, "directory sync task failed");
    }
    info!("edge stopped");
    Ok(())
}

/// Runs the control plane and the edge over one registry connection.
pub async fn run_all(
    control_plane: ControlPlaneConfig,
    edge: EdgeConfig,
    metrics: Option<PrometheusHandle>,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = build_registry(&control_plane.registry).await?;
    // Either side failing takes the other down with it.
    let control_plane = async {
        let result =
            run_control_plane(control_plane, registry.clone(), metrics.clone(), cancel.clone())
                .await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    };
    let edge = async {
        let result = run_edge(edge, registry.clone(), metrics.clone(), cancel.clone()).await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    };
    let (control_plane_result, edge_result) = tokio::join!(control_plane, edge);
    control_plane_result?;
    edge_result
}

/// Gives long-lived streams up to `grace` to finish after the listener stops.
async fn wait_for_drain(what: &str, grace: Duration, remaining: impl Fn() -> usize) {
    let deadline = Instant::now() + grace;
    while remaining() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let left = remaining();
    if left > 0 {
        warn!(
            streams = what,
            remaining = left,
            grace_seconds = grace.as_secs(),
            "shutdown grace elapsed with streams still open"
        );
    }
}
