//! Per-proxy discovery sessions.
//!
//! Each connected proxy gets one task that tracks, per resource type, what
//! was last pushed and whether the proxy accepted it. At most one push per
//! type is outstanding; a newer snapshot waits until the proxy ACKs or NACKs
//! the previous one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use jetty_proto::discovery::{DiscoveryRequest, DiscoveryResponse, Node};
use jetty_proto::resources::ResourceType;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coordinator::{PushCoordinator, ResourceSnapshot};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stream closed before the first request")]
    ClosedBeforeRequest,
    #[error("no discovery request within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("first request carried no node identity")]
    MissingNode,
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("undecodable request: {0}")]
    Decode(String),
    #[error("failed to encode response: {0}")]
    Encode(String),
    #[error("push coordinator shut down")]
    CoordinatorGone,
}

impl SessionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SessionError::ClosedBeforeRequest => "closed_before_request",
            SessionError::HandshakeTimeout(_) => "handshake_timeout",
            SessionError::MissingNode => "missing_node",
            SessionError::WriteTimeout(_) => "write_timeout",
            SessionError::Transport(_) => "transport",
            SessionError::Decode(_) => "decode",
            SessionError::Encode(_) => "encode",
            SessionError::CoordinatorGone => "coordinator_gone",
        }
    }
}

/// Exponential retry delay after the proxy rejects a push.
#[derive(Debug, Clone)]
pub struct NackBackoff {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive rejections before an alert fires.
    pub alert_threshold: u32,
}

impl Default for NackBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            alert_threshold: 3,
        }
    }
}

impl NackBackoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backoff: NackBackoff,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            backoff: NackBackoff::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushPhase {
    Idle,
    Sent,
    Acked,
    Nacked,
}

#[derive(Debug, Clone)]
struct SentPush {
    version: u64,
    nonce: String,
    digest: String,
}

/// What a request did to the state of its resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Subscribed,
    Acked { version: u64 },
    Nacked { version: u64, attempts: u32, reason: String },
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision {
    Push,
    Skip,
    /// A push is outstanding.
    Blocked,
    /// Retry after a rejection once the backoff elapses.
    RetryAt(Instant),
}

#[derive(Debug)]
pub struct TypeState {
    subscribed: bool,
    resync: bool,
    phase: PushPhase,
    sent: Option<SentPush>,
    acked_version: Option<u64>,
    rejected_digest: Option<String>,
    nack_count: u32,
    retry_at: Option<Instant>,
}

impl Default for TypeState {
    fn default() -> Self {
        Self {
            subscribed: false,
            resync: false,
            phase: PushPhase::Idle,
            sent: None,
            acked_version: None,
            rejected_digest: None,
            nack_count: 0,
            retry_at: None,
        }
    }
}

impl TypeState {
    pub fn phase(&self) -> PushPhase {
        self.phase
    }

    pub fn sent_version(&self) -> Option<u64> {
        self.sent.as_ref().map(|sent| sent.version)
    }

    pub fn acked_version(&self) -> Option<u64> {
        self.acked_version
    }

    pub fn nack_count(&self) -> u32 {
        self.nack_count
    }

    pub fn on_request(
        &mut self,
        request: &DiscoveryRequest,
        backoff: &NackBackoff,
        now: Instant,
    ) -> RequestOutcome {
        if request.response_nonce.is_empty() {
            // A new stream or changed interest: the proxy's state is treated
            // as empty and the next flush sends everything.
            self.subscribed = true;
            self.resync = true;
            return RequestOutcome::Subscribed;
        }

        let Some(sent) = self.sent.as_ref() else {
            return RequestOutcome::Stale;
        };
        if self.phase != PushPhase::Sent || sent.nonce != request.response_nonce {
            return RequestOutcome::Stale;
        }

        let version = sent.version;
        match &request.error_detail {
            None => {
                self.phase = PushPhase::Acked;
                self.acked_version = Some(version);
                self.rejected_digest = None;
                self.nack_count = 0;
                self.retry_at = None;
                RequestOutcome::Acked { version }
            }
            Some(status) => {
                self.phase = PushPhase::Nacked;
                self.nack_count += 1;
                self.rejected_digest = Some(sent.digest.clone());
                self.retry_at = Some(now + backoff.delay(self.nack_count));
                RequestOutcome::Nacked {
                    version,
                    attempts: self.nack_count,
                    reason: status.message.clone(),
                }
            }
        }
    }

    pub fn decide(&self, digest: &str, now: Instant) -> PushDecision {
        if !self.subscribed {
            return PushDecision::Skip;
        }
        match self.phase {
            PushPhase::Sent => PushDecision::Blocked,
            PushPhase::Idle => PushDecision::Push,
            PushPhase::Acked => {
                let unchanged = self.sent.as_ref().is_some_and(|sent| sent.digest == digest);
                if unchanged && !self.resync {
                    PushDecision::Skip
                } else {
                    PushDecision::Push
                }
            }
            PushPhase::Nacked => {
                if self.rejected_digest.as_deref() == Some(digest) {
                    PushDecision::Skip
                } else {
                    match self.retry_at {
                        Some(at) if at > now => PushDecision::RetryAt(at),
                        _ => PushDecision::Push,
                    }
                }
            }
        }
    }

    pub fn mark_sent(&mut self, version: u64, nonce: String, digest: String) {
        self.phase = PushPhase::Sent;
        self.resync = false;
        self.sent = Some(SentPush {
            version,
            nonce,
            digest,
        });
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    clusters: TypeState,
    routes: TypeState,
}

impl SessionState {
    pub fn get(&self, resource_type: ResourceType) -> &TypeState {
        match resource_type {
            ResourceType::Cluster => &self.clusters,
            ResourceType::Route => &self.routes,
        }
    }

    pub fn get_mut(&mut self, resource_type: ResourceType) -> &mut TypeState {
        match resource_type {
            ResourceType::Cluster => &mut self.clusters,
            ResourceType::Route => &mut self.routes,
        }
    }

    /// Earliest pending NACK retry for content newer than what was rejected.
    fn next_retry(&self, snapshot: &ResourceSnapshot, now: Instant) -> Option<Instant> {
        ResourceType::ALL
            .into_iter()
            .filter_map(|ty| match self.get(ty).decide(snapshot.digest(ty), now) {
                PushDecision::RetryAt(at) => Some(at),
                _ => None,
            })
            .min()
    }
}

struct SessionEntry {
    node: Node,
    connected_at: DateTime<Utc>,
    state: Arc<Mutex<SessionState>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeSummary {
    pub resource_type: ResourceType,
    pub phase: PushPhase,
    pub sent_version: Option<u64>,
    pub acked_version: Option<u64>,
    pub nack_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub node_id: String,
    pub node_cluster: String,
    pub connected_at: DateTime<Utc>,
    pub types: Vec<TypeSummary>,
}

/// Tracks every live discovery session and drives each one.
pub struct SessionManager {
    sessions: DashMap<Uuid, SessionEntry>,
    settings: SessionSettings,
    nonce_prefix: String,
    nonce_counter: AtomicU64,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            settings,
            nonce_prefix: Uuid::new_v4().simple().to_string(),
            nonce_counter: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Unique for the lifetime of the process.
    pub fn next_nonce(&self) -> String {
        let counter = self.nonce_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{counter}", self.nonce_prefix)
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| summarize(*entry.key(), entry.value()))
            .collect();
        summaries.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        summaries
    }

    pub fn summary(&self, session_id: Uuid) -> Option<SessionSummary> {
        self.sessions
            .get(&session_id)
            .map(|entry| summarize(session_id, entry.value()))
    }

    pub fn find_by_node(&self, node_id: &str) -> Vec<SessionSummary> {
        self.summaries()
            .into_iter()
            .filter(|summary| summary.node_id == node_id)
            .collect()
    }

    fn register(&self, session_id: Uuid, node: &Node) -> Arc<Mutex<SessionState>> {
        let state = Arc::new(Mutex::new(SessionState::default()));
        self.sessions.insert(
            session_id,
            SessionEntry {
                node: node.clone(),
                connected_at: Utc::now(),
                state: state.clone(),
            },
        );
        gauge!("jetty_discovery_sessions_active", self.sessions.len() as f64);
        state
    }

    fn remove(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
        gauge!("jetty_discovery_sessions_active", self.sessions.len() as f64);
    }

    /// Runs one discovery stream to completion. The session is registered
    /// once the first request identifies the node and removed here, and only
    /// here, when the stream ends for any reason.
    pub async fn serve<Tx, Rx>(
        self: &Arc<Self>,
        coordinator: &Arc<PushCoordinator>,
        mut tx: Tx,
        mut rx: Rx,
    ) -> Result<(), SessionError>
    where
        Tx: Sink<DiscoveryResponse, Error = SessionError> + Unpin,
        Rx: Stream<Item = Result<DiscoveryRequest, SessionError>> + Unpin,
    {
        let handshake = self.settings.handshake_timeout;
        let first = timeout(handshake, rx.next())
            .await
            .map_err(|_| SessionError::HandshakeTimeout(handshake))?
            .ok_or(SessionError::ClosedBeforeRequest)??;
        let node = first
            .node
            .clone()
            .filter(|node| !node.id.trim().is_empty())
            .ok_or(SessionError::MissingNode)?;

        let session_id = Uuid::new_v4();
        let state = self.register(session_id, &node);
        info!(session_id = %session_id, node_id = %node.id, "discovery session opened");
        counter!("jetty_discovery_sessions_total", 1);

        let result = self
            .drive(session_id, &node, &state, coordinator, first, &mut tx, &mut rx)
            .await;

        self.remove(session_id);
        match &result {
            Ok(()) => info!(session_id = %session_id, node_id = %node.id, "discovery session closed"),
            Err(err) => {
                counter!("jetty_discovery_session_errors_total", 1, "reason" => err.metric_label());
                warn!(session_id = %session_id, node_id = %node.id, error = %err, "discovery session failed");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<Tx, Rx>(
        &self,
        session_id: Uuid,
        node: &Node,
        state: &Mutex<SessionState>,
        coordinator: &PushCoordinator,
        first: DiscoveryRequest,
        tx: &mut Tx,
        rx: &mut Rx,
    ) -> Result<(), SessionError>
    where
        Tx: Sink<DiscoveryResponse, Error = SessionError> + Unpin,
        Rx: Stream<Item = Result<DiscoveryRequest, SessionError>> + Unpin,
    {
        let mut updates = coordinator.subscribe();
        let mut latest = coordinator.current();

        self.handle_request(session_id, node, state, &first);
        self.flush(session_id, state, &latest, tx).await?;

        loop {
            let next_retry = state.lock().next_retry(&latest, Instant::now());
            let retry_sleep =
                tokio::time::sleep_until(next_retry.unwrap_or_else(|| Instant::now() + FAR_FUTURE));

            tokio::select! {
                request = rx.next() => match request {
                    Some(Ok(request)) => self.handle_request(session_id, node, state, &request),
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
                update = updates.recv() => match update {
                    Ok(snapshot) => latest = snapshot,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(session_id = %session_id, skipped, "session skipped snapshots");
                        latest = coordinator.current();
                    }
                    Err(RecvError::Closed) => return Err(SessionError::CoordinatorGone),
                },
                _ = retry_sleep, if next_retry.is_some() => {}
            }

            self.flush(session_id, state, &latest, tx).await?;
        }
    }

    fn handle_request(
        &self,
        session_id: Uuid,
        node: &Node,
        state: &Mutex<SessionState>,
        request: &DiscoveryRequest,
    ) {
        let Some(resource_type) = request.resource_type() else {
            warn!(
                session_id = %session_id,
                type_url = %request.type_url,
                "ignoring request for unsupported resource type"
            );
            counter!("jetty_discovery_unsupported_requests_total", 1);
            return;
        };
        let outcome = state.lock().get_mut(resource_type).on_request(
            request,
            &self.settings.backoff,
            Instant::now(),
        );

        let type_label = resource_type.as_str();
        match outcome {
            RequestOutcome::Subscribed => {
                debug!(session_id = %session_id, node_id = %node.id, resource_type = type_label, "subscribed");
            }
            RequestOutcome::Acked { version } => {
                counter!("jetty_discovery_acks_total", 1, "type" => type_label);
                debug!(session_id = %session_id, node_id = %node.id, resource_type = type_label, version, "push acknowledged");
            }
            RequestOutcome::Nacked {
                version,
                attempts,
                reason,
            } => {
                counter!("jetty_discovery_nacks_total", 1, "type" => type_label);
                warn!(
                    session_id = %session_id,
                    node_id = %node.id,
                    resource_type = type_label,
                    version,
                    attempts,
                    reason = %reason,
                    "proxy rejected pushed configuration"
                );
                if attempts >= self.settings.backoff.alert_threshold {
                    counter!("jetty_discovery_nack_alerts_total", 1, "type" => type_label);
                    error!(
                        session_id = %session_id,
                        node_id = %node.id,
                        resource_type = type_label,
                        attempts,
                        reason = %reason,
                        "proxy keeps rejecting configuration"
                    );
                }
            }
            RequestOutcome::Stale => {
                debug!(
                    session_id = %session_id,
                    resource_type = type_label,
                    nonce = %request.response_nonce,
                    "ignoring stale request"
                );
            }
        }
    }

    /// Sends every push the current state allows, clusters before routes.
    async fn flush<Tx>(
        &self,
        session_id: Uuid,
        state: &Mutex<SessionState>,
        snapshot: &ResourceSnapshot,
        tx: &mut Tx,
    ) -> Result<(), SessionError>
    where
        Tx: Sink<DiscoveryResponse, Error = SessionError> + Unpin,
    {
        for resource_type in ResourceType::ALL {
            let response = {
                let mut guard = state.lock();
                let type_state = guard.get_mut(resource_type);
                let digest = snapshot.digest(resource_type);
                if type_state.decide(digest, Instant::now()) != PushDecision::Push {
                    continue;
                }
                let nonce = self.next_nonce();
                type_state.mark_sent(snapshot.version, nonce.clone(), digest.to_string());
                DiscoveryResponse {
                    version_info: snapshot.version_info(),
                    resources: snapshot.resources(resource_type),
                    type_url: resource_type.type_url().to_string(),
                    nonce,
                }
            };

            let write_timeout = self.settings.write_timeout;
            timeout(write_timeout, tx.send(response))
                .await
                .map_err(|_| SessionError::WriteTimeout(write_timeout))??;
            counter!("jetty_discovery_pushes_total", 1, "type" => resource_type.as_str());
            debug!(
                session_id = %session_id,
                resource_type = resource_type.as_str(),
                version = snapshot.version,
                "pushed resources"
            );
        }
        Ok(())
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

fn summarize(session_id: Uuid, entry: &SessionEntry) -> SessionSummary {
    let state = entry.state.lock();
    SessionSummary {
        session_id,
        node_id: entry.node.id.clone(),
        node_cluster: entry.node.cluster.clone(),
        connected_at: entry.connected_at,
        types: ResourceType::ALL
            .into_iter()
            .map(|ty| {
                let type_state = state.get(ty);
                TypeSummary {
                    resource_type: ty,
                    phase: type_state.phase(),
                    sent_version: type_state.sent_version(),
                    acked_version: type_state.acked_version(),
                    nack_count: type_state.nack_count(),
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorSettings;
    use crate::generator::GeneratorSettings;
    use crate::registry::{InMemoryRegistry, LifecycleState, RegistryHandle, SandboxRecord};
    use futures::channel::mpsc;
    use jetty_proto::discovery::Status;

    const DOMAIN: &str = "sbx.example.dev";

    fn running(id: &str, address: &str) -> SandboxRecord {
        SandboxRecord::new(id, "us2", LifecycleState::Running)
            .with_pod_address(address)
            .expose(3000, DOMAIN)
    }

    fn node(id: &str) -> Option<Node> {
        Some(Node {
            id: id.into(),
            cluster: "edge".into(),
        })
    }

    struct Harness {
        registry: Arc<InMemoryRegistry>,
        coordinator: Arc<PushCoordinator>,
        manager: Arc<SessionManager>,
    }

    impl Harness {
        async fn new(settings: SessionSettings) -> Self {
            let registry = InMemoryRegistry::with_records([running("abc123", "10.0.0.1")]);
            let handle: RegistryHandle = registry.clone();
            let coordinator = PushCoordinator::new(
                handle,
                GeneratorSettings::new(DOMAIN),
                CoordinatorSettings::default(),
            );
            coordinator.refresh().await.unwrap();
            Self {
                registry,
                coordinator,
                manager: SessionManager::new(settings),
            }
        }

        fn connect(
            &self,
        ) -> (
            mpsc::Sender<DiscoveryRequest>,
            mpsc::Receiver<DiscoveryResponse>,
            tokio::task::JoinHandle<Result<(), SessionError>>,
        ) {
            let (req_tx, req_rx) = mpsc::channel::<DiscoveryRequest>(16);
            let (resp_tx, resp_rx) = mpsc::channel::<DiscoveryResponse>(16);
            let manager = self.manager.clone();
            let coordinator = self.coordinator.clone();
            let task = tokio::spawn(async move {
                let tx = resp_tx.sink_map_err(|err| SessionError::Transport(err.to_string()));
                let rx = req_rx.map(Ok);
                manager.serve(&coordinator, tx, rx).await
            });
            (req_tx, resp_rx, task)
        }
    }

    async fn expect_response(rx: &mut mpsc::Receiver<DiscoveryResponse>) -> DiscoveryResponse {
        rx.next().await.expect("response")
    }

    async fn expect_silence(rx: &mut mpsc::Receiver<DiscoveryResponse>) {
        assert!(
            timeout(Duration::from_millis(500), rx.next()).await.is_err(),
            "unexpected push"
        );
    }

    #[test_timeout::timeout]
    fn backoff_doubles_up_to_cap() {
        let backoff = NackBackoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(7), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
    }

    #[test_timeout::timeout]
    fn nonces_are_unique() {
        let manager = SessionManager::new(SessionSettings::default());
        let a = manager.next_nonce();
        let b = manager.next_nonce();
        assert_ne!(a, b);
        assert!(a.ends_with("-1"));
        assert!(b.ends_with("-2"));
    }

    #[test_timeout::timeout]
    fn stale_nonce_is_ignored() {
        let mut state = TypeState::default();
        let backoff = NackBackoff::default();
        let now = Instant::now();
        let subscribe = DiscoveryRequest::subscribe(node("edge-1"), ResourceType::Cluster);
        assert_eq!(state.on_request(&subscribe, &backoff, now), RequestOutcome::Subscribed);
        state.mark_sent(1, "n-1".into(), "d1".into());

        let mut old = subscribe.clone();
        old.response_nonce = "n-0".into();
        assert_eq!(state.on_request(&old, &backoff, now), RequestOutcome::Stale);
        assert_eq!(state.phase(), PushPhase::Sent);

        let mut ack = subscribe;
        ack.response_nonce = "n-1".into();
        assert_eq!(
            state.on_request(&ack, &backoff, now),
            RequestOutcome::Acked { version: 1 }
        );
        // A duplicate ACK after the state moved on is stale too.
        assert_eq!(state.on_request(&ack, &backoff, now), RequestOutcome::Stale);
    }

    #[test_timeout::timeout]
    fn nacked_type_waits_for_new_content_and_backoff() {
        let mut state = TypeState::default();
        let backoff = NackBackoff::default();
        let now = Instant::now();
        state.on_request(
            &DiscoveryRequest::subscribe(None, ResourceType::Route),
            &backoff,
            now,
        );
        state.mark_sent(3, "n-3".into(), "bad".into());
        let mut nack = DiscoveryRequest::subscribe(None, ResourceType::Route);
        nack.response_nonce = "n-3".into();
        nack.error_detail = Some(Status {
            code: 3,
            message: "invalid domain".into(),
        });
        assert!(matches!(
            state.on_request(&nack, &backoff, now),
            RequestOutcome::Nacked { version: 3, attempts: 1, .. }
        ));
        assert_eq!(state.acked_version(), None);

        assert_eq!(state.decide("bad", now), PushDecision::Skip);
        assert_eq!(
            state.decide("good", now),
            PushDecision::RetryAt(now + Duration::from_secs(1))
        );
        assert_eq!(
            state.decide("good", now + Duration::from_secs(1)),
            PushDecision::Push
        );
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn subscribe_ack_and_push_on_change() {
        let harness = Harness::new(SessionSettings::default()).await;
        let (mut tx, mut rx, _task) = harness.connect();

        tx.send(DiscoveryRequest::subscribe(node("edge-1"), ResourceType::Cluster))
            .await
            .unwrap();
        let clusters = expect_response(&mut rx).await;
        assert_eq!(clusters.version_info, "1");
        assert_eq!(clusters.resource_type(), Some(ResourceType::Cluster));
        assert_eq!(clusters.resources.len(), 1);

        tx.send(DiscoveryRequest::subscribe(None, ResourceType::Route))
            .await
            .unwrap();
        let routes = expect_response(&mut rx).await;
        assert_eq!(routes.version_info, "1");
        assert_ne!(routes.nonce, clusters.nonce);

        tx.send(DiscoveryRequest::ack(&clusters)).await.unwrap();
        tx.send(DiscoveryRequest::ack(&routes)).await.unwrap();
        expect_silence(&mut rx).await;

        let summary = &harness.manager.summaries()[0];
        assert_eq!(summary.node_id, "edge-1");
        assert!(summary
            .types
            .iter()
            .all(|t| t.phase == PushPhase::Acked && t.acked_version == Some(1)));

        // Relocation changes only cluster content.
        harness.registry.upsert(running("abc123", "10.0.0.2"));
        harness.coordinator.refresh().await.unwrap();
        let update = expect_response(&mut rx).await;
        assert_eq!(update.resource_type(), Some(ResourceType::Cluster));
        assert_eq!(update.version_info, "2");
        expect_silence(&mut rx).await;
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn outstanding_push_blocks_newer_versions_until_ack() {
        let harness = Harness::new(SessionSettings::default()).await;
        let (mut tx, mut rx, _task) = harness.connect();
        tx.send(DiscoveryRequest::subscribe(node("edge-1"), ResourceType::Cluster))
            .await
            .unwrap();
        let first = expect_response(&mut rx).await;

        harness.registry.upsert(running("second", "10.0.0.3"));
        harness.coordinator.refresh().await.unwrap();
        harness.registry.upsert(running("third", "10.0.0.4"));
        harness.coordinator.refresh().await.unwrap();
        expect_silence(&mut rx).await;

        tx.send(DiscoveryRequest::ack(&first)).await.unwrap();
        let latest = expect_response(&mut rx).await;
        assert_eq!(latest.version_info, "3");
        assert_eq!(latest.resources.len(), 3);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn nack_keeps_acked_version_and_retries_newer_content_after_backoff() {
        let harness = Harness::new(SessionSettings::default()).await;
        let (mut tx, mut rx, _task) = harness.connect();
        tx.send(DiscoveryRequest::subscribe(node("edge-1"), ResourceType::Cluster))
            .await
            .unwrap();
        let v1 = expect_response(&mut rx).await;
        tx.send(DiscoveryRequest::ack(&v1)).await.unwrap();

        harness.registry.upsert(running("abc123", "10.0.0.9"));
        harness.coordinator.refresh().await.unwrap();
        let v2 = expect_response(&mut rx).await;
        assert_eq!(v2.version_info, "2");
        tx.send(DiscoveryRequest::nack(&v2, "1", "endpoint rejected"))
            .await
            .unwrap();
        expect_silence(&mut rx).await;

        let summary = &harness.manager.summaries()[0];
        let clusters = &summary.types[0];
        assert_eq!(clusters.phase, PushPhase::Nacked);
        assert_eq!(clusters.acked_version, Some(1));
        assert_eq!(clusters.sent_version, Some(2));
        assert_eq!(clusters.nack_count, 1);

        let started = Instant::now();
        harness.registry.upsert(running("abc123", "10.0.0.10"));
        harness.coordinator.refresh().await.unwrap();
        let v3 = expect_response(&mut rx).await;
        assert_eq!(v3.version_info, "3");
        assert_ne!(v3.nonce, v2.nonce);
        // The rejection at `started - 500ms` armed a one second backoff.
        assert!(started.elapsed() >= Duration::from_millis(400));

        tx.send(DiscoveryRequest::ack(&v3)).await.unwrap();
        expect_silence(&mut rx).await;
        let summary = &harness.manager.summaries()[0];
        assert_eq!(summary.types[0].acked_version, Some(3));
        assert_eq!(summary.types[0].nack_count, 0);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn session_is_removed_when_stream_ends() {
        let harness = Harness::new(SessionSettings::default()).await;
        let (mut tx, mut rx, task) = harness.connect();
        tx.send(DiscoveryRequest::subscribe(node("edge-1"), ResourceType::Cluster))
            .await
            .unwrap();
        expect_response(&mut rx).await;
        assert_eq!(harness.manager.len(), 1);

        drop(tx);
        task.await.unwrap().expect("clean close");
        assert!(harness.manager.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn first_request_must_identify_node() {
        let harness = Harness::new(SessionSettings::default()).await;
        let (mut tx, _rx, task) = harness.connect();
        tx.send(DiscoveryRequest::subscribe(None, ResourceType::Cluster))
            .await
            .unwrap();
        assert!(matches!(task.await.unwrap(), Err(SessionError::MissingNode)));
        assert!(harness.manager.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn unsupported_type_is_ignored() {
        let harness = Harness::new(SessionSettings::default()).await;
        let (mut tx, mut rx, _task) = harness.connect();
        let mut listeners = DiscoveryRequest::subscribe(node("edge-1"), ResourceType::Cluster);
        listeners.type_url = "type.googleapis.com/envoy.config.listener.v3.Listener".into();
        tx.send(listeners).await.unwrap();
        expect_silence(&mut rx).await;
        assert_eq!(harness.manager.len(), 1);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn blocked_writer_times_out() {
        let settings = SessionSettings {
            write_timeout: Duration::from_secs(2),
            ..SessionSettings::default()
        };
        let harness = Harness::new(settings).await;
        let (req_tx, req_rx) = mpsc::channel::<DiscoveryRequest>(4);
        // Room for a single undrained message; the route push then parks.
        let (resp_tx, resp_rx) = mpsc::channel::<DiscoveryResponse>(0);
        let manager = harness.manager.clone();
        let coordinator = harness.coordinator.clone();
        let mut req_tx = req_tx;
        req_tx
            .send(DiscoveryRequest::subscribe(node("edge-1"), ResourceType::Cluster))
            .await
            .unwrap();
        req_tx
            .send(DiscoveryRequest::subscribe(None, ResourceType::Route))
            .await
            .unwrap();
        let tx = resp_tx.sink_map_err(|err| SessionError::Transport(err.to_string()));
        let result = manager.serve(&coordinator, tx, req_rx.map(Ok)).await;
        assert!(matches!(result, Err(SessionError::WriteTimeout(_))));
        assert!(manager.is_empty());
        drop(resp_rx);
    }
}
