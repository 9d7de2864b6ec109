//! WebSocket upgrade proxying.
//!
//! The upstream handshake completes before the client's upgrade is
//! accepted, so a failed upstream never leaves a half-open client socket.
//! Once both legs are open each one gets its own task: it moves frames from
//! its socket into the peer's bounded inbox and writes its own inbox back to
//! its socket. The first leg to see a close or failure wins the pair's
//! `closing` flag and the other leg forwards that close and exits.

use axum::{
    extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderName, HeaderValue, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use jetty_proto::host::HostTarget;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    error::ProtocolError,
    handshake::client::Request as UpstreamRequest,
    protocol::{frame::coding::CloseCode, CloseFrame as UpstreamCloseFrame},
    Message as UpstreamMessage,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::health::HealthResponse;
use crate::registry::UpstreamTarget;

const CLOSE_GRACE: Duration = Duration::from_secs(5);
/// Close reasons are limited to 123 bytes on the wire.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
    /// Frames buffered per direction before reads from the source pause.
    pub relay_buffer: usize,
    pub upgrade_retry_after: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            relay_buffer: 64,
            upgrade_retry_after: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("upstream did not complete the handshake within {0:?}")]
    Timeout(Duration),
    #[error("upstream handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

impl UpgradeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            UpgradeError::Timeout(_) => "timeout",
            UpgradeError::Handshake(tungstenite::Error::Http(_)) => "rejected",
            UpgradeError::Handshake(tungstenite::Error::Io(_)) => "connect",
            UpgradeError::Handshake(tungstenite::Error::Url(_)) => "url",
            UpgradeError::Handshake(_) => "handshake",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Codes that may not appear in a close frame are mapped onto ones that can.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let code = match code {
            1000..=1003 | 1007..=1014 | 3000..=4999 => code,
            1005 => Self::NORMAL,
            _ => Self::GOING_AWAY,
        };
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    pub fn going_away(reason: &str) -> Self {
        Self::new(Self::GOING_AWAY, reason)
    }

    pub fn internal_error(reason: &str) -> Self {
        Self::new(Self::INTERNAL_ERROR, reason)
    }

    pub fn keepalive_timeout() -> Self {
        Self::going_away("keepalive timeout")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

pub enum LegEvent {
    Data(Frame),
    Control,
    Close(Option<CloseInfo>),
}

/// Conversion between a socket library's message type and relay frames.
pub trait RelayMessage: Sized + Send + Unpin + 'static {
    fn into_event(self) -> LegEvent;
    fn from_frame(frame: Frame) -> Self;
    fn ping() -> Self;
    fn close(info: &CloseInfo) -> Self;
}

impl RelayMessage for ClientMessage {
    fn into_event(self) -> LegEvent {
        match self {
            ClientMessage::Text(text) => LegEvent::Data(Frame::Text(text)),
            ClientMessage::Binary(data) => LegEvent::Data(Frame::Binary(Bytes::from(data))),
            ClientMessage::Ping(_) | ClientMessage::Pong(_) => LegEvent::Control,
            ClientMessage::Close(frame) => {
                LegEvent::Close(frame.map(|frame| CloseInfo::new(frame.code, frame.reason)))
            }
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => ClientMessage::Text(text),
            Frame::Binary(data) => ClientMessage::Binary(data.to_vec()),
        }
    }

    fn ping() -> Self {
        ClientMessage::Ping(Vec::new())
    }

    fn close(info: &CloseInfo) -> Self {
        ClientMessage::Close(Some(ClientCloseFrame {
            code: info.code,
            reason: Cow::Owned(info.reason.clone()),
        }))
    }
}

impl RelayMessage for UpstreamMessage {
    fn into_event(self) -> LegEvent {
        match self {
            UpstreamMessage::Text(text) => LegEvent::Data(Frame::Text(text.as_str().to_owned())),
            UpstreamMessage::Binary(data) => LegEvent::Data(Frame::Binary(data)),
            UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => {
                LegEvent::Control
            }
            UpstreamMessage::Close(frame) => LegEvent::Close(
                frame.map(|frame| CloseInfo::new(u16::from(frame.code), frame.reason.as_str())),
            ),
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => UpstreamMessage::Text(text.into()),
            Frame::Binary(data) => UpstreamMessage::Binary(data),
        }
    }

    fn ping() -> Self {
        UpstreamMessage::Ping(Bytes::new())
    }

    fn close(info: &CloseInfo) -> Self {
        UpstreamMessage::Close(Some(UpstreamCloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.clone().into(),
        }))
    }
}

/// Socket errors, split into "the peer went away" and everything else.
pub trait LegError: Display + Send + 'static {
    fn is_disconnect(&self) -> bool;
}

impl LegError for tungstenite::Error {
    fn is_disconnect(&self) -> bool {
        matches!(
            self,
            tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Io(_)
                | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
        )
    }
}

/// axum's ws feature is built on its own tungstenite release, so its errors
/// are matched against that version's types.
impl LegError for axum::Error {
    fn is_disconnect(&self) -> bool {
        use axum_tungstenite::{error::ProtocolError as AxumProtocolError, Error as AxumWsError};

        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if let Some(err) = err.downcast_ref::<AxumWsError>() {
                return matches!(
                    err,
                    AxumWsError::ConnectionClosed
                        | AxumWsError::AlreadyClosed
                        | AxumWsError::Io(_)
                        | AxumWsError::Protocol(AxumProtocolError::ResetWithoutClosingHandshake)
                );
            }
            if err.is::<std::io::Error>() {
                return true;
            }
            source = err.source();
        }
        false
    }
}

/// Shared state of one client/upstream connection pair.
pub struct WebSocketPair {
    pub id: Uuid,
    pub sandbox_id: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    closing: AtomicBool,
    close: Mutex<Option<(Side, CloseInfo)>>,
    cancel: tokio_util::sync::CancellationToken,
}

impl WebSocketPair {
    fn new(sandbox_id: &str, port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            sandbox_id: sandbox_id.to_string(),
            port,
            created_at: Utc::now(),
            closing: AtomicBool::new(false),
            close: Mutex::new(None),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Returns true for the single caller that starts the teardown.
    fn begin_close(&self, side: Side, info: CloseInfo) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.close.lock() = Some((side, info));
        self.cancel.cancel();
        true
    }

    fn close_info(&self) -> Option<CloseInfo> {
        self.close.lock().as_ref().map(|(_, info)| info.clone())
    }

    /// The close a failing leg should send: its own if it started the
    /// teardown, otherwise the one the other leg recorded.
    fn settle_close(&self, side: Side, info: CloseInfo) -> CloseInfo {
        if self.begin_close(side, info.clone()) {
            return info;
        }
        self.close_info().unwrap_or(info)
    }

    fn outcome(&self) -> Option<(Side, CloseInfo)> {
        self.close.lock().clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairView {
    pub pair_id: Uuid,
    pub sandbox_id: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub closing: bool,
}

/// Every open pair in this process.
#[derive(Clone, Default)]
pub struct RelayRegistry {
    pairs: Arc<DashMap<Uuid, Arc<WebSocketPair>>>,
    opened: Arc<AtomicU64>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.pairs.len()
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<PairView> {
        let mut pairs: Vec<PairView> = self
            .pairs
            .iter()
            .map(|entry| {
                let pair = entry.value();
                PairView {
                    pair_id: pair.id,
                    sandbox_id: pair.sandbox_id.clone(),
                    port: pair.port,
                    created_at: pair.created_at,
                    closing: pair.is_closing(),
                }
            })
            .collect();
        pairs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pairs
    }

    /// Relays frames between two open sockets until either side closes.
    /// Returns which side ended the pair and with what close.
    pub async fn relay<C, CM, CE, U, UM, UE>(
        &self,
        client: C,
        upstream: U,
        sandbox_id: &str,
        port: u16,
        settings: &ProxySettings,
    ) -> Option<(Side, CloseInfo)>
    where
        C: Stream<Item = Result<CM, CE>> + Sink<CM, Error = CE> + Send + 'static,
        CM: RelayMessage,
        CE: LegError,
        U: Stream<Item = Result<UM, UE>> + Sink<UM, Error = UE> + Send + 'static,
        UM: RelayMessage,
        UE: LegError,
    {
        let pair = Arc::new(WebSocketPair::new(sandbox_id, port));
        self.pairs.insert(pair.id, pair.clone());
        self.opened.fetch_add(1, Ordering::Relaxed);
        counter!("jetty_ws_pairs_total", 1);
        gauge!("jetty_ws_pairs_active", self.pairs.len() as f64);
        info!(pair_id = %pair.id, sandbox_id = %sandbox_id, port, "websocket pair opened");

        let buffer = settings.relay_buffer.max(1);
        let (to_client, client_inbox) = mpsc::channel(buffer);
        let (to_upstream, upstream_inbox) = mpsc::channel(buffer);
        let client_leg = tokio::spawn(run_leg(
            Side::Client,
            client,
            client_inbox,
            to_upstream,
            pair.clone(),
            settings.clone(),
        ));
        let upstream_leg = tokio::spawn(run_leg(
            Side::Upstream,
            upstream,
            upstream_inbox,
            to_client,
            pair.clone(),
            settings.clone(),
        ));

        let (client_result, upstream_result) = tokio::join!(client_leg, upstream_leg);
        for (side, result) in [(Side::Client, client_result), (Side::Upstream, upstream_result)] {
            if let Err(err) = result {
                warn!(pair_id = %pair.id, side = side.as_str(), error = %err, "relay leg task failed");
            }
        }

        self.pairs.remove(&pair.id);
        gauge!("jetty_ws_pairs_active", self.pairs.len() as f64);
        let lifetime = (Utc::now() - pair.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        histogram!("jetty_ws_pair_duration_seconds", lifetime);

        let outcome = pair.outcome();
        match &outcome {
            Some((side, close)) => {
                counter!("jetty_ws_pairs_closed_total", 1, "initiator" => side.as_str());
                info!(
                    pair_id = %pair.id,
                    sandbox_id = %sandbox_id,
                    port,
                    initiator = side.as_str(),
                    code = close.code,
                    reason = %close.reason,
                    "websocket pair closed"
                );
            }
            None => info!(pair_id = %pair.id, sandbox_id = %sandbox_id, port, "websocket pair closed"),
        }
        outcome
    }
}

enum LegExit {
    /// The socket sent a close frame.
    Received(CloseInfo),
    /// The socket failed or went quiet; it gets a close frame if it can take one.
    Failed(CloseInfo),
    /// The other leg is closing.
    Peer,
}

async fn write<K, M, E>(sink: &mut K, message: M, limit: Duration) -> Result<(), CloseInfo>
where
    K: Sink<M, Error = E> + Unpin,
    E: LegError,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) if err.is_disconnect() => Err(CloseInfo::going_away("peer gone")),
        Ok(Err(_)) => Err(CloseInfo::internal_error("transport error")),
        Err(_) => Err(CloseInfo::internal_error("write timeout")),
    }
}

async fn run_leg<S, M, E>(
    side: Side,
    socket: S,
    mut inbox: mpsc::Receiver<Frame>,
    peer: mpsc::Sender<Frame>,
    pair: Arc<WebSocketPair>,
    settings: ProxySettings,
) where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
    M: RelayMessage,
    E: LegError,
{
    let (mut sink, mut stream) = socket.split();
    let keepalive = settings.keepalive_interval;
    let write_timeout = settings.write_timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();
    let mut pending: Option<Frame> = None;

    let exit = loop {
        tokio::select! {
            biased;
            _ = pair.cancel.cancelled() => break LegExit::Peer,
            outgoing = inbox.recv() => match outgoing {
                Some(frame) => {
                    if let Err(close) = write(&mut sink, M::from_frame(frame), write_timeout).await {
                        break LegExit::Failed(close);
                    }
                }
                None => break LegExit::Peer,
            },
            permit = peer.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(frame) = pending.take() {
                        permit.send(frame);
                    }
                    last_inbound = Instant::now();
                }
                Err(_) => break LegExit::Peer,
            },
            incoming = stream.next(), if pending.is_none() => {
                last_inbound = Instant::now();
                match incoming {
                    Some(Ok(message)) => match message.into_event() {
                        LegEvent::Data(frame) => pending = Some(frame),
                        LegEvent::Control => {}
                        LegEvent::Close(close) => {
                            break LegExit::Received(close.unwrap_or_else(CloseInfo::normal))
                        }
                    },
                    Some(Err(err)) => {
                        debug!(pair_id = %pair.id, side = side.as_str(), error = %err, "relay read failed");
                        let close = if err.is_disconnect() {
                            CloseInfo::going_away("peer gone")
                        } else {
                            CloseInfo::internal_error("transport error")
                        };
                        break LegExit::Failed(close);
                    }
                    None => break LegExit::Failed(CloseInfo::going_away("peer gone")),
                }
            }
            _ = ticker.tick() => {
                // A leg paused by backpressure is not idle.
                if pending.is_none() && last_inbound.elapsed() >= keepalive * 2 {
                    counter!("jetty_ws_keepalive_timeouts_total", 1, "side" => side.as_str());
                    break LegExit::Failed(CloseInfo::keepalive_timeout());
                }
                if let Err(close) = write(&mut sink, M::ping(), write_timeout).await {
                    break LegExit::Failed(close);
                }
            }
        }
    };

    match exit {
        LegExit::Received(close) => {
            if !pair.begin_close(side, close) {
                debug!(pair_id = %pair.id, side = side.as_str(), "close received during teardown");
            }
            // Flushes the library's close reply.
            let _ = timeout(CLOSE_GRACE, sink.close()).await;
        }
        LegExit::Failed(close) => {
            let close = pair.settle_close(side, close);
            let _ = timeout(CLOSE_GRACE, sink.send(M::close(&close))).await;
            let _ = timeout(CLOSE_GRACE, sink.close()).await;
            await_close_reply(&mut stream).await;
        }
        LegExit::Peer => {
            let close = pair
                .close_info()
                .unwrap_or_else(|| CloseInfo::going_away("peer gone"));
            // Frames the peer queued before it closed still go out first.
            while let Ok(frame) = inbox.try_recv() {
                if write(&mut sink, M::from_frame(frame), write_timeout)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = timeout(CLOSE_GRACE, sink.send(M::close(&close))).await;
            let _ = timeout(CLOSE_GRACE, sink.close()).await;
            await_close_reply(&mut stream).await;
        }
    }
    debug!(pair_id = %pair.id, side = side.as_str(), "relay leg finished");
}

/// Keeps the socket open after our close frame until the other end answers
/// or goes away, so it can read the close before the transport drops.
async fn await_close_reply<R, M, E>(stream: &mut R)
where
    R: Stream<Item = Result<M, E>> + Unpin,
    M: RelayMessage,
{
    let _ = timeout(CLOSE_GRACE, async {
        while let Some(Ok(message)) = stream.next().await {
            if let LegEvent::Close(_) = message.into_event() {
                break;
            }
        }
    })
    .await;
}

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

const HANDSHAKE: [&str; 4] = [
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

fn should_forward(name: &HeaderName) -> bool {
    let name = name.as_str();
    !(name.starts_with("proxy-") || HOP_BY_HOP.contains(&name) || HANDSHAKE.contains(&name))
}

fn upstream_authority(upstream: &UpstreamTarget) -> String {
    match upstream.address.parse::<IpAddr>() {
        Ok(IpAddr::V6(addr)) => format!("[{addr}]:{}", upstream.port),
        _ => format!("{}:{}", upstream.address, upstream.port),
    }
}

/// Builds the upstream handshake request from the client's upgrade request.
pub fn build_upstream_request(
    upstream: &UpstreamTarget,
    uri: &Uri,
    headers: &HeaderMap,
    client_addr: Option<SocketAddr>,
) -> Result<UpstreamRequest, UpgradeError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = format!("ws://{}{path}", upstream_authority(upstream));
    let mut request = url.as_str().into_client_request()?;

    let forwarded = request.headers_mut();
    for (name, value) in headers {
        if should_forward(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    if let Some(host) = headers.get(header::HOST) {
        forwarded.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }
    let proto = headers
        .get("x-forwarded-proto")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));
    forwarded.insert(HeaderName::from_static("x-forwarded-proto"), proto);
    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let chain = match headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            forwarded.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
    Ok(request)
}

/// Everything the edge knows about an upgrade it is about to proxy.
pub struct UpgradeRequest {
    pub target: HostTarget,
    pub upstream: UpstreamTarget,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_addr: Option<SocketAddr>,
}

/// Opens the upstream leg, then accepts the client's upgrade and relays
/// between the two. Upstream failures answer 502 without upgrading.
pub async fn proxy_upgrade(
    ws: WebSocketUpgrade,
    relay: RelayRegistry,
    settings: ProxySettings,
    request: UpgradeRequest,
) -> Response {
    let UpgradeRequest {
        target,
        upstream,
        uri,
        headers,
        client_addr,
    } = request;

    let connected = match build_upstream_request(&upstream, &uri, &headers, client_addr) {
        Ok(upstream_request) => {
            match timeout(
                settings.connect_timeout,
                tokio_tungstenite::connect_async(upstream_request),
            )
            .await
            {
                Ok(Ok(connected)) => Ok(connected),
                Ok(Err(err)) => Err(UpgradeError::Handshake(err)),
                Err(_) => Err(UpgradeError::Timeout(settings.connect_timeout)),
            }
        }
        Err(err) => Err(err),
    };

    let (upstream_socket, handshake) = match connected {
        Ok(connected) => connected,
        Err(err) => {
            counter!("jetty_ws_upgrade_failures_total", 1, "reason" => err.metric_label());
            warn!(
                sandbox_id = %target.sandbox_id,
                port = target.port,
                error = %err,
                "upstream websocket handshake failed"
            );
            return HealthResponse::upgrade_failed(
                &target,
                settings.upgrade_retry_after,
                err.to_string(),
            )
            .into_response();
        }
    };

    let selected = handshake
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let ws = match selected {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    let sandbox_id = target.sandbox_id.clone();
    let failed_sandbox = sandbox_id.clone();
    let port = target.port;
    ws.on_failed_upgrade(move |err| {
        counter!("jetty_ws_upgrade_failures_total", 1, "reason" => "client");
        warn!(sandbox_id = %failed_sandbox, error = %err, "client upgrade failed after upstream connected");
    })
    .on_upgrade(move |socket| async move {
        relay
            .relay(socket, upstream_socket, &sandbox_id, port, &settings)
            .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};

    type TestSocket = WebSocketStream<DuplexStream>;

    /// Returns (server-role, client-role) ends of one in-memory connection.
    async fn socket_pair() -> (TestSocket, TestSocket) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    struct Relay {
        browser: TestSocket,
        app: TestSocket,
        registry: RelayRegistry,
        task: tokio::task::JoinHandle<Option<(Side, CloseInfo)>>,
    }

    async fn start_relay(settings: ProxySettings) -> Relay {
        let (client_leg, browser) = socket_pair().await;
        let (app, upstream_leg) = socket_pair().await;
        let registry = RelayRegistry::new();
        let relay_registry = registry.clone();
        let task = tokio::spawn(async move {
            relay_registry
                .relay(client_leg, upstream_leg, "abc123", 3000, &settings)
                .await
        });
        Relay {
            browser,
            app,
            registry,
            task,
        }
    }

    async fn next_data(socket: &mut TestSocket) -> UpstreamMessage {
        loop {
            match socket.next().await.expect("socket open").expect("frame") {
                UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) => continue,
                other => return other,
            }
        }
    }

    fn frame(i: usize) -> UpstreamMessage {
        if i % 2 == 0 {
            UpstreamMessage::Text(format!("text-{i}").into())
        } else {
            UpstreamMessage::Binary(Bytes::from(vec![i as u8; i % 7 + 1]))
        }
    }

    #[test_timeout::timeout]
    fn close_codes_are_sendable() {
        assert_eq!(CloseInfo::new(4001, "bye").code, 4001);
        assert_eq!(CloseInfo::new(1005, "").code, 1000);
        assert_eq!(CloseInfo::new(1006, "").code, 1001);
        assert_eq!(CloseInfo::new(1015, "").code, 1001);
        assert_eq!(CloseInfo::new(1000, "é".repeat(100)).reason.len(), 122);
    }

    #[test_timeout::timeout]
    fn upstream_request_filters_and_forwards_headers() {
        let upstream = UpstreamTarget {
            sandbox_id: "abc123".into(),
            address: "10.0.0.7".into(),
            port: 3000,
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("3000-abc123.us2.sbx.example.dev"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("client-key"));
        headers.insert(header::SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static("permessage-deflate"));
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("graphql-ws"));
        headers.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("secret"));
        headers.insert(header::COOKIE, HeaderValue::from_static("session=1"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));

        let uri: Uri = "/socket?room=7".parse().unwrap();
        let client: SocketAddr = "198.51.100.4:5555".parse().unwrap();
        let request = build_upstream_request(&upstream, &uri, &headers, Some(client)).unwrap();

        assert_eq!(request.uri().to_string(), "ws://10.0.0.7:3000/socket?room=7");
        let sent = request.headers();
        assert_eq!(sent[header::HOST], "10.0.0.7:3000");
        assert_ne!(sent[header::SEC_WEBSOCKET_KEY], "client-key");
        assert!(sent.get(header::SEC_WEBSOCKET_EXTENSIONS).is_none());
        assert!(sent.get(header::PROXY_AUTHORIZATION).is_none());
        assert_eq!(sent[header::SEC_WEBSOCKET_PROTOCOL], "graphql-ws");
        assert_eq!(sent[header::COOKIE], "session=1");
        assert_eq!(sent["x-forwarded-host"], "3000-abc123.us2.sbx.example.dev");
        assert_eq!(sent["x-forwarded-proto"], "http");
        assert_eq!(sent["x-forwarded-for"], "203.0.113.9, 198.51.100.4");
        assert_eq!(sent.get_all(header::UPGRADE).iter().count(), 1);
    }

    #[test_timeout::timeout]
    fn ipv6_upstreams_are_bracketed() {
        let upstream = UpstreamTarget {
            sandbox_id: "abc123".into(),
            address: "fd00::7".into(),
            port: 8080,
        };
        let request =
            build_upstream_request(&upstream, &Uri::from_static("/"), &HeaderMap::new(), None)
                .unwrap();
        assert_eq!(request.uri().to_string(), "ws://[fd00::7]:8080/");
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn relays_frames_in_order_and_forwards_close() {
        let Relay {
            mut browser,
            mut app,
            registry,
            task,
        } = start_relay(ProxySettings::default()).await;
        const N: usize = 100;

        for i in 0..N {
            browser.send(frame(i)).await.unwrap();
        }
        for i in 0..N {
            assert_eq!(next_data(&mut app).await, frame(i));
        }
        for i in 0..N {
            app.send(frame(N + i)).await.unwrap();
        }
        for i in 0..N {
            assert_eq!(next_data(&mut browser).await, frame(N + i));
        }
        assert_eq!(registry.active(), 1);

        browser
            .send(UpstreamMessage::Close(Some(UpstreamCloseFrame {
                code: CloseCode::from(4001),
                reason: "bye".into(),
            })))
            .await
            .unwrap();
        match next_data(&mut app).await {
            UpstreamMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4001);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("expected close, got {other:?}"),
        }
        // Finish the closing handshake on the app side.
        while app.next().await.is_some() {}

        let outcome = task.await.unwrap();
        assert_eq!(outcome, Some((Side::Client, CloseInfo::new(4001, "bye"))));
        assert_eq!(registry.active(), 0);
        assert_eq!(registry.opened(), 1);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn abrupt_upstream_loss_closes_client_as_going_away() {
        let Relay {
            mut browser,
            app,
            registry,
            task,
        } = start_relay(ProxySettings::default()).await;
        drop(app);

        match next_data(&mut browser).await {
            UpstreamMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CloseInfo::GOING_AWAY);
            }
            other => panic!("expected close, got {other:?}"),
        }
        while browser.next().await.is_some() {}
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Some((Side::Upstream, ref close)) if close.code == 1001));
        assert_eq!(registry.active(), 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn slow_reader_applies_backpressure_without_loss() {
        let settings = ProxySettings {
            relay_buffer: 2,
            ..ProxySettings::default()
        };
        let Relay {
            mut browser,
            mut app,
            task,
            ..
        } = start_relay(settings).await;
        const N: usize = 500;

        let sender = tokio::spawn(async move {
            for i in 0..N {
                browser
                    .send(UpstreamMessage::Binary(Bytes::from(vec![(i % 251) as u8; 1024])))
                    .await
                    .unwrap();
            }
            browser
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..N {
            match next_data(&mut app).await {
                UpstreamMessage::Binary(data) => {
                    assert_eq!(data.len(), 1024);
                    assert_eq!(data[0], (i % 251) as u8);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let mut browser = sender.await.unwrap();
        browser.close(None).await.unwrap();
        while browser.next().await.is_some() {}
        while app.next().await.is_some() {}
        assert!(task.await.unwrap().is_some());
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn late_client_write_does_not_hide_the_forwarded_close() {
        let Relay {
            mut browser,
            app,
            registry,
            task,
        } = start_relay(ProxySettings::default()).await;
        drop(app);
        // Let the client leg send its close before the browser writes again.
        tokio::time::sleep(Duration::from_millis(50)).await;

        browser
            .send(UpstreamMessage::Text("still here".into()))
            .await
            .unwrap();
        match next_data(&mut browser).await {
            UpstreamMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CloseInfo::GOING_AWAY);
            }
            other => panic!("expected close, got {other:?}"),
        }
        while browser.next().await.is_some() {}
        assert!(task.await.unwrap().is_some());
        assert_eq!(registry.active(), 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn both_legs_failing_together_tear_down_once() {
        for _ in 0..8 {
            let Relay {
                browser,
                app,
                registry,
                task,
            } = start_relay(ProxySettings::default()).await;
            drop((browser, app));

            let outcome = task.await.unwrap();
            match outcome {
                Some((_, close)) => assert_eq!(close.code, CloseInfo::GOING_AWAY),
                None => panic!("teardown recorded no outcome"),
            }
            assert_eq!(registry.active(), 0);
            assert_eq!(registry.opened(), 1);
            assert!(registry.snapshot().is_empty());
        }
    }

    #[test_timeout::timeout]
    fn only_one_leg_starts_the_teardown() {
        let pair = Arc::new(WebSocketPair::new("abc123", 3000));
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let racers: Vec<_> = [Side::Client, Side::Upstream]
            .into_iter()
            .map(|side| {
                let pair = pair.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    (side, pair.begin_close(side, CloseInfo::going_away("peer gone")))
                })
            })
            .collect();
        let won: Vec<Side> = racers
            .into_iter()
            .map(|racer| racer.join().unwrap())
            .filter(|(_, won)| *won)
            .map(|(side, _)| side)
            .collect();

        assert_eq!(won.len(), 1);
        assert_eq!(pair.outcome().map(|(side, _)| side), Some(won[0]));
        assert!(pair.is_closing());
        assert!(pair.cancel.is_cancelled());
    }

    #[test_timeout::timeout]
    fn losing_leg_forwards_the_winning_close() {
        let pair = WebSocketPair::new("abc123", 3000);
        assert_eq!(
            pair.settle_close(Side::Upstream, CloseInfo::keepalive_timeout()),
            CloseInfo::keepalive_timeout()
        );
        assert_eq!(
            pair.settle_close(Side::Client, CloseInfo::internal_error("transport error")),
            CloseInfo::keepalive_timeout()
        );
        assert_eq!(
            pair.outcome(),
            Some((Side::Upstream, CloseInfo::keepalive_timeout()))
        );
    }

    #[test_timeout::timeout]
    fn client_socket_errors_are_classified_by_type() {
        use axum_tungstenite::{error::ProtocolError as AxumProtocolError, Error as AxumWsError};

        let reset = axum::Error::new(AxumWsError::Protocol(
            AxumProtocolError::ResetWithoutClosingHandshake,
        ));
        assert!(reset.is_disconnect());
        let closed = axum::Error::new(AxumWsError::ConnectionClosed);
        assert!(closed.is_disconnect());
        let pipe = axum::Error::new(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(pipe.is_disconnect());

        let unmasked = axum::Error::new(AxumWsError::Protocol(
            AxumProtocolError::UnmaskedFrameFromClient,
        ));
        assert!(!unmasked.is_disconnect());
        // Wording alone does not make an error a disconnect.
        let worded = axum::Error::new("closing handshake failed");
        assert!(!worded.is_disconnect());
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn silent_upstream_trips_keepalive() {
        let Relay {
            mut browser,
            app,
            registry,
            task,
        } = start_relay(ProxySettings::default()).await;

        // The app never reads, so it never answers pings.
        match next_data(&mut browser).await {
            UpstreamMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1001);
                assert_eq!(frame.reason.as_str(), "keepalive timeout");
            }
            other => panic!("expected close, got {other:?}"),
        }
        while browser.next().await.is_some() {}
        let outcome = task.await.unwrap();
        assert_eq!(
            outcome,
            Some((Side::Upstream, CloseInfo::keepalive_timeout()))
        );
        assert_eq!(registry.active(), 0);
        drop(app);
    }
}
