use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WakeError {
    #[error("wake request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("wake endpoint answered {0}")]
    Status(u16),
}

impl WakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            WakeError::Request(err) if err.is_timeout() => "timeout",
            WakeError::Request(_) => "request",
            WakeError::Status(_) => "status",
        }
    }
}

#[async_trait]
pub trait SandboxWaker: Send + Sync {
    async fn wake(&self, sandbox_id: &str) -> Result<(), WakeError>;
}

/// Asks the orchestrator to resume a sandbox.
pub struct HttpWaker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWaker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, WakeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn wake_url(&self, sandbox_id: &str) -> String {
        format!("{}/sandboxes/{sandbox_id}/wake", self.base_url)
    }
}

#[async_trait]
impl SandboxWaker for HttpWaker {
    async fn wake(&self, sandbox_id: &str) -> Result<(), WakeError> {
        let response = self.client.post(self.wake_url(sandbox_id)).send().await?;
        let status = response.status();
        // 409: the orchestrator is already resuming this sandbox.
        if status.is_success() || status == StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(WakeError::Status(status.as_u16()))
        }
    }
}

/// Used when no wake endpoint is configured.
pub struct NoopWaker;

#[async_trait]
impl SandboxWaker for NoopWaker {
    async fn wake(&self, sandbox_id: &str) -> Result<(), WakeError> {
        debug!(sandbox_id = %sandbox_id, "no wake endpoint configured");
        Ok(())
    }
}

/// At most one wake per sandbox per `ttl`, however many requests arrive.
pub struct WakeDeduper {
    inflight: DashMap<String, Instant>,
    ttl: Duration,
}

impl WakeDeduper {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inflight: DashMap::new(),
            ttl,
        }
    }

    /// Returns true if the caller should issue the wake.
    pub fn try_claim(&self, sandbox_id: &str) -> bool {
        let now = Instant::now();
        match self.inflight.entry(sandbox_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) >= self.ttl {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub fn release(&self, sandbox_id: &str) {
        self.inflight.remove(sandbox_id);
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.inflight
            .retain(|_, claimed| now.duration_since(*claimed) < self.ttl);
    }
}

/// Fire-and-forget wake dispatch shared by every edge request.
#[derive(Clone)]
pub struct WakeTrigger {
    waker: Arc<dyn SandboxWaker>,
    dedup: Arc<WakeDeduper>,
}

impl WakeTrigger {
    pub fn new(waker: Arc<dyn SandboxWaker>, ttl: Duration) -> Self {
        Self {
            waker,
            dedup: Arc::new(WakeDeduper::new(ttl)),
        }
    }

    /// Spawns a wake unless one is already in flight. Returns whether a
    /// wake was dispatched. Failures never reach the caller.
    pub fn trigger(&self, sandbox_id: &str) -> bool {
        if !self.dedup.try_claim(sandbox_id) {
            metrics::counter!("jetty_wake_deduplicated_total", 1);
            return false;
        }
        self.dedup.purge_expired();
        let waker = Arc::clone(&self.waker);
        let dedup = Arc::clone(&self.dedup);
        let sandbox_id = sandbox_id.to_string();
        tokio::spawn(async move {
            match waker.wake(&sandbox_id).await {
                Ok(()) => {
                    metrics::counter!("jetty_wake_requests_total", 1);
                    info!(sandbox_id = %sandbox_id, "wake requested");
                }
                Err(err) => {
                    dedup.release(&sandbox_id);
                    metrics::counter!("jetty_wake_failures_total", 1, "reason" => err.metric_label());
                    warn!(sandbox_id = %sandbox_id, error = %err, "wake request failed");
                }
            }
        });
        true
    }
}
