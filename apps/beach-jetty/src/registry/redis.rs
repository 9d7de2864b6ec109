use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RegistryChange, RegistryError, SandboxRecord, SandboxRegistry, CHANGE_BUFFER};

/// Set holding every known sandbox id.
pub const SANDBOX_SET_KEY: &str = "jetty:sandboxes";
/// Pub/sub channel carrying JSON-encoded [`RegistryChange`]s.
pub const CHANGES_CHANNEL: &str = "jetty:sandbox:changes";

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

pub fn record_key(sandbox_id: &str) -> String {
    format!("jetty:sandbox:{sandbox_id}")
}

/// Registry backed by the orchestrator's Redis keyspace: one JSON document
/// per sandbox plus an id set and a change channel.
pub struct RedisRegistry {
    redis: ConnectionManager,
    changes: broadcast::Sender<RegistryChange>,
    listener: JoinHandle<()>,
}

impl RedisRegistry {
    pub async fn connect(redis_url: &str) -> Result<Arc<Self>, RegistryError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client.clone()).await?;
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let listener = tokio::spawn(listen_for_changes(client, changes.clone()));
        info!(channel = CHANGES_CHANNEL, "connected to sandbox registry");
        Ok(Arc::new(Self {
            redis,
            changes,
            listener,
        }))
    }
}

impl Drop for RedisRegistry {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn decode_record(sandbox_id: &str, raw: &str) -> Option<SandboxRecord> {
    match serde_json::from_str::<SandboxRecord>(raw) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(sandbox_id = %sandbox_id, error = %err, "ignoring undecodable sandbox record");
            metrics::counter!("jetty_registry_decode_errors_total", 1);
            None
        }
    }
}

#[async_trait]
impl SandboxRegistry for RedisRegistry {
    async fn get_all(&self) -> Result<Vec<SandboxRecord>, RegistryError> {
        let mut conn = self.redis.clone();
        let mut ids: Vec<String> = conn.smembers(SANDBOX_SET_KEY).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();
        let keys: Vec<String> = ids.iter().map(|id| record_key(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(ids
            .iter()
            .zip(values)
            .filter_map(|(id, raw)| raw.and_then(|raw| decode_record(id, &raw)))
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxRecord>, RegistryError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(record_key(id)).await?;
        Ok(raw.and_then(|raw| decode_record(id, &raw)))
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }
}

/// Relays pub/sub notifications into the broadcast channel, resubscribing
/// after connection loss. Notifications missed while disconnected are
/// recovered by consumers' periodic resync.
async fn listen_for_changes(client: Client, changes: broadcast::Sender<RegistryChange>) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(err) = pubsub.subscribe(CHANGES_CHANNEL).await {
                    warn!(error = %err, "failed to subscribe to registry changes");
                } else {
                    debug!(channel = CHANGES_CHANNEL, "subscribed to registry changes");
                    let mut messages = pubsub.on_message();
                    while let Some(message) = messages.next().await {
                        let payload: String = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(error = %err, "unreadable registry change payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<RegistryChange>(&payload) {
                            Ok(change) => {
                                let _ = changes.send(change);
                            }
                            Err(err) => {
                                warn!(error = %err, payload = %payload, "malformed registry change")
                            }
                        }
                    }
                    warn!("registry change subscription ended");
                }
            }
            Err(err) => warn!(error = %err, "failed to open registry pub/sub connection"),
        }
        metrics::counter!("jetty_registry_resubscribes_total", 1);
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
