use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChangeKind, RegistryChange, RegistryHandle, SandboxRecord};

/// Local mirror of the registry so request-path lookups never wait on I/O.
///
/// When the registry is unreachable the last known records are kept and the
/// mirror is flagged stale until the next successful reload.
#[derive(Default)]
pub struct SandboxDirectory {
    records: DashMap<String, SandboxRecord>,
    stale: AtomicBool,
}

impl SandboxDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lookup(&self, sandbox_id: &str) -> Option<SandboxRecord> {
        self.records.get(sandbox_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn insert(&self, record: SandboxRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn remove(&self, sandbox_id: &str) {
        self.records.remove(sandbox_id);
    }

    pub fn replace_all(&self, records: Vec<SandboxRecord>) {
        let live: HashSet<String> = records.iter().map(|record| record.id.clone()).collect();
        self.records.retain(|id, _| live.contains(id));
        for record in records {
            self.insert(record);
        }
        self.stale.store(false, Ordering::Relaxed);
    }

    pub async fn reload(&self, registry: &RegistryHandle) {
        match registry.get_all().await {
            Ok(records) => {
                debug!(count = records.len(), "sandbox directory reloaded");
                self.replace_all(records);
            }
            Err(err) => {
                self.stale.store(true, Ordering::Relaxed);
                metrics::counter!("jetty_directory_reload_failures_total", 1);
                warn!(error = %err, "sandbox directory reload failed; serving last known records");
            }
        }
    }

    async fn apply(&self, registry: &RegistryHandle, change: RegistryChange) {
        if change.kind == ChangeKind::Destroyed {
            self.remove(&change.sandbox_id);
            return;
        }
        match registry.get(&change.sandbox_id).await {
            Ok(Some(record)) => self.insert(record),
            Ok(None) => self.remove(&change.sandbox_id),
            Err(err) => {
                self.stale.store(true, Ordering::Relaxed);
                warn!(sandbox_id = %change.sandbox_id, error = %err, "failed to refresh sandbox record");
            }
        }
    }

    /// Keeps the mirror in step with the registry until `cancel` fires.
    pub fn spawn_sync(
        self: &Arc<Self>,
        registry: RegistryHandle,
        resync_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut changes = registry.subscribe();
            directory.reload(&registry).await;
            let mut resync = tokio::time::interval(resync_interval);
            resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
            resync.tick().await;
            let mut feed_open = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv(), if feed_open => match change {
                        Ok(change) => directory.apply(&registry, change).await,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "directory change feed lagged; reloading");
                            directory.reload(&registry).await;
                        }
                        Err(RecvError::Closed) => {
                            warn!("registry change feed closed; relying on periodic resync");
                            feed_open = false;
                        }
                    },
                    _ = resync.tick() => directory.reload(&registry).await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, LifecycleState};

    fn running(id: &str) -> SandboxRecord {
        SandboxRecord::new(id, "us2", LifecycleState::Running).with_pod_address("10.0.0.1")
    }

    #[test_timeout::timeout]
    fn replace_all_drops_missing_records() {
        let directory = SandboxDirectory::new();
        directory.insert(running("a"));
        directory.insert(running("b"));
        directory.replace_all(vec![running("b"), running("c")]);
        assert!(directory.lookup("a").is_none());
        assert!(directory.lookup("b").is_some());
        assert!(directory.lookup("c").is_some());
        assert_eq!(directory.len(), 2);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn follows_registry_changes_and_survives_outage() {
        let registry = InMemoryRegistry::with_records([running("a")]);
        let handle: RegistryHandle = registry.clone();
        let directory = SandboxDirectory::new();
        let cancel = CancellationToken::new();
        let task = directory.spawn_sync(handle, Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(directory.lookup("a").is_some());

        registry.upsert(running("b"));
        registry.update("a", |r| r.state = LifecycleState::Hibernating);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            directory.lookup("a").map(|r| r.state),
            Some(LifecycleState::Hibernating)
        );
        assert!(directory.lookup("b").is_some());

        registry.set_available(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(directory.is_stale());
        assert!(directory.lookup("b").is_some(), "last known records are kept");

        registry.set_available(true);
        registry.remove("b");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(directory.lookup("b").is_none());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!directory.is_stale());

        cancel.cancel();
        task.await.expect("sync task");
    }
}
