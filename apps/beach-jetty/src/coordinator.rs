use chrono::{DateTime, Utc};
use jetty_proto::resources::{Cluster, Resource, ResourceType, RouteConfiguration};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::generator::{digest, generate, GeneratorSettings};
use crate::registry::{RegistryError, RegistryHandle};

/// An immutable, versioned view of every generated resource. A new value is
/// published for each change; published snapshots are never mutated.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub version: u64,
    pub clusters: Arc<Vec<Cluster>>,
    pub routes: Arc<RouteConfiguration>,
    pub cluster_digest: String,
    pub route_digest: String,
    pub generated_at: DateTime<Utc>,
    /// Set while the registry is unreachable and this content may be outdated.
    pub stale: bool,
}

impl ResourceSnapshot {
    /// Version 0: nothing generated yet.
    pub fn empty(route_config_name: &str) -> Self {
        let clusters: Vec<Cluster> = Vec::new();
        let routes = RouteConfiguration {
            name: route_config_name.to_string(),
            virtual_hosts: Vec::new(),
        };
        Self {
            version: 0,
            cluster_digest: digest(&clusters),
            route_digest: digest(&routes),
            clusters: Arc::new(clusters),
            routes: Arc::new(routes),
            generated_at: Utc::now(),
            stale: false,
        }
    }

    pub fn version_info(&self) -> String {
        self.version.to_string()
    }

    pub fn digest(&self, resource_type: ResourceType) -> &str {
        match resource_type {
            ResourceType::Cluster => &self.cluster_digest,
            ResourceType::Route => &self.route_digest,
        }
    }

    pub fn resources(&self, resource_type: ResourceType) -> Vec<Resource> {
        match resource_type {
            ResourceType::Cluster => self
                .clusters
                .iter()
                .cloned()
                .map(Resource::Cluster)
                .collect(),
            ResourceType::Route => vec![Resource::RouteConfiguration((*self.routes).clone())],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub coalesce_window: Duration,
    pub resync_interval: Duration,
    /// Snapshots buffered per subscriber before the oldest are dropped.
    pub snapshot_buffer: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(250),
            resync_interval: Duration::from_secs(30),
            snapshot_buffer: 16,
        }
    }
}

/// Sole writer of resource snapshots. Watches the registry, regenerates
/// resources and fans new snapshots out to every session.
pub struct PushCoordinator {
    registry: RegistryHandle,
    generator: GeneratorSettings,
    settings: CoordinatorSettings,
    version: AtomicU64,
    current: RwLock<Arc<ResourceSnapshot>>,
    updates: broadcast::Sender<Arc<ResourceSnapshot>>,
    refresh_lock: Mutex<()>,
}

impl PushCoordinator {
    pub fn new(
        registry: RegistryHandle,
        generator: GeneratorSettings,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(settings.snapshot_buffer.max(1));
        let initial = Arc::new(ResourceSnapshot::empty(&generator.route_config_name));
        Arc::new(Self {
            registry,
            generator,
            settings,
            version: AtomicU64::new(0),
            current: RwLock::new(initial),
            updates,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Arc<ResourceSnapshot> {
        self.current.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ResourceSnapshot>> {
        self.updates.subscribe()
    }

    /// Reads the whole registry and publishes a new snapshot when either
    /// digest changed. Returns the published snapshot, if any.
    pub async fn refresh(&self) -> Result<Option<Arc<ResourceSnapshot>>, RegistryError> {
        let _writer = self.refresh_lock.lock().await;

        let records = match self.registry.get_all().await {
            Ok(records) => records,
            Err(err) => {
                self.mark_stale();
                counter!("jetty_registry_failures_total", 1);
                warn!(error = %err, "registry unavailable; serving last snapshot");
                return Err(err);
            }
        };
        gauge!("jetty_registry_stale", 0.0);

        let generated = generate(&records, &self.generator);
        for err in &generated.skipped {
            warn!(sandbox_id = %err.sandbox_id, error = %err, "skipping sandbox with invalid routing data");
            counter!("jetty_generate_skipped_total", 1, "reason" => err.metric_label());
        }
        let cluster_digest = generated.cluster_digest();
        let route_digest = generated.route_digest();

        let current = self.current();
        if current.version > 0
            && current.cluster_digest == cluster_digest
            && current.route_digest == route_digest
        {
            if current.stale {
                let mut recovered = (*current).clone();
                recovered.stale = false;
                *self.current.write() = Arc::new(recovered);
                info!(version = current.version, "registry recovered; snapshot unchanged");
            }
            return Ok(None);
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(ResourceSnapshot {
            version,
            clusters: Arc::new(generated.clusters),
            routes: Arc::new(generated.routes),
            cluster_digest,
            route_digest,
            generated_at: Utc::now(),
            stale: false,
        });
        self.publish(snapshot.clone());
        info!(
            version,
            clusters = snapshot.clusters.len(),
            virtual_hosts = snapshot.routes.virtual_hosts.len(),
            "published resource snapshot"
        );
        Ok(Some(snapshot))
    }

    fn publish(&self, snapshot: Arc<ResourceSnapshot>) {
        *self.current.write() = snapshot.clone();
        gauge!("jetty_snapshot_version", snapshot.version as f64);
        counter!("jetty_snapshots_published_total", 1);
        // No receivers simply means no proxy is connected yet.
        let _ = self.updates.send(snapshot);
    }

    fn mark_stale(&self) {
        gauge!("jetty_registry_stale", 1.0);
        let mut guard = self.current.write();
        if guard.stale {
            return;
        }
        let mut stale = (**guard).clone();
        stale.stale = true;
        *guard = Arc::new(stale);
    }

    /// Waits out the coalescing window, then discards whatever queued up
    /// meanwhile. Returns how many notifications were folded in.
    async fn coalesce(
        &self,
        changes: &mut broadcast::Receiver<crate::registry::RegistryChange>,
        cancel: &CancellationToken,
    ) -> usize {
        tokio::select! {
            _ = cancel.cancelled() => return 0,
            _ = tokio::time::sleep(self.settings.coalesce_window) => {}
        }
        let mut absorbed = 0;
        loop {
            match changes.try_recv() {
                Ok(_) => absorbed += 1,
                Err(TryRecvError::Lagged(skipped)) => absorbed += skipped as usize,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        absorbed
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run(cancel).await })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.registry.subscribe();
        let _ = self.refresh().await;

        let mut resync = tokio::time::interval(self.settings.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;
        let mut feed_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv(), if feed_open => {
                    match change {
                        Ok(change) => debug!(
                            sandbox_id = %change.sandbox_id,
                            kind = ?change.kind,
                            "registry change"
                        ),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "registry change feed lagged")
                        }
                        Err(RecvError::Closed) => {
                            warn!("registry change feed closed; relying on periodic resync");
                            feed_open = false;
                            continue;
                        }
                    }
                    let absorbed = self.coalesce(&mut changes, &cancel).await;
                    if absorbed > 0 {
                        debug!(absorbed, "coalesced registry changes");
                    }
                    let _ = self.refresh().await;
                }
                _ = resync.tick() => {
                    let _ = self.refresh().await;
                }
            }
        }
        debug!("push coordinator stopped");
    }
}
