use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{
    ChangeKind, RegistryChange, RegistryError, SandboxRecord, SandboxRegistry, CHANGE_BUFFER,
};

/// Process-local registry for development, seeded deployments and tests.
pub struct InMemoryRegistry {
    records: RwLock<BTreeMap<String, SandboxRecord>>,
    changes: broadcast::Sender<RegistryChange>,
    available: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Arc::new(Self {
            records: RwLock::new(BTreeMap::new()),
            changes,
            available: AtomicBool::new(true),
        })
    }

    pub fn with_records(records: impl IntoIterator<Item = SandboxRecord>) -> Arc<Self> {
        let registry = Self::new();
        {
            let mut guard = registry.records.write();
            for record in records {
                guard.insert(record.id.clone(), record);
            }
        }
        registry
    }

    /// Loads a JSON array of sandbox records.
    pub fn from_seed_file(path: &Path) -> Result<Arc<Self>, RegistryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| RegistryError::Seed(format!("{}: {err}", path.display())))?;
        let records: Vec<SandboxRecord> = serde_json::from_str(&raw)
            .map_err(|err| RegistryError::Seed(format!("{}: {err}", path.display())))?;
        Ok(Self::with_records(records))
    }

    pub fn upsert(&self, record: SandboxRecord) {
        let sandbox_id = record.id.clone();
        let previous = self.records.write().insert(sandbox_id.clone(), record);
        let kind = if previous.is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        let _ = self.changes.send(RegistryChange { sandbox_id, kind });
    }

    /// Applies `update` to an existing record. Returns false when the id is unknown.
    pub fn update(&self, sandbox_id: &str, update: impl FnOnce(&mut SandboxRecord)) -> bool {
        {
            let mut guard = self.records.write();
            let Some(record) = guard.get_mut(sandbox_id) else {
                return false;
            };
            update(record);
            record.updated_at = chrono::Utc::now();
        }
        let _ = self.changes.send(RegistryChange {
            sandbox_id: sandbox_id.to_string(),
            kind: ChangeKind::Updated,
        });
        true
    }

    pub fn remove(&self, sandbox_id: &str) -> Option<SandboxRecord> {
        let removed = self.records.write().remove(sandbox_id);
        if removed.is_some() {
            let _ = self.changes.send(RegistryChange {
                sandbox_id: sandbox_id.to_string(),
                kind: ChangeKind::Destroyed,
            });
        }
        removed
    }

    /// While unavailable every read fails, mimicking a registry outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable("in-memory registry offline".into()))
        }
    }
}

#[async_trait]
impl SandboxRegistry for InMemoryRegistry {
    async fn get_all(&self) -> Result<Vec<SandboxRecord>, RegistryError> {
        self.ensure_available()?;
        Ok(self.records.read().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxRecord>, RegistryError> {
        self.ensure_available()?;
        Ok(self.records.read().get(id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }
}
