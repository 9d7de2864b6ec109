//! Read side of the sandbox registry.
//!
//! The registry itself belongs to the sandbox orchestrator; jetty only reads
//! snapshots and listens for change notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jetty_proto::host::public_url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

mod directory;
mod memory;
mod redis;

pub use directory::SandboxDirectory;
pub use memory::InMemoryRegistry;
pub use self::redis::RedisRegistry;

/// Depth of each subscriber's change queue. Slow subscribers lose the
/// oldest notifications and are expected to resync from `get_all`.
pub const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    Running,
    Hibernating,
    Error,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port: u16,
    pub public_url: String,
    #[serde(default)]
    pub health: PortHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub region: String,
    #[serde(default)]
    pub pod_address: Option<String>,
    pub state: LifecycleState,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Where a routable sandbox port can be reached from inside the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub sandbox_id: String,
    pub address: String,
    pub port: u16,
}

impl SandboxRecord {
    pub fn new(id: impl Into<String>, region: impl Into<String>, state: LifecycleState) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            pod_address: None,
            state,
            ports: Vec::new(),
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_pod_address(mut self, address: impl Into<String>) -> Self {
        self.pod_address = Some(address.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Adds (or replaces) a port binding, keeping bindings ordered by port.
    pub fn expose(mut self, port: u16, domain: &str) -> Self {
        let binding = PortBinding {
            port,
            public_url: public_url(port, &self.id, &self.region, domain),
            health: PortHealth::Unknown,
        };
        match self.ports.binary_search_by_key(&port, |b| b.port) {
            Ok(index) => self.ports[index] = binding,
            Err(index) => self.ports.insert(index, binding),
        }
        self
    }

    pub fn port(&self, port: u16) -> Option<&PortBinding> {
        self.ports.iter().find(|binding| binding.port == port)
    }

    /// Running with a known pod address.
    pub fn is_routable(&self) -> bool {
        self.state == LifecycleState::Running
            && self
                .pod_address
                .as_deref()
                .is_some_and(|address| !address.trim().is_empty())
    }

    pub fn upstream_for(&self, region: &str, port: u16) -> Option<UpstreamTarget> {
        if !self.is_routable() || self.region != region {
            return None;
        }
        self.port(port)?;
        Some(UpstreamTarget {
            sandbox_id: self.id.clone(),
            address: self.pod_address.clone()?,
            port,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryChange {
    pub sandbox_id: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("failed to load sandbox seed file: {0}")]
    Seed(String),
}

impl From<::redis::RedisError> for RegistryError {
    fn from(err: ::redis::RedisError) -> Self {
        RegistryError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait SandboxRegistry: Send + Sync {
    async fn get_all(&self) -> Result<Vec<SandboxRecord>, RegistryError>;

    async fn get(&self, id: &str) -> Result<Option<SandboxRecord>, RegistryError>;

    fn subscribe(&self) -> broadcast::Receiver<RegistryChange>;
}

pub type RegistryHandle = Arc<dyn SandboxRegistry>;
