//! Maps sandbox records onto cluster and route resources.
//!
//! Generation is a pure function of its input: records are ordered by id
//! and ports by number before mapping, and every resource type serializes
//! through plain structs, so identical registry state always produces
//! byte-identical output and identical digests.
//!
//! Only running sandboxes with a pod address get direct routes. When an edge
//! endpoint is configured, upgrades on those routes go to the edge, and a
//! wildcard host sends every other sandbox hostname there too, so the edge
//! answers for sandboxes that are starting, asleep, failed or unknown.

use jetty_proto::host::route_domain;
use jetty_proto::resources::{
    ensure_dns_label, Cluster, ClusterDefaults, Endpoint, ResourceError, RetryPolicy,
    RouteConfiguration, VirtualHost,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::debug;

use crate::registry::{LifecycleState, SandboxRecord};

pub const DEFAULT_ROUTE_CONFIG_NAME: &str = "sandbox_routes";
pub const EDGE_CLUSTER_NAME: &str = "jetty-edge";
pub const EDGE_FALLBACK_HOST: &str = "edge_fallback";
/// Path the proxies health-check the edge cluster on.
pub const EDGE_HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub domain: String,
    pub route_config_name: String,
    pub cluster_defaults: ClusterDefaults,
    pub retry_policy: RetryPolicy,
    /// Edge service address as seen from the proxies.
    pub edge: Option<Endpoint>,
}

impl GeneratorSettings {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            route_config_name: DEFAULT_ROUTE_CONFIG_NAME.to_string(),
            cluster_defaults: ClusterDefaults::default(),
            retry_policy: RetryPolicy::default(),
            edge: None,
        }
    }

    pub fn with_edge(mut self, edge: Endpoint) -> Self {
        self.edge = Some(edge);
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sandbox {sandbox_id}: {source}")]
pub struct GenerateError {
    pub sandbox_id: String,
    #[source]
    pub source: ResourceError,
}

impl GenerateError {
    pub fn metric_label(&self) -> &'static str {
        match self.source {
            ResourceError::InvalidLabel { .. } => "invalid_label",
            ResourceError::InvalidName(_) => "invalid_name",
            ResourceError::ZeroPort => "zero_port",
            ResourceError::EmptyAddress => "empty_address",
            ResourceError::NoDomains => "no_domains",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedResources {
    pub clusters: Vec<Cluster>,
    pub routes: RouteConfiguration,
    /// Sandboxes left out because their record could not be mapped.
    pub skipped: Vec<GenerateError>,
}

impl GeneratedResources {
    pub fn cluster_digest(&self) -> String {
        digest(&self.clusters)
    }

    pub fn route_digest(&self) -> String {
        digest(&self.routes)
    }
}

pub fn cluster_name(sandbox_id: &str, port: u16) -> String {
    format!("sbx-{sandbox_id}-{port}")
}

/// Hex SHA-256 of the JSON serialization.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> String {
    // Only structs, vectors and strings reach this point, which always serialize.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn eligible(record: &SandboxRecord) -> bool {
    record.state == LifecycleState::Running
        && record.pod_address.is_some()
        && !record.ports.is_empty()
}

/// Orders duplicates of one id newest first, then by content, so the record
/// kept for an id never depends on input order.
fn newest_first(a: &SandboxRecord, b: &SandboxRecord) -> Ordering {
    b.updated_at.cmp(&a.updated_at).then_with(|| {
        let a = serde_json::to_vec(a).unwrap_or_default();
        let b = serde_json::to_vec(b).unwrap_or_default();
        a.cmp(&b)
    })
}

fn edge_resources(
    edge: &Endpoint,
    settings: &GeneratorSettings,
) -> Result<(Cluster, VirtualHost), ResourceError> {
    let mut defaults = settings.cluster_defaults.clone();
    defaults.health_check.path = EDGE_HEALTH_PATH.to_string();
    let cluster = Cluster::new(EDGE_CLUSTER_NAME, edge.clone(), &defaults)?;
    let mut host = VirtualHost::new(
        format!("*.{}", settings.domain),
        &cluster,
        &settings.retry_policy,
    )?;
    host.name = EDGE_FALLBACK_HOST.to_string();
    Ok((cluster, host))
}

fn sandbox_resources(
    record: &SandboxRecord,
    edge: Option<&Cluster>,
    settings: &GeneratorSettings,
) -> Result<Vec<(Cluster, VirtualHost)>, ResourceError> {
    ensure_dns_label("sandbox id", &record.id)?;
    ensure_dns_label("region", &record.region)?;
    let address = record.pod_address.as_deref().unwrap_or_default();

    let mut ports: Vec<u16> = record.ports.iter().map(|binding| binding.port).collect();
    ports.sort_unstable();
    ports.dedup();

    ports
        .into_iter()
        .map(|port| {
            let endpoint = Endpoint::new(address, port)?;
            let cluster = Cluster::new(
                cluster_name(&record.id, port),
                endpoint,
                &settings.cluster_defaults,
            )?;
            let domain = route_domain(port, &record.id, &record.region, &settings.domain);
            let mut host = VirtualHost::new(domain, &cluster, &settings.retry_policy)?;
            if let Some(edge) = edge {
                host = host.with_upgrade_route(edge, &settings.retry_policy);
            }
            Ok((cluster, host))
        })
        .collect()
}

pub fn generate(records: &[SandboxRecord], settings: &GeneratorSettings) -> GeneratedResources {
    let mut ordered: Vec<&SandboxRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| newest_first(a, b)));
    let before = ordered.len();
    ordered.dedup_by(|later, kept| later.id == kept.id);
    if ordered.len() < before {
        debug!(dropped = before - ordered.len(), "ignoring older duplicate sandbox records");
    }

    let mut clusters = Vec::new();
    let mut virtual_hosts = Vec::new();
    let mut skipped = Vec::new();

    let edge = match settings.edge.as_ref().map(|edge| edge_resources(edge, settings)) {
        Some(Ok(edge)) => Some(edge),
        Some(Err(source)) => {
            skipped.push(GenerateError {
                sandbox_id: EDGE_CLUSTER_NAME.to_string(),
                source,
            });
            None
        }
        None => None,
    };
    let edge_cluster = edge.as_ref().map(|(cluster, _)| cluster);

    for record in ordered.into_iter().filter(|record| eligible(record)) {
        match sandbox_resources(record, edge_cluster, settings) {
            Ok(pairs) => {
                for (cluster, host) in pairs {
                    clusters.push(cluster);
                    virtual_hosts.push(host);
                }
            }
            Err(source) => skipped.push(GenerateError {
                sandbox_id: record.id.clone(),
                source,
            }),
        }
    }

    // Exact sandbox hosts take precedence over the wildcard.
    if let Some((cluster, host)) = edge {
        clusters.push(cluster);
        virtual_hosts.push(host);
    }

    GeneratedResources {
        clusters,
        routes: RouteConfiguration {
            name: settings.route_config_name.clone(),
            virtual_hosts,
        },
        skipped,
    }
}
