//! Typed runtime configuration, validated from the command line.

use jetty_proto::resources::{is_dns_label, Endpoint};
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::bootstrap::BootstrapOptions;
use crate::cli::{BootstrapArgs, ControlPlaneArgs, EdgeArgs, SharedArgs};
use crate::coordinator::CoordinatorSettings;
use crate::generator::GeneratorSettings;
use crate::health::HealthSettings;
use crate::session::{NackBackoff, SessionSettings};
use crate::websocket::ProxySettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field} {value:?}: {source}")]
    InvalidAddr {
        field: &'static str,
        value: String,
        #[source]
        source: AddrParseError,
    },
    #[error("invalid {field} {value:?}: expected host:port")]
    InvalidEndpoint { field: &'static str, value: String },
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("route config name must not be empty")]
    EmptyRouteConfigName,
    #[error("nack backoff base {base:?} exceeds max {max:?}")]
    Backoff { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    Redis(String),
    Seed(PathBuf),
    /// No registry configured; every lookup misses.
    Empty,
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// gRPC aggregated discovery.
    pub listen_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub registry: RegistrySource,
    pub generator: GeneratorSettings,
    pub coordinator: CoordinatorSettings,
    pub session: SessionSettings,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub listen_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub registry: RegistrySource,
    pub domain: String,
    pub resync_interval: Duration,
    pub wake_url: Option<String>,
    pub wake_timeout: Duration,
    pub health: HealthSettings,
    pub proxy: ProxySettings,
    pub shutdown_grace: Duration,
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|source| ConfigError::InvalidAddr {
        field,
        value: value.to_string(),
        source,
    })
}

/// Parses `host:port`, accepting bracketed IPv6 hosts.
fn parse_endpoint(field: &'static str, value: &str) -> Result<Endpoint, ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint {
        field,
        value: value.to_string(),
    };
    let (host, port) = value.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Endpoint::new(host, port).map_err(|_| invalid())
}

fn seconds(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero(field));
    }
    Ok(Duration::from_secs(value))
}

fn normalize_domain(domain: &str) -> Result<String, ConfigError> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() || !normalized.split('.').all(is_dns_label) {
        return Err(ConfigError::InvalidDomain(domain.to_string()));
    }
    Ok(normalized)
}

impl SharedArgs {
    pub fn registry_source(&self) -> RegistrySource {
        match (&self.redis_url, &self.seed_file) {
            (Some(url), _) => RegistrySource::Redis(url.clone()),
            (None, Some(path)) => RegistrySource::Seed(path.clone()),
            (None, None) => RegistrySource::Empty,
        }
    }
}

impl TryFrom<(&SharedArgs, &ControlPlaneArgs)> for ControlPlaneConfig {
    type Error = ConfigError;

    fn try_from((shared, args): (&SharedArgs, &ControlPlaneArgs)) -> Result<Self, Self::Error> {
        let domain = normalize_domain(&shared.domain)?;
        if args.route_config_name.trim().is_empty() {
            return Err(ConfigError::EmptyRouteConfigName);
        }
        if args.coalesce_ms == 0 {
            return Err(ConfigError::Zero("coalesce window"));
        }
        let backoff = NackBackoff {
            base: seconds("nack backoff base", args.nack_backoff_base_secs)?,
            max: seconds("nack backoff max", args.nack_backoff_max_secs)?,
            alert_threshold: args.nack_alert_threshold.max(1),
        };
        if backoff.base > backoff.max {
            return Err(ConfigError::Backoff {
                base: backoff.base,
                max: backoff.max,
            });
        }

        let mut generator = GeneratorSettings::new(domain)
            .with_edge(parse_endpoint("edge upstream", &args.edge_upstream)?);
        generator.route_config_name = args.route_config_name.trim().to_string();
        Ok(Self {
            listen_addr: parse_addr("control plane address", &args.control_plane_addr)?,
            http_addr: parse_addr("control plane http address", &args.control_plane_http_addr)?,
            registry: shared.registry_source(),
            generator,
            coordinator: CoordinatorSettings {
                coalesce_window: Duration::from_millis(args.coalesce_ms),
                resync_interval: seconds("resync interval", shared.resync_secs)?,
                ..CoordinatorSettings::default()
            },
            session: SessionSettings {
                write_timeout: seconds("discovery write timeout", args.discovery_write_timeout_secs)?,
                backoff,
                ..SessionSettings::default()
            },
            shutdown_grace: Duration::from_secs(shared.shutdown_grace_secs),
        })
    }
}

impl TryFrom<(&SharedArgs, &EdgeArgs)> for EdgeConfig {
    type Error = ConfigError;

    fn try_from((shared, args): (&SharedArgs, &EdgeArgs)) -> Result<Self, Self::Error> {
        if args.relay_buffer == 0 {
            return Err(ConfigError::Zero("relay buffer"));
        }
        let wake_url = args
            .wake_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        Ok(Self {
            listen_addr: parse_addr("edge address", &args.edge_addr)?,
            admin_addr: parse_addr("admin address", &args.admin_addr)?,
            registry: shared.registry_source(),
            domain: normalize_domain(&shared.domain)?,
            resync_interval: seconds("resync interval", shared.resync_secs)?,
            wake_url,
            wake_timeout: seconds("wake timeout", args.wake_timeout_secs)?,
            health: HealthSettings {
                hibernating_retry_after: args.hibernating_retry_after,
                starting_retry_after: args.starting_retry_after,
                error_retry_after: args.error_retry_after,
                default_retry_after: args.default_retry_after,
                wake_dedup_ttl: seconds("wake dedup window", args.wake_dedup_secs)?,
            },
            proxy: ProxySettings {
                connect_timeout: seconds("upstream connect timeout", args.upstream_connect_timeout_secs)?,
                keepalive_interval: seconds("keepalive interval", args.keepalive_secs)?,
                write_timeout: seconds("websocket write timeout", args.ws_write_timeout_secs)?,
                relay_buffer: args.relay_buffer,
                upgrade_retry_after: args.default_retry_after,
            },
            shutdown_grace: Duration::from_secs(shared.shutdown_grace_secs),
        })
    }
}

impl From<&BootstrapArgs> for BootstrapOptions {
    fn from(args: &BootstrapArgs) -> Self {
        Self {
            node_id: args.node_id.clone(),
            node_cluster: args.node_cluster.clone(),
            control_plane_host: args.control_plane_host.clone(),
            control_plane_port: args.control_plane_port,
            route_config_name: args.route_config_name.clone(),
            admin_port: args.admin_port,
        }
    }
}
