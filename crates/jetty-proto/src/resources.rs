use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

/// Discovery resource kinds served by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cluster,
    Route,
}

impl ResourceType {
    pub const ALL: [ResourceType; 2] = [ResourceType::Cluster, ResourceType::Route];

    pub fn type_url(self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE_URL,
            ResourceType::Route => ROUTE_TYPE_URL,
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        match type_url {
            CLUSTER_TYPE_URL => Some(ResourceType::Cluster),
            ROUTE_TYPE_URL => Some(ResourceType::Route),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Cluster => "cluster",
            ResourceType::Route => "route",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("{field} must be a lowercase DNS label, got {value:?}")]
    InvalidLabel { field: &'static str, value: String },
    #[error("invalid resource name {0:?}")]
    InvalidName(String),
    #[error("port must be non-zero")]
    ZeroPort,
    #[error("endpoint address must not be empty")]
    EmptyAddress,
    #[error("virtual host needs at least one domain")]
    NoDomains,
}

/// Returns true for a lowercase RFC 1123 label: 1-63 chars of `[a-z0-9-]`,
/// not starting or ending with a hyphen.
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes.first() != Some(&b'-')
        && bytes.last() != Some(&b'-')
}

pub fn ensure_dns_label(field: &'static str, value: &str) -> Result<(), ResourceError> {
    if is_dns_label(value) {
        Ok(())
    } else {
        Err(ResourceError::InvalidLabel {
            field,
            value: value.to_string(),
        })
    }
}

fn ensure_resource_name(name: &str) -> Result<(), ResourceError> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(ResourceError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Result<Self, ResourceError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(ResourceError::EmptyAddress);
        }
        if port == 0 {
            return Err(ResourceError::ZeroPort);
        }
        Ok(Self { address, port })
    }
}

/// Active HTTP health check against the single endpoint of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval_ms: 10_000,
            timeout_ms: 2_000,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub max_connections: u32,
    pub max_pending_requests: u32,
    pub max_requests: u32,
    pub max_retries: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            max_connections: 1_024,
            max_pending_requests: 256,
            max_requests: 1_024,
            max_retries: 3,
        }
    }
}

/// Fixed settings stamped onto every generated cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDefaults {
    pub connect_timeout_ms: u64,
    pub health_check: HealthCheck,
    pub circuit_breaker: CircuitBreaker,
}

impl Default for ClusterDefaults {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            health_check: HealthCheck::default(),
            circuit_breaker: CircuitBreaker::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub connect_timeout_ms: u64,
    pub endpoint: Endpoint,
    pub health_check: HealthCheck,
    pub circuit_breaker: CircuitBreaker,
    pub websocket_upgrade: bool,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        defaults: &ClusterDefaults,
    ) -> Result<Self, ResourceError> {
        let name = name.into();
        ensure_resource_name(&name)?;
        Ok(Self {
            name,
            connect_timeout_ms: defaults.connect_timeout_ms,
            endpoint,
            health_check: defaults.health_check.clone(),
            circuit_breaker: defaults.circuit_breaker.clone(),
            websocket_upgrade: true,
        })
    }
}

/// Retries apply to idempotent failures only: connect errors, refused
/// streams and upstream 5xx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: "connect-failure,refused-stream,5xx".to_string(),
            num_retries: 2,
            per_try_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAction {
    pub cluster: String,
    /// Zero disables the request timeout.
    pub timeout_ms: u64,
    /// Zero disables the stream idle timeout.
    pub idle_timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub upgrade_types: Vec<String>,
}

impl RouteAction {
    /// Request and idle timeouts are disabled so WebSocket streams can live
    /// indefinitely.
    fn long_lived(cluster: &Cluster, retry_policy: &RetryPolicy) -> Self {
        Self {
            cluster: cluster.name.clone(),
            timeout_ms: 0,
            idle_timeout_ms: 0,
            retry_policy: retry_policy.clone(),
            upgrade_types: vec![WEBSOCKET_UPGRADE.to_string()],
        }
    }
}

pub const WEBSOCKET_UPGRADE: &str = "websocket";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatch {
    pub prefix: String,
    /// Restricts the route to requests whose `Upgrade` header equals this
    /// value, compared case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    pub action: RouteAction,
}

/// Routes are evaluated in order; the first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

impl VirtualHost {
    /// Sends every request for `domain` to `cluster`.
    pub fn new(
        domain: impl Into<String>,
        cluster: &Cluster,
        retry_policy: &RetryPolicy,
    ) -> Result<Self, ResourceError> {
        let domain = domain.into();
        if domain.trim().is_empty() {
            return Err(ResourceError::NoDomains);
        }
        Ok(Self {
            name: cluster.name.clone(),
            domains: vec![domain],
            routes: vec![Route {
                matcher: RouteMatch {
                    prefix: "/".to_string(),
                    upgrade: None,
                },
                action: RouteAction::long_lived(cluster, retry_policy),
            }],
        })
    }

    /// Sends WebSocket upgrades to `cluster` ahead of the existing routes.
    pub fn with_upgrade_route(mut self, cluster: &Cluster, retry_policy: &RetryPolicy) -> Self {
        self.routes.insert(
            0,
            Route {
                matcher: RouteMatch {
                    prefix: "/".to_string(),
                    upgrade: Some(WEBSOCKET_UPGRADE.to_string()),
                },
                action: RouteAction::long_lived(cluster, retry_policy),
            },
        );
        self
    }

    /// Action for requests that match no more specific route.
    pub fn default_action(&self) -> Option<&RouteAction> {
        self.routes
            .iter()
            .find(|route| route.matcher.upgrade.is_none())
            .map(|route| &route.action)
    }

    pub fn upgrade_action(&self) -> Option<&RouteAction> {
        self.routes
            .iter()
            .find(|route| route.matcher.upgrade.is_some())
            .map(|route| &route.action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

/// A typed resource as carried in a discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum Resource {
    #[serde(rename = "type.googleapis.com/envoy.config.cluster.v3.Cluster")]
    Cluster(Cluster),
    #[serde(rename = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration")]
    RouteConfiguration(RouteConfiguration),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Cluster(_) => ResourceType::Cluster,
            Resource::RouteConfiguration(_) => ResourceType::Route,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn dns_labels() {
        assert!(is_dns_label("abc123"));
        assert!(is_dns_label("us-east-2"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("-abc"));
        assert!(!is_dns_label("abc-"));
        assert!(!is_dns_label("ABC"));
        assert!(!is_dns_label("a.b"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }

    #[test_timeout::timeout]
    fn endpoint_rejects_blank_address_and_zero_port() {
        assert_eq!(Endpoint::new("  ", 80), Err(ResourceError::EmptyAddress));
        assert_eq!(Endpoint::new("10.0.0.1", 0), Err(ResourceError::ZeroPort));
        assert!(Endpoint::new("10.0.0.1", 3000).is_ok());
    }

    #[test_timeout::timeout]
    fn virtual_host_disables_timeouts_and_enables_websocket() {
        let endpoint = Endpoint::new("10.0.0.1", 3000).unwrap();
        let cluster = Cluster::new("sbx-abc123-3000", endpoint, &ClusterDefaults::default())
            .expect("cluster");
        let host = VirtualHost::new("3000-abc123.us2.example.dev", &cluster, &RetryPolicy::default())
            .expect("virtual host");
        let action = host.default_action().expect("default route");
        assert_eq!(action.cluster, "sbx-abc123-3000");
        assert_eq!(action.timeout_ms, 0);
        assert_eq!(action.idle_timeout_ms, 0);
        assert_eq!(action.upgrade_types, vec!["websocket".to_string()]);
        assert!(host.upgrade_action().is_none());
        assert!(cluster.websocket_upgrade);
    }

    #[test_timeout::timeout]
    fn upgrade_route_is_matched_first() {
        let defaults = ClusterDefaults::default();
        let sandbox = Cluster::new(
            "sbx-abc123-3000",
            Endpoint::new("10.0.0.1", 3000).unwrap(),
            &defaults,
        )
        .unwrap();
        let edge = Cluster::new("jetty-edge", Endpoint::new("10.0.9.9", 8080).unwrap(), &defaults)
            .unwrap();
        let host = VirtualHost::new("3000-abc123.us2.example.dev", &sandbox, &RetryPolicy::default())
            .unwrap()
            .with_upgrade_route(&edge, &RetryPolicy::default());

        assert_eq!(host.routes.len(), 2);
        assert_eq!(host.routes[0].matcher.upgrade.as_deref(), Some("websocket"));
        assert_eq!(host.upgrade_action().unwrap().cluster, "jetty-edge");
        assert_eq!(host.default_action().unwrap().cluster, "sbx-abc123-3000");

        let value = serde_json::to_value(&host).unwrap();
        assert_eq!(value["routes"][0]["match"]["upgrade"], "websocket");
        assert!(value["routes"][1]["match"].get("upgrade").is_none());
    }

    #[test_timeout::timeout]
    fn resource_tags_match_type_urls() {
        let endpoint = Endpoint::new("10.0.0.1", 3000).unwrap();
        let cluster =
            Cluster::new("sbx-a-3000", endpoint, &ClusterDefaults::default()).expect("cluster");
        let value = serde_json::to_value(Resource::Cluster(cluster)).unwrap();
        assert_eq!(value["@type"], CLUSTER_TYPE_URL);

        let routes = Resource::RouteConfiguration(RouteConfiguration {
            name: "sandbox_routes".into(),
            virtual_hosts: vec![],
        });
        let value = serde_json::to_value(&routes).unwrap();
        assert_eq!(value["@type"], ROUTE_TYPE_URL);
        assert_eq!(
            ResourceType::from_type_url(ROUTE_TYPE_URL),
            Some(routes.resource_type())
        );
    }
}
