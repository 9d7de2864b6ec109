//! Protobuf encodings of the discovery messages and routing resources, with
//! the field numbers of the Envoy v3 API so a stock proxy can consume them.
//!
//! Only the fields the control plane sets or reads are declared. A oneof
//! with a single member in use is declared as a plain field; it encodes the
//! same way on the wire.

use prost::Message;
use prost_types::{Any, Duration};
use std::net::IpAddr;

use crate::discovery;
use crate::resources::{self, Resource};

pub const SERVICE_NAME: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";
pub const STREAM_METHOD_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

const UPGRADE_HEADER: &str = "upgrade";

// envoy.config.core.v3 / google.rpc

#[derive(Clone, PartialEq, Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub cluster: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SocketAddress {
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(uint32, tag = "3")]
    pub port_value: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Address {
    #[prost(message, optional, tag = "1")]
    pub socket_address: Option<SocketAddress>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HttpHealthCheck {
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct HealthCheck {
    #[prost(message, optional, tag = "1")]
    pub timeout: Option<Duration>,
    #[prost(message, optional, tag = "2")]
    pub interval: Option<Duration>,
    #[prost(message, optional, tag = "4")]
    pub unhealthy_threshold: Option<u32>,
    #[prost(message, optional, tag = "5")]
    pub healthy_threshold: Option<u32>,
    #[prost(message, optional, tag = "8")]
    pub http_health_check: Option<HttpHealthCheck>,
}

// envoy.service.discovery.v3

#[derive(Clone, PartialEq, Message)]
pub struct DiscoveryRequest {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub response_nonce: String,
    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<Status>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<Any>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub nonce: String,
}

// envoy.config.cluster.v3 / envoy.config.endpoint.v3

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DiscoveryType {
    Static = 0,
    StrictDns = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct Thresholds {
    #[prost(message, optional, tag = "2")]
    pub max_connections: Option<u32>,
    #[prost(message, optional, tag = "3")]
    pub max_pending_requests: Option<u32>,
    #[prost(message, optional, tag = "4")]
    pub max_requests: Option<u32>,
    #[prost(message, optional, tag = "5")]
    pub max_retries: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CircuitBreakers {
    #[prost(message, repeated, tag = "1")]
    pub thresholds: Vec<Thresholds>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Endpoint {
    #[prost(message, optional, tag = "1")]
    pub address: Option<Address>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LbEndpoint {
    #[prost(message, optional, tag = "1")]
    pub endpoint: Option<Endpoint>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LocalityLbEndpoints {
    #[prost(message, repeated, tag = "2")]
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClusterLoadAssignment {
    #[prost(string, tag = "1")]
    pub cluster_name: String,
    #[prost(message, repeated, tag = "2")]
    pub endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Cluster {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "DiscoveryType", tag = "2")]
    pub r#type: i32,
    #[prost(message, optional, tag = "4")]
    pub connect_timeout: Option<Duration>,
    #[prost(message, repeated, tag = "8")]
    pub health_checks: Vec<HealthCheck>,
    #[prost(message, optional, tag = "10")]
    pub circuit_breakers: Option<CircuitBreakers>,
    #[prost(message, optional, tag = "33")]
    pub load_assignment: Option<ClusterLoadAssignment>,
}

impl Cluster {
    /// The single `address:port` the cluster sends traffic to.
    pub fn socket_address(&self) -> Option<&SocketAddress> {
        self.load_assignment
            .as_ref()?
            .endpoints
            .first()?
            .lb_endpoints
            .first()?
            .endpoint
            .as_ref()?
            .address
            .as_ref()?
            .socket_address
            .as_ref()
    }
}

// envoy.config.route.v3 / envoy.type.matcher.v3

#[derive(Clone, PartialEq, Message)]
pub struct StringMatcher {
    #[prost(string, tag = "1")]
    pub exact: String,
    #[prost(bool, tag = "6")]
    pub ignore_case: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeaderMatcher {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "13")]
    pub string_match: Option<StringMatcher>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RouteMatch {
    #[prost(string, tag = "1")]
    pub prefix: String,
    #[prost(message, repeated, tag = "6")]
    pub headers: Vec<HeaderMatcher>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RetryPolicy {
    #[prost(string, tag = "1")]
    pub retry_on: String,
    #[prost(message, optional, tag = "2")]
    pub num_retries: Option<u32>,
    #[prost(message, optional, tag = "3")]
    pub per_try_timeout: Option<Duration>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpgradeConfig {
    #[prost(string, tag = "1")]
    pub upgrade_type: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RouteAction {
    #[prost(string, tag = "1")]
    pub cluster: String,
    #[prost(message, optional, tag = "8")]
    pub timeout: Option<Duration>,
    #[prost(message, optional, tag = "9")]
    pub retry_policy: Option<RetryPolicy>,
    #[prost(message, optional, tag = "24")]
    pub idle_timeout: Option<Duration>,
    #[prost(message, repeated, tag = "25")]
    pub upgrade_configs: Vec<UpgradeConfig>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Route {
    #[prost(message, optional, tag = "1")]
    pub r#match: Option<RouteMatch>,
    #[prost(message, optional, tag = "2")]
    pub route: Option<RouteAction>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VirtualHost {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub domains: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub routes: Vec<Route>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RouteConfiguration {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub virtual_hosts: Vec<VirtualHost>,
}

/// Zero is sent explicitly: proxies read it as "disabled", while an absent
/// timeout falls back to their own default.
fn millis(ms: u64) -> Duration {
    Duration {
        seconds: (ms / 1_000) as i64,
        nanos: ((ms % 1_000) * 1_000_000) as i32,
    }
}

impl From<&resources::HealthCheck> for HealthCheck {
    fn from(check: &resources::HealthCheck) -> Self {
        Self {
            timeout: Some(millis(check.timeout_ms)),
            interval: Some(millis(check.interval_ms)),
            unhealthy_threshold: Some(check.unhealthy_threshold),
            healthy_threshold: Some(check.healthy_threshold),
            http_health_check: Some(HttpHealthCheck {
                path: check.path.clone(),
            }),
        }
    }
}

impl From<&resources::CircuitBreaker> for Thresholds {
    fn from(breaker: &resources::CircuitBreaker) -> Self {
        Self {
            max_connections: Some(breaker.max_connections),
            max_pending_requests: Some(breaker.max_pending_requests),
            max_requests: Some(breaker.max_requests),
            max_retries: Some(breaker.max_retries),
        }
    }
}

impl From<&resources::Cluster> for Cluster {
    /// IP endpoints are static; host names are resolved by the proxy.
    fn from(cluster: &resources::Cluster) -> Self {
        let discovery_type = if cluster.endpoint.address.parse::<IpAddr>().is_ok() {
            DiscoveryType::Static
        } else {
            DiscoveryType::StrictDns
        };
        let socket_address = SocketAddress {
            address: cluster.endpoint.address.clone(),
            port_value: u32::from(cluster.endpoint.port),
        };
        Self {
            name: cluster.name.clone(),
            r#type: discovery_type as i32,
            connect_timeout: Some(millis(cluster.connect_timeout_ms)),
            health_checks: vec![HealthCheck::from(&cluster.health_check)],
            circuit_breakers: Some(CircuitBreakers {
                thresholds: vec![Thresholds::from(&cluster.circuit_breaker)],
            }),
            load_assignment: Some(ClusterLoadAssignment {
                cluster_name: cluster.name.clone(),
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints: vec![LbEndpoint {
                        endpoint: Some(Endpoint {
                            address: Some(Address {
                                socket_address: Some(socket_address),
                            }),
                        }),
                    }],
                }],
            }),
        }
    }
}

impl From<&resources::RouteMatch> for RouteMatch {
    fn from(matcher: &resources::RouteMatch) -> Self {
        let headers = matcher
            .upgrade
            .iter()
            .map(|upgrade| HeaderMatcher {
                name: UPGRADE_HEADER.to_string(),
                string_match: Some(StringMatcher {
                    exact: upgrade.clone(),
                    ignore_case: true,
                }),
            })
            .collect();
        Self {
            prefix: matcher.prefix.clone(),
            headers,
        }
    }
}

impl From<&resources::RouteAction> for RouteAction {
    fn from(action: &resources::RouteAction) -> Self {
        let retry = &action.retry_policy;
        Self {
            cluster: action.cluster.clone(),
            timeout: Some(millis(action.timeout_ms)),
            retry_policy: Some(RetryPolicy {
                retry_on: retry.retry_on.clone(),
                num_retries: Some(retry.num_retries),
                per_try_timeout: (retry.per_try_timeout_ms > 0)
                    .then(|| millis(retry.per_try_timeout_ms)),
            }),
            idle_timeout: Some(millis(action.idle_timeout_ms)),
            upgrade_configs: action
                .upgrade_types
                .iter()
                .map(|upgrade_type| UpgradeConfig {
                    upgrade_type: upgrade_type.clone(),
                })
                .collect(),
        }
    }
}

impl From<&resources::RouteConfiguration> for RouteConfiguration {
    fn from(config: &resources::RouteConfiguration) -> Self {
        Self {
            name: config.name.clone(),
            virtual_hosts: config
                .virtual_hosts
                .iter()
                .map(|host| VirtualHost {
                    name: host.name.clone(),
                    domains: host.domains.clone(),
                    routes: host
                        .routes
                        .iter()
                        .map(|route| Route {
                            r#match: Some(RouteMatch::from(&route.matcher)),
                            route: Some(RouteAction::from(&route.action)),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Packs a resource into the `Any` carried by a discovery response.
pub fn encode_resource(resource: &Resource) -> Any {
    let value = match resource {
        Resource::Cluster(cluster) => Cluster::from(cluster).encode_to_vec(),
        Resource::RouteConfiguration(config) => RouteConfiguration::from(config).encode_to_vec(),
    };
    Any {
        type_url: resource.resource_type().type_url().to_string(),
        value,
    }
}

impl From<&discovery::DiscoveryResponse> for DiscoveryResponse {
    fn from(response: &discovery::DiscoveryResponse) -> Self {
        Self {
            version_info: response.version_info.clone(),
            resources: response.resources.iter().map(encode_resource).collect(),
            type_url: response.type_url.clone(),
            nonce: response.nonce.clone(),
        }
    }
}

impl From<DiscoveryRequest> for discovery::DiscoveryRequest {
    fn from(request: DiscoveryRequest) -> Self {
        Self {
            version_info: request.version_info,
            node: request.node.map(|node| discovery::Node {
                id: node.id,
                cluster: node.cluster,
            }),
            resource_names: request.resource_names,
            type_url: request.type_url,
            response_nonce: request.response_nonce,
            error_detail: request.error_detail.map(|status| discovery::Status {
                code: status.code,
                message: status.message,
            }),
        }
    }
}

impl From<&discovery::DiscoveryRequest> for DiscoveryRequest {
    fn from(request: &discovery::DiscoveryRequest) -> Self {
        Self {
            version_info: request.version_info.clone(),
            node: request.node.as_ref().map(|node| Node {
                id: node.id.clone(),
                cluster: node.cluster.clone(),
            }),
            resource_names: request.resource_names.clone(),
            type_url: request.type_url.clone(),
            response_nonce: request.response_nonce.clone(),
            error_detail: request.error_detail.as_ref().map(|status| Status {
                code: status.code,
                message: status.message.clone(),
            }),
        }
    }
}
