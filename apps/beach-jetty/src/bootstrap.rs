//! Static configuration a proxy boots with. It names the proxy and points
//! it at the control plane; clusters and routes arrive over discovery.

use jetty_proto::discovery::Node;
use jetty_proto::resources::ResourceType;
use serde::{Deserialize, Serialize};

pub const CONTROL_PLANE_CLUSTER: &str = "jetty_control_plane";

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub node_id: String,
    pub node_cluster: String,
    pub control_plane_host: String,
    pub control_plane_port: u16,
    pub route_config_name: String,
    pub admin_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddress {
    pub address: String,
    pub port_value: u16,
}

/// Marks a cluster as speaking HTTP/2, which gRPC requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http2ProtocolOptions {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCluster {
    pub name: String,
    pub connect_timeout: String,
    pub endpoints: Vec<SocketAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_protocol_options: Option<Http2ProtocolOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticResources {
    pub clusters: Vec<StaticCluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvoyGrpc {
    pub cluster_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcService {
    pub envoy_grpc: EnvoyGrpc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdsConfig {
    pub api_type: String,
    pub transport_api_version: String,
    pub grpc_services: Vec<GrpcService>,
}

/// Where one resource type is fetched from. Always the aggregated stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSource {
    pub type_url: String,
    pub ads: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdsConfig {
    pub route_config_name: String,
    pub config_source: ConfigSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicResources {
    pub ads_config: AdsConfig,
    pub cds_config: ConfigSource,
    pub rds_config: RdsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admin {
    pub address: SocketAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub node: Node,
    pub static_resources: StaticResources,
    pub dynamic_resources: DynamicResources,
    pub admin: Admin,
}

impl Bootstrap {
    pub fn new(options: &BootstrapOptions) -> Self {
        let ads = |ty: ResourceType| ConfigSource {
            type_url: ty.type_url().to_string(),
            ads: true,
        };
        Self {
            node: Node {
                id: options.node_id.clone(),
                cluster: options.node_cluster.clone(),
            },
            static_resources: StaticResources {
                clusters: vec![StaticCluster {
                    name: CONTROL_PLANE_CLUSTER.to_string(),
                    connect_timeout: "5s".to_string(),
                    endpoints: vec![SocketAddress {
                        address: options.control_plane_host.clone(),
                        port_value: options.control_plane_port,
                    }],
                    http2_protocol_options: Some(Http2ProtocolOptions::default()),
                }],
            },
            dynamic_resources: DynamicResources {
                ads_config: AdsConfig {
                    api_type: "GRPC".to_string(),
                    transport_api_version: "V3".to_string(),
                    grpc_services: vec![GrpcService {
                        envoy_grpc: EnvoyGrpc {
                            cluster_name: CONTROL_PLANE_CLUSTER.to_string(),
                        },
                    }],
                },
                cds_config: ads(ResourceType::Cluster),
                rds_config: RdsConfig {
                    route_config_name: options.route_config_name.clone(),
                    config_source: ads(ResourceType::Route),
                },
            },
            admin: Admin {
                address: SocketAddress {
                    address: "127.0.0.1".to_string(),
                    port_value: options.admin_port,
                },
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
