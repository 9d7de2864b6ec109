//! Shared wire definitions for the Beach Jetty control plane.
//! Proxies, the control plane, and test harnesses all speak these types, so
//! they live apart from the runtime code in `apps/beach-jetty`. The serde
//! types are the working model; `envoy` holds their protobuf encoding.

pub mod discovery;
pub mod envoy;
pub mod host;
pub mod resources;

pub use discovery::{DiscoveryRequest, DiscoveryResponse, Node, Status};
pub use host::{parse_host, public_url, route_domain, HostError, HostTarget};
pub use resources::{
    CircuitBreaker, Cluster, ClusterDefaults, Endpoint, HealthCheck, Resource, ResourceError,
    ResourceType, RetryPolicy, Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
};
