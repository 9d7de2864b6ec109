use serde::{Deserialize, Serialize};

use crate::resources::{Resource, ResourceType};

/// Identity a proxy presents on its discovery stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub cluster: String,
}

/// Rejection detail attached to a NACK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

/// Proxy → control plane. The first request for a type subscribes; later
/// requests echo `response_nonce` to ACK (no `error_detail`) or NACK a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub version_info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Node>,
    #[serde(default)]
    pub resource_names: Vec<String>,
    pub type_url: String,
    #[serde(default)]
    pub response_nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<Status>,
}

impl DiscoveryRequest {
    pub fn subscribe(node: Option<Node>, resource_type: ResourceType) -> Self {
        Self {
            version_info: String::new(),
            node,
            resource_names: Vec::new(),
            type_url: resource_type.type_url().to_string(),
            response_nonce: String::new(),
            error_detail: None,
        }
    }

    pub fn ack(response: &DiscoveryResponse) -> Self {
        Self {
            version_info: response.version_info.clone(),
            node: None,
            resource_names: Vec::new(),
            type_url: response.type_url.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: None,
        }
    }

    /// Rejects `response`, reporting `accepted_version` as the version the
    /// proxy is still running.
    pub fn nack(
        response: &DiscoveryResponse,
        accepted_version: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            version_info: accepted_version.into(),
            node: None,
            resource_names: Vec::new(),
            type_url: response.type_url.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: Some(Status {
                code: 3,
                message: message.into(),
            }),
        }
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        ResourceType::from_type_url(&self.type_url)
    }

    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// Control plane → proxy. Always carries the full state of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<Resource>,
    pub type_url: String,
    pub nonce: String,
}

impl DiscoveryResponse {
    pub fn resource_type(&self) -> Option<ResourceType> {
        ResourceType::from_type_url(&self.type_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn envoy_style_request_parses_with_missing_fields() {
        let raw = r#"{
            "node": {"id": "edge-1"},
            "type_url": "type.googleapis.com/envoy.config.cluster.v3.Cluster"
        }"#;
        let request: DiscoveryRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(request.resource_type(), Some(ResourceType::Cluster));
        assert_eq!(request.node.as_ref().map(|n| n.id.as_str()), Some("edge-1"));
        assert!(request.response_nonce.is_empty());
        assert!(!request.is_nack());
    }

    #[test_timeout::timeout]
    fn ack_and_nack_echo_the_nonce() {
        let response = DiscoveryResponse {
            version_info: "7".into(),
            resources: vec![],
            type_url: ResourceType::Route.type_url().into(),
            nonce: "n-1".into(),
        };
        let ack = DiscoveryRequest::ack(&response);
        assert_eq!(ack.response_nonce, "n-1");
        assert_eq!(ack.version_info, "7");
        assert!(!ack.is_nack());

        let nack = DiscoveryRequest::nack(&response, "6", "bad route");
        assert_eq!(nack.response_nonce, "n-1");
        assert_eq!(nack.version_info, "6");
        assert!(nack.is_nack());
    }
}
