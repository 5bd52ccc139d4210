//! Minimal model of the Kubernetes node document.
//!
//! Only the fields the engine reads cross this boundary: name, annotations,
//! labels, provider-ID, addresses and the Ready condition. Everything else in
//! the cluster document is ignored on deserialization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Annotation carrying the creation index of an engine-managed node.
pub const ANNOTATION_NODE_INDEX: &str = "node-index";
/// Annotation marking whether this engine created the underlying VM.
pub const ANNOTATION_AUTO_PROVISIONED: &str = "auto-provisioned";
/// Annotation the controller reads to exempt a node from scale-down.
pub const ANNOTATION_SCALE_DOWN_DISABLED: &str = "scale-down-disabled";
/// Label tying a cluster node back to its node group.
pub const LABEL_GROUP_NAME: &str = "group-name";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeNode {
    #[serde(default)]
    pub metadata: KubeMetadata,
    #[serde(default)]
    pub spec: KubeNodeSpec,
    #[serde(default)]
    pub status: KubeNodeStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeNodeSpec {
    #[serde(default, rename = "providerID")]
    pub provider_id: String,
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeNodeStatus {
    #[serde(default)]
    pub addresses: Vec<KubeNodeAddress>,
    #[serde(default)]
    pub conditions: Vec<KubeNodeCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeNodeAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeNodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

/// The `kubectl get nodes --output json` list document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubeNodeList {
    #[serde(default)]
    pub items: Vec<KubeNode>,
}

impl KubeNode {
    /// Internal IP from the status addresses, when reported.
    pub fn internal_ip(&self) -> Option<&str> {
        self.status
            .addresses
            .iter()
            .find(|a| a.kind == "InternalIP")
            .map(|a| a.address.as_str())
    }

    /// Whether the Ready condition is True.
    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status.eq_ignore_ascii_case("true"))
    }
}

/// Deserialize a node document passed through an RPC request.
pub fn node_from_json(s: &str) -> Result<KubeNode, EngineError> {
    serde_json::from_str(s).map_err(|e| EngineError::NodeParse(e.to_string()))
}
