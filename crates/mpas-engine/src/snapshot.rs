//! Persistent snapshot of the server tree.
//!
//! One JSON file holds the whole registry so a restarted process keeps
//! ownership of the VMs it created. Pending records are in-flight transient
//! state and are never serialized; discovery reconciles them after a crash.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mpas_core::config::KubeAdmConfig;
use mpas_core::errors::EngineError;
use mpas_core::machine::MachineType;
use mpas_core::protocol::ResourceLimiter;
use mpas_core::state::GroupStatus;

use crate::group::NodeGroup;
use crate::node::Node;

/// One node group as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDocument {
    pub identifier: String,
    #[serde(default)]
    pub machine: MachineType,
    pub status: GroupStatus,
    #[serde(rename = "minSize")]
    pub min_size: usize,
    #[serde(rename = "maxSize")]
    pub max_size: usize,
    #[serde(default, rename = "nodeLabels")]
    pub node_labels: HashMap<String, String>,
    #[serde(default, rename = "systemLabels")]
    pub system_labels: HashMap<String, String>,
    /// High-water creation index; survives restarts so names never recycle.
    #[serde(rename = "node-index")]
    pub last_created_index: usize,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl GroupDocument {
    pub fn from_group(group: &NodeGroup) -> Self {
        Self {
            identifier: group.identifier.clone(),
            machine: group.machine,
            status: group.status(),
            min_size: group.min_size,
            max_size: group.max_size,
            node_labels: group.node_labels.clone(),
            system_labels: group.system_labels.clone(),
            last_created_index: group.last_created_index(),
            nodes: group.members_for_snapshot(),
        }
    }

    pub fn into_group(self, server_id: &str) -> NodeGroup {
        NodeGroup::restore(
            &self.identifier,
            server_id,
            self.machine,
            self.min_size,
            self.max_size,
            self.node_labels,
            self.system_labels,
            self.status,
            self.last_created_index,
            self.nodes,
        )
    }
}

/// The full server document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDocument {
    #[serde(rename = "service")]
    pub server_id: String,
    #[serde(default, rename = "kubeAdm")]
    pub kube_adm: KubeAdmConfig,
    #[serde(default, rename = "resourceLimiter")]
    pub resource_limiter: ResourceLimiter,
    #[serde(default)]
    pub groups: Vec<GroupDocument>,
    #[serde(default, rename = "savedAt")]
    pub saved_at: String,
}

/// Persist the document. Written via a sibling temp file and rename so a
/// crash mid-write never leaves a truncated snapshot.
pub fn save(doc: &ServerDocument, path: &Path) -> Result<()> {
    let body = serde_json::to_string_pretty(doc).with_context(|| "Failed to serialize snapshot")?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)
        .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;

    Ok(())
}

/// Load a snapshot. Any read or parse failure is fatal; silently starting a
/// fresh engine atop existing VMs would orphan them.
pub fn load(path: &Path) -> Result<ServerDocument, EngineError> {
    let load_failed = |reason: String| EngineError::LoadFailed {
        path: path.display().to_string(),
        reason,
    };

    let content = std::fs::read_to_string(path).map_err(|e| load_failed(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| load_failed(e.to_string()))
}
