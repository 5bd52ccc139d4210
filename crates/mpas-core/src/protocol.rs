use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::KubeAdmConfig;
use crate::errors::ApiError;
use crate::state::NodeState;

/// Maximum frame size for the RPC surface (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ============================================================================
// Request/Response types
// ============================================================================

/// Resource totals advertised to the controller, mutable via `Connect`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimiter {
    #[serde(default, rename = "minLimits")]
    pub min_limits: HashMap<String, i64>,
    #[serde(default, rename = "maxLimits")]
    pub max_limits: HashMap<String, i64>,
}

/// One member of a `Nodes` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// The node's provider-ID.
    pub id: String,
    pub state: NodeState,
}

/// Request from the autoscaling controller.
///
/// Every variant carries the shared provider token; the server rejects any
/// request whose token does not match before looking at the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // ---- CloudProvider service ----
    Connect {
        provider_id: String,
        #[serde(default)]
        resource_limiter: Option<ResourceLimiter>,
        #[serde(default)]
        kube_adm: Option<KubeAdmConfig>,
    },
    Name {
        provider_id: String,
    },
    NodeGroups {
        provider_id: String,
    },
    NodeGroupForNode {
        provider_id: String,
        /// Serialized Kubernetes node document.
        node: String,
    },
    GetAvailableMachineTypes {
        provider_id: String,
    },
    NewNodeGroup {
        provider_id: String,
        machine_type: String,
    },
    GetResourceLimiter {
        provider_id: String,
    },
    Refresh {
        provider_id: String,
    },
    Cleanup {
        provider_id: String,
    },

    // ---- NodeGroup service ----
    MaxSize {
        provider_id: String,
        node_group_id: String,
    },
    MinSize {
        provider_id: String,
        node_group_id: String,
    },
    TargetSize {
        provider_id: String,
        node_group_id: String,
    },
    IncreaseSize {
        provider_id: String,
        node_group_id: String,
        delta: i64,
    },
    DecreaseTargetSize {
        provider_id: String,
        node_group_id: String,
        delta: i64,
    },
    DeleteNodes {
        provider_id: String,
        node_group_id: String,
        /// Serialized Kubernetes node documents.
        nodes: Vec<String>,
    },
    Id {
        provider_id: String,
        node_group_id: String,
    },
    Debug {
        provider_id: String,
        node_group_id: String,
    },
    Nodes {
        provider_id: String,
        node_group_id: String,
    },
    TemplateNodeInfo {
        provider_id: String,
        node_group_id: String,
    },
    Exist {
        provider_id: String,
        node_group_id: String,
    },
    Create {
        provider_id: String,
        node_group_id: String,
    },
    Delete {
        provider_id: String,
        node_group_id: String,
    },
    Autoprovisioned {
        provider_id: String,
        node_group_id: String,
    },
    Belongs {
        provider_id: String,
        node_group_id: String,
        node: String,
    },

    // ---- PricingModel service ----
    Pricing {
        provider_id: String,
    },
    NodePrice {
        provider_id: String,
    },
    PodPrice {
        provider_id: String,
    },
}

impl Request {
    /// The provider token this request presents.
    pub fn provider_id(&self) -> &str {
        match self {
            Self::Connect { provider_id, .. }
            | Self::Name { provider_id }
            | Self::NodeGroups { provider_id }
            | Self::NodeGroupForNode { provider_id, .. }
            | Self::GetAvailableMachineTypes { provider_id }
            | Self::NewNodeGroup { provider_id, .. }
            | Self::GetResourceLimiter { provider_id }
            | Self::Refresh { provider_id }
            | Self::Cleanup { provider_id }
            | Self::MaxSize { provider_id, .. }
            | Self::MinSize { provider_id, .. }
            | Self::TargetSize { provider_id, .. }
            | Self::IncreaseSize { provider_id, .. }
            | Self::DecreaseTargetSize { provider_id, .. }
            | Self::DeleteNodes { provider_id, .. }
            | Self::Id { provider_id, .. }
            | Self::Debug { provider_id, .. }
            | Self::Nodes { provider_id, .. }
            | Self::TemplateNodeInfo { provider_id, .. }
            | Self::Exist { provider_id, .. }
            | Self::Create { provider_id, .. }
            | Self::Delete { provider_id, .. }
            | Self::Autoprovisioned { provider_id, .. }
            | Self::Belongs { provider_id, .. }
            | Self::Pricing { provider_id }
            | Self::NodePrice { provider_id }
            | Self::PodPrice { provider_id } => provider_id,
        }
    }
}

/// Reply to the controller: either the operation's value or a typed error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Connected {
        connected: bool,
    },
    Name {
        name: String,
    },
    NodeGroups {
        node_groups: Vec<String>,
    },
    NodeGroup {
        node_group_id: String,
    },
    MachineTypes {
        machine_types: Vec<String>,
    },
    ResourceLimiter(ResourceLimiter),
    Size {
        size: i64,
    },
    Instances {
        instances: Vec<Instance>,
    },
    /// Serialized template node document for scale-up simulation.
    NodeInfo {
        node: String,
    },
    Exists {
        exists: bool,
    },
    Autoprovisioned {
        autoprovisioned: bool,
    },
    Belongs {
        belongs: bool,
    },
    Id {
        id: String,
    },
    Debug {
        info: String,
    },
    PricingModel {
        model_id: String,
    },
    Price {
        price: f64,
    },
    Ok,
    Error(ApiError),
}

// ============================================================================
// Frame protocol (length-prefixed JSON over TCP or Unix socket)
// ============================================================================

/// Read a length-prefixed JSON frame from a tokio AsyncRead.
pub async fn read_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .with_context(|| "Failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("Frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read frame body")?;

    Ok(buf)
}

/// Write a length-prefixed JSON frame to a tokio AsyncWrite.
pub async fn write_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .with_context(|| "Failed to write frame length")?;
    writer
        .write_all(data)
        .await
        .with_context(|| "Failed to write frame body")?;
    writer
        .flush()
        .await
        .with_context(|| "Failed to flush frame")?;
    Ok(())
}

/// Serialize and send a request.
pub async fn send_request<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &Request,
) -> Result<()> {
    let data = serde_json::to_vec(req).with_context(|| "Failed to serialize request")?;
    write_frame(writer, &data).await
}

/// Read and deserialize a request.
pub async fn recv_request<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Request> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "Failed to deserialize request")
}

/// Serialize and send a response.
pub async fn send_response<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    resp: &Response,
) -> Result<()> {
    let data = serde_json::to_vec(resp).with_context(|| "Failed to serialize response")?;
    write_frame(writer, &data).await
}

/// Read and deserialize a response.
pub async fn recv_response<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Response> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "Failed to deserialize response")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn test_request_provider_id_accessor() {
        let req = Request::IncreaseSize {
            provider_id: "multipass".to_string(),
            node_group_id: "ng-1".to_string(),
            delta: 2,
        };
        assert_eq!(req.provider_id(), "multipass");

        let req = Request::Name {
            provider_id: "other".to_string(),
        };
        assert_eq!(req.provider_id(), "other");
    }

    #[test]
    fn test_request_roundtrip() {
        let req = Request::DeleteNodes {
            provider_id: "multipass".to_string(),
            node_group_id: "ng-1".to_string(),
            nodes: vec!["{}".to_string()],
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        match parsed {
            Request::DeleteNodes {
                node_group_id,
                nodes,
                ..
            } => {
                assert_eq!(node_group_id, "ng-1");
                assert_eq!(nodes.len(), 1);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_connect_optional_fields_default() {
        let json = r#"{"Connect": {"provider_id": "multipass"}}"#;
        let parsed: Request = serde_json::from_str(json).unwrap();
        match parsed {
            Request::Connect {
                resource_limiter,
                kube_adm,
                ..
            } => {
                assert!(resource_limiter.is_none());
                assert!(kube_adm.is_none());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = Response::Error(ApiError::new(ErrorCode::CloudProvider, "no such group"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("cloudProviderError"));
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Error(e) => assert_eq!(e.reason, "no such group"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_instances_response_roundtrip() {
        let resp = Response::Instances {
            instances: vec![Instance {
                id: "multipass://ng-1/object?type=node&name=ng-1-vm-01".to_string(),
                state: NodeState::Running,
            }],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Instances { instances } => {
                assert_eq!(instances.len(), 1);
                assert_eq!(instances[0].state, NodeState::Running);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_resource_limiter_wire_names() {
        let limiter = ResourceLimiter {
            min_limits: HashMap::from([("cpu".to_string(), 1)]),
            max_limits: HashMap::from([("cpu".to_string(), 5)]),
        };
        let json = serde_json::to_string(&limiter).unwrap();
        assert!(json.contains("minLimits"));
        assert!(json.contains("maxLimits"));
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let data = b"hello provider";
        let mut buf = Vec::new();
        write_frame(&mut buf, data).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(2 * 1024 * 1024u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_request_send_recv_roundtrip() {
        let req = Request::TargetSize {
            provider_id: "multipass".to_string(),
            node_group_id: "ng-1".to_string(),
        };
        let mut buf = Vec::new();
        send_request(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = recv_request(&mut cursor).await.unwrap();
        assert!(matches!(parsed, Request::TargetSize { .. }));
    }

    #[tokio::test]
    async fn test_response_send_recv_roundtrip() {
        let resp = Response::Size { size: 3 };
        let mut buf = Vec::new();
        send_response(&mut buf, &resp).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        match recv_response(&mut cursor).await.unwrap() {
            Response::Size { size } => assert_eq!(size, 3),
            _ => panic!("Wrong variant"),
        }
    }
}
