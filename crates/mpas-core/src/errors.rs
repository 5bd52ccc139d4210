use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error classification carried in reply envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Error in the underlying infrastructure (VM tool, launch pipeline).
    #[serde(rename = "cloudProviderError")]
    CloudProvider,
    /// Error talking to the Kubernetes API server.
    #[serde(rename = "apiCallError")]
    ApiCall,
    /// Error inside the engine itself (parse/decode failures).
    #[serde(rename = "internalError")]
    Internal,
    /// Error that skips a single loop and requires no action.
    #[serde(rename = "transientError")]
    Transient,
    /// The requested operation is disabled on this server.
    #[serde(rename = "notImplemented")]
    NotImplemented,
}

/// Error payload of a reply envelope: a code plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub reason: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self {
            code: err.code(),
            reason: err.to_string(),
        }
    }
}

/// Every failure the scaling engine can report.
///
/// Reasons embed the offending VM or group name so reply envelopes stay
/// meaningful without a stack trace.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Secret doesn't match with target server")]
    ProviderMismatch,

    #[error("Node group {0} not found")]
    GroupNotFound(String),

    #[error("Node group {0} not found for node {1}")]
    GroupForNodeNotFound(String, String),

    #[error("The node {0} not found in node group {1}")]
    NodeNotInGroup(String, String),

    #[error("Machine type {0} not found")]
    MachineTypeNotFound(String),

    #[error("Can't create node group: {0}, already exists")]
    GroupAlreadyExists(String),

    #[error("Can't delete node: {0}, because not owned by node group: {1}")]
    UnableToDeleteNode(String, String),

    #[error("Min size reached for group: {0}, nodes will not be deleted")]
    MinSizeReached(String),

    #[error("Size increase must be positive")]
    SizeMustBePositive,

    #[error("Size increase too large, desired: {desired} max: {max}")]
    SizeTooLarge { desired: usize, max: usize },

    #[error("Size decrease must be negative")]
    SizeMustBeNegative,

    #[error(
        "Attempt to delete existing nodes, targetSize: {target} delta: {delta} existingNodes: {existing}"
    )]
    AttemptDeleteNodes {
        target: usize,
        delta: i64,
        existing: usize,
    },

    #[error("Node providerID {0} not conform, reason: {1}")]
    MalformedID(String, String),

    #[error("Can't unmarshall node definition, reason: {0}")]
    NodeParse(String),

    #[error("Unable to launch the VM owned by node: {name}, reason: {reason}")]
    VMLaunchFailed { name: String, reason: String },

    #[error("Can't get the VM info for VM: {name}, reason: {reason}")]
    VMInfoFailed { name: String, reason: String },

    #[error("Unable to find VM: {0}")]
    VMNotFound(String),

    #[error("Could not start VM: {name}, reason: {reason}")]
    VMStartFailed { name: String, reason: String },

    #[error("Could not stop VM: {name}, reason: {reason}")]
    VMStopFailed { name: String, reason: String },

    #[error("Could not delete VM: {name}, reason: {reason}")]
    VMDeleteFailed { name: String, reason: String },

    #[error("Unable to configure kubelet for VM: {name}, reason: {reason}")]
    KubeletNotConfigured { name: String, reason: String },

    #[error("Unable to join the cluster for VM: {name}, reason: {reason}")]
    JoinFailed { name: String, reason: String },

    #[error("Could not join the cluster, the VM: {0} is not running")]
    JoinNotRunning(String),

    #[error("The kubernetes node {0} is not ready")]
    NodeNotReady(String),

    #[error("Unable to launch VM, {0} is already created")]
    AlreadyCreated(String),

    #[error("The VM {0} was not provisioned by this server")]
    ForeignVM(String),

    #[error("Unexpected state for VM {name}: {state}")]
    UnexpectedState { name: String, state: String },

    #[error("Kube API call failed, reason: {0}")]
    KubeCall(String),

    #[error("Can't load server state from {path}, reason: {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Operation {0} is not enabled on this server")]
    NotImplemented(&'static str),
}

impl EngineError {
    /// Map a typed error onto its wire-level classification.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::KubeCall(_) | Self::NodeNotReady(_) => ErrorCode::ApiCall,
            Self::MalformedID(..) | Self::NodeParse(_) | Self::LoadFailed { .. } => {
                ErrorCode::Internal
            }
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
            _ => ErrorCode::CloudProvider,
        }
    }
}
