use serde::{Deserialize, Serialize};

/// VM lifecycle state as reported by the VM tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    NotCreated,
    Running,
    Stopped,
    Deleted,
    Undefined,
}

impl NodeState {
    /// Normalize the VM tool's textual state, case-insensitively.
    /// Anything unrecognized maps to `Undefined`; the next refresh retries.
    pub fn from_tool_state(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "STOPPED" => Self::Stopped,
            "DELETED" => Self::Deleted,
            _ => Self::Undefined,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCreated => write!(f, "not_created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Deleted => write!(f, "deleted"),
            Self::Undefined => write!(f, "undefined"),
        }
    }
}

/// Node-group lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    NotCreated,
    Created,
    Deleting,
    Deleted,
}

impl GroupStatus {
    /// Stable numeric form for atomic storage.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::NotCreated => 0,
            Self::Created => 1,
            Self::Deleting => 2,
            Self::Deleted => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Created,
            2 => Self::Deleting,
            3 => Self::Deleted,
            _ => Self::NotCreated,
        }
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCreated => write!(f, "not_created"),
            Self::Created => write!(f, "created"),
            Self::Deleting => write!(f, "deleting"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}
