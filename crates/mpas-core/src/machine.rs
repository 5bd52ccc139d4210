use serde::{Deserialize, Serialize};

/// Catalog entry describing the resources of one VM flavor.
///
/// Looked up by name from the `machines` section of the configuration;
/// immutable once a node is created with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineType {
    /// Memory in megabytes.
    #[serde(default)]
    pub memsize: i32,
    /// Number of vCPUs.
    #[serde(default)]
    pub vcpus: i32,
    /// Disk size in megabytes.
    #[serde(default)]
    pub disksize: i32,
}
