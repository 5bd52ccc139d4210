use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::machine::MachineType;

/// kubeadm join parameters shared by every node bring-up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeAdmConfig {
    /// Join address, "host:port".
    #[serde(default)]
    pub address: String,
    /// Bootstrap token.
    #[serde(default)]
    pub token: String,
    /// Discovery token CA cert hash.
    #[serde(default)]
    pub cacert: String,
    /// Extra arguments appended verbatim to `kubeadm join`.
    #[serde(default, rename = "extraArguments")]
    pub extra_arguments: Vec<String>,
}

/// Feature switches the controller queries before using optional RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Optionals {
    #[serde(default = "default_true", rename = "Pricing")]
    pub pricing: bool,
    #[serde(default = "default_true", rename = "GetAvailableMachineTypes")]
    pub get_available_machine_types: bool,
    #[serde(default = "default_true", rename = "NewNodeGroup")]
    pub new_node_group: bool,
    #[serde(default = "default_true", rename = "TemplateNodeInfo")]
    pub template_node_info: bool,
    #[serde(default = "default_true", rename = "Create")]
    pub create: bool,
    #[serde(default = "default_true", rename = "Delete")]
    pub delete: bool,
}

impl Default for Optionals {
    fn default() -> Self {
        Self {
            pricing: true,
            get_available_machine_types: true,
            new_node_group: true,
            template_node_info: true,
            create: true,
            delete: true,
        }
    }
}

/// Server configuration document (JSON file).
///
/// Field names are a wire contract shared with the deployment tooling; do not
/// rename them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_address")]
    pub address: String,
    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional "host:port" (tcp) or socket path (unix) overriding
    /// address/port.
    #[serde(default)]
    pub listen: Option<String>,
    /// Listener family: "tcp" or "unix".
    #[serde(default = "default_network")]
    pub network: String,
    /// Shared provider token; every request must present it. Also the scheme
    /// of every provider-ID this server mints.
    pub secret: String,
    /// Minimum node count per group.
    #[serde(default, rename = "minNode")]
    pub min_node: usize,
    /// Maximum node count per group.
    #[serde(default = "default_max_node", rename = "maxNode")]
    pub max_node: usize,
    #[serde(default, rename = "nodePrice")]
    pub node_price: f64,
    #[serde(default, rename = "podPrice")]
    pub pod_price: f64,
    /// VM image name or URL; empty uses the tool default.
    #[serde(default)]
    pub image: String,
    /// Available machine flavors.
    #[serde(default = "default_machines")]
    pub machines: HashMap<String, MachineType>,
    /// Arbitrary nested document serialized to YAML and handed to the VM on
    /// launch.
    #[serde(default, rename = "cloud-init")]
    pub cloud_init: serde_json::Value,
    /// Host path → guest path mounts applied after launch.
    #[serde(default, rename = "mount-points")]
    pub mount_points: HashMap<String, String>,
    /// Whether launched VMs are configured and joined to the cluster.
    #[serde(default = "default_true", rename = "auto-provision")]
    pub auto_provision: bool,
    #[serde(default)]
    pub optionals: Optionals,
    #[serde(default, rename = "kubeAdm")]
    pub kube_adm: KubeAdmConfig,
    /// Path to the admin kubeconfig used for node administration.
    #[serde(default, rename = "kubeCtlConfig")]
    pub kube_ctl_config: String,
    /// Labels applied to every joined node.
    #[serde(default, rename = "nodeLabels")]
    pub node_labels: HashMap<String, String>,
    /// System labels applied alongside node labels.
    #[serde(default, rename = "systemLabels")]
    pub system_labels: HashMap<String, String>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5200
}
fn default_network() -> String {
    "tcp".to_string()
}
fn default_max_node() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_machines() -> HashMap<String, MachineType> {
    HashMap::from([("standard".to_string(), MachineType::default())])
}

impl ServerConfig {
    /// Load the server config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse the server config from a JSON string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).with_context(|| "Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            anyhow::bail!("Config must set a non-empty secret");
        }
        if self.max_node == 0 || self.min_node > self.max_node {
            anyhow::bail!(
                "Invalid node bounds: minNode {} maxNode {}",
                self.min_node,
                self.max_node
            );
        }
        if self.machines.is_empty() {
            anyhow::bail!("Config must declare at least one machine type");
        }
        if self.network != "tcp" && self.network != "unix" {
            anyhow::bail!("Unsupported network {:?}, expected tcp or unix", self.network);
        }
        Ok(())
    }

    /// Effective bind endpoint: the `listen` override or "address:port".
    pub fn listen_endpoint(&self) -> String {
        match &self.listen {
            Some(l) if !l.is_empty() => l.clone(),
            _ => format!("{}:{}", self.address, self.port),
        }
    }

    /// Whether a non-empty cloud-init document is configured.
    pub fn has_cloud_init(&self) -> bool {
        match &self.cloud_init {
            serde_json::Value::Null => false,
            serde_json::Value::Object(m) => !m.is_empty(),
            _ => true,
        }
    }
}
