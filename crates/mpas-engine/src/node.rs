//! A single VM's lifecycle record and state-machine operations.
//!
//! The bring-up pipeline is strict: any failure aborts and the enclosing
//! node group rolls the batch back. Teardown is best-effort on the cluster
//! side and strict only on the VM tool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use mpas_core::errors::EngineError;
use mpas_core::kube::{ANNOTATION_AUTO_PROVISIONED, ANNOTATION_NODE_INDEX, LABEL_GROUP_NAME};
use mpas_core::state::NodeState;
use mpas_driver::{kubectl, multipass};

/// Everything a bring-up needs beyond the node record itself.
#[derive(Debug, Clone)]
pub struct NodeCreationExtra {
    pub group_id: String,
    pub kube_host: String,
    pub kube_token: String,
    pub kube_ca_cert: String,
    pub kube_extra_args: Vec<String>,
    /// Path to the admin kubeconfig.
    pub kubeconfig: String,
    pub image: String,
    /// Cloud-init document, serialized to YAML at launch time.
    pub cloud_init: serde_json::Value,
    pub mount_points: HashMap<String, String>,
    pub node_labels: HashMap<String, String>,
    pub system_labels: HashMap<String, String>,
    /// Whether the launched VM is configured and joined to the cluster.
    pub vm_provision: bool,
    pub cache_dir: PathBuf,
}

/// One VM and its lifecycle record.
///
/// Serialized field names are the snapshot contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    pub name: String,
    pub index: usize,
    pub memory: i32,
    pub cpu: i32,
    pub disk: i32,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub state: NodeState,
    /// True iff this engine created the VM. Foreign nodes are read-only.
    #[serde(rename = "auto")]
    pub auto_provisioned: bool,
}

impl Node {
    /// The bring-up pipeline: create the VM, wait for it to run, configure
    /// kubelet, join the cluster, wait Ready, label and annotate.
    pub fn launch(&mut self, extras: &NodeCreationExtra) -> Result<(), EngineError> {
        if !self.auto_provisioned {
            return Err(EngineError::ForeignVM(self.name.clone()));
        }
        if self.state != NodeState::NotCreated {
            return Err(EngineError::AlreadyCreated(self.name.clone()));
        }

        info!(node = %self.name, group = %extras.group_id, "Launching VM");

        let cloud_init_file = self.write_cloud_init(extras)?;
        let result = self.bring_up(extras, cloud_init_file.as_deref());

        match &result {
            Ok(()) => info!(node = %self.name, group = %extras.group_id, "Launched VM"),
            Err(e) => {
                if let Some(path) = &cloud_init_file {
                    let _ = std::fs::remove_file(path);
                }
                error!(node = %self.name, group = %extras.group_id, error = %e, "Unable to launch VM");
            }
        }

        result
    }

    fn bring_up(
        &mut self,
        extras: &NodeCreationExtra,
        cloud_init: Option<&Path>,
    ) -> Result<(), EngineError> {
        multipass::launch(
            &self.name,
            self.memory,
            self.cpu,
            self.disk,
            cloud_init,
            &extras.image,
        )?;

        for (host_path, guest_path) in &extras.mount_points {
            if let Err(e) = multipass::mount(host_path, &self.name, guest_path) {
                warn!(
                    node = %self.name,
                    host = %host_path,
                    guest = %guest_path,
                    error = %e,
                    "Unable to mount host path"
                );
            }
        }

        if self.probe()? != NodeState::Running {
            return Err(EngineError::JoinNotRunning(self.name.clone()));
        }

        if extras.vm_provision {
            self.prepare_kubelet(extras)?;
        }

        self.kubeadm_join(extras)?;
        kubectl::wait_ready(&self.name, &extras.kubeconfig)?;
        self.apply_labels(extras)?;

        self.state = NodeState::Running;
        Ok(())
    }

    /// Serialize the cloud-init document under the cache directory.
    /// The file is removed on error only; a consumed copy stays for
    /// inspection.
    fn write_cloud_init(&self, extras: &NodeCreationExtra) -> Result<Option<PathBuf>, EngineError> {
        let present = match &extras.cloud_init {
            serde_json::Value::Null => false,
            serde_json::Value::Object(m) => !m.is_empty(),
            _ => true,
        };
        if !present {
            return Ok(None);
        }

        let path = extras.cache_dir.join(format!("cloud-init-{}.yaml", self.name));
        let write = (|| -> anyhow::Result<()> {
            let body = serde_yaml::to_string(&extras.cloud_init)?;
            std::fs::write(&path, body)?;
            Ok(())
        })();

        match write {
            Ok(()) => Ok(Some(path)),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(EngineError::VMLaunchFailed {
                    name: self.name.clone(),
                    reason: format!("can't write cloud-init: {e}"),
                })
            }
        }
    }

    /// Pin the kubelet's --provider-id to this node before it joins, so the
    /// cluster object decodes back to this group after any restart.
    fn prepare_kubelet(&self, extras: &NodeCreationExtra) -> Result<(), EngineError> {
        let script = format!(
            "#!/bin/bash\n\
             . /etc/default/kubelet\n\
             echo \"KUBELET_EXTRA_ARGS=\\\"$KUBELET_EXTRA_ARGS --provider-id={}\\\"\" > /etc/default/kubelet\n\
             systemctl restart kubelet\n",
            self.provider_id
        );

        multipass::exec_script(&self.name, &script, &extras.cache_dir)
    }

    fn kubeadm_join(&self, extras: &NodeCreationExtra) -> Result<(), EngineError> {
        let mut args = vec![
            "kubeadm",
            "join",
            extras.kube_host.as_str(),
            "--token",
            extras.kube_token.as_str(),
            "--discovery-token-ca-cert-hash",
            extras.kube_ca_cert.as_str(),
        ];
        for extra in &extras.kube_extra_args {
            args.push(extra.as_str());
        }

        multipass::exec(&self.name, &args).map_err(|e| EngineError::JoinFailed {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Label failures surface as bring-up errors; annotation failures are
    /// logged and tolerated.
    fn apply_labels(&self, extras: &NodeCreationExtra) -> Result<(), EngineError> {
        let mut pairs: Vec<(String, String)> = extras
            .node_labels
            .iter()
            .chain(extras.system_labels.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();

        if !pairs.is_empty() {
            kubectl::label(&self.name, &pairs, &extras.kubeconfig)?;
        }

        let annotations = vec![
            (LABEL_GROUP_NAME.to_string(), extras.group_id.clone()),
            (
                ANNOTATION_AUTO_PROVISIONED.to_string(),
                self.auto_provisioned.to_string(),
            ),
            (ANNOTATION_NODE_INDEX.to_string(), self.index.to_string()),
        ];
        if let Err(e) = kubectl::annotate(&self.name, &annotations, &extras.kubeconfig) {
            warn!(node = %self.name, error = %e, "Unable to annotate node");
        }

        Ok(())
    }

    /// Start a stopped VM and make it schedulable again.
    pub fn start(&mut self, kubeconfig: &str) -> Result<(), EngineError> {
        if !self.auto_provisioned {
            return Err(EngineError::ForeignVM(self.name.clone()));
        }

        match self.probe()? {
            NodeState::Running => Ok(()),
            NodeState::Stopped => {
                multipass::start(&self.name)?;
                if let Err(e) = kubectl::uncordon(&self.name, kubeconfig) {
                    warn!(node = %self.name, error = %e, "Uncordon failed");
                }
                self.state = NodeState::Running;
                info!(node = %self.name, "Started VM");
                Ok(())
            }
            state => Err(EngineError::UnexpectedState {
                name: self.name.clone(),
                state: state.to_string(),
            }),
        }
    }

    /// Cordon and stop a running VM.
    pub fn stop(&mut self, kubeconfig: &str) -> Result<(), EngineError> {
        if !self.auto_provisioned {
            return Err(EngineError::ForeignVM(self.name.clone()));
        }

        match self.probe()? {
            NodeState::Stopped => Ok(()),
            NodeState::Running => {
                if let Err(e) = kubectl::cordon(&self.name, kubeconfig) {
                    warn!(node = %self.name, error = %e, "Cordon failed");
                }
                multipass::stop(&self.name)?;
                self.state = NodeState::Stopped;
                info!(node = %self.name, "Stopped VM");
                Ok(())
            }
            state => Err(EngineError::UnexpectedState {
                name: self.name.clone(),
                state: state.to_string(),
            }),
        }
    }

    /// Tear the VM down. Cluster-side failures are logged and swallowed;
    /// once a VM is being deleted the engine prefers to proceed. VM-tool
    /// failures abort.
    pub fn delete(&mut self, kubeconfig: &str) -> Result<(), EngineError> {
        if !self.auto_provisioned {
            return Err(EngineError::ForeignVM(self.name.clone()));
        }

        let state = self.probe()?;

        if let Err(e) = kubectl::drain(&self.name, kubeconfig) {
            warn!(node = %self.name, error = %e, "Drain failed");
        }
        if let Err(e) = kubectl::delete_node(&self.name, kubeconfig) {
            warn!(node = %self.name, error = %e, "Node object deletion failed");
        }

        if state == NodeState::Running {
            multipass::stop(&self.name)?;
            self.state = NodeState::Stopped;
        }

        multipass::delete_purge(&self.name)?;
        self.state = NodeState::Deleted;
        info!(node = %self.name, "Deleted VM");
        Ok(())
    }

    /// Refresh state and addresses from the VM tool. Idempotent.
    pub fn probe(&mut self) -> Result<NodeState, EngineError> {
        let status = multipass::info(&self.name)?;
        self.addresses = status.ipv4;
        self.state = status.state;
        Ok(status.state)
    }
}
