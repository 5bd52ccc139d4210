//! The request surface the autoscaling controller talks to.
//!
//! Authorization is a shared token check; dispatch is synchronous and runs on
//! the blocking pool, so handlers may hold group locks across subprocess
//! waits. Only calls against the same group queue behind each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use mpas_core::config::{KubeAdmConfig, ServerConfig};
use mpas_core::errors::{ApiError, EngineError};
use mpas_core::kube::{self, KubeNode};
use mpas_core::protocol::{Request, ResourceLimiter, Response};
use mpas_core::time;

use crate::group::NodeGroup;
use crate::node::NodeCreationExtra;
use crate::snapshot::{self, GroupDocument, ServerDocument};

/// Fixed provider name reported to the controller.
pub const PROVIDER_NAME: &str = "multipass";

fn default_resource_limiter() -> ResourceLimiter {
    ResourceLimiter {
        min_limits: HashMap::from([("cpu".to_string(), 1), ("memory".to_string(), 10_000_000)]),
        max_limits: HashMap::from([("cpu".to_string(), 5), ("memory".to_string(), 100_000_000)]),
    }
}

/// The provider server: group registry, shared kubeadm parameters, and the
/// immutable configuration bundle.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    cache_dir: PathBuf,
    snapshot_path: Option<PathBuf>,
    kube_adm: RwLock<KubeAdmConfig>,
    resource_limiter: RwLock<ResourceLimiter>,
    groups: RwLock<HashMap<String, Arc<NodeGroup>>>,
}

impl Server {
    /// Fresh server from configuration only.
    pub fn new(config: ServerConfig, cache_dir: PathBuf, snapshot_path: Option<PathBuf>) -> Self {
        let kube_adm = config.kube_adm.clone();
        Self {
            config,
            cache_dir,
            snapshot_path,
            kube_adm: RwLock::new(kube_adm),
            resource_limiter: RwLock::new(default_resource_limiter()),
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Server restored from a snapshot document.
    pub fn from_document(
        doc: ServerDocument,
        config: ServerConfig,
        cache_dir: PathBuf,
        snapshot_path: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        if doc.server_id != config.secret {
            return Err(EngineError::LoadFailed {
                path: snapshot_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                reason: format!(
                    "snapshot belongs to provider {:?}, config expects {:?}",
                    doc.server_id, config.secret
                ),
            });
        }

        let server = Self::new(config, cache_dir, snapshot_path);
        *server.kube_adm.write().unwrap() = doc.kube_adm;
        *server.resource_limiter.write().unwrap() = doc.resource_limiter;
        {
            let server_id = server.server_id().to_string();
            let mut groups = server.groups.write().unwrap();
            for group_doc in doc.groups {
                let group = group_doc.into_group(&server_id);
                groups.insert(group.identifier.clone(), Arc::new(group));
            }
        }

        Ok(server)
    }

    pub fn server_id(&self) -> &str {
        &self.config.secret
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a group under its identifier.
    pub fn register_group(&self, group: NodeGroup) -> Result<Arc<NodeGroup>, EngineError> {
        let mut groups = self.groups.write().unwrap();
        if groups.contains_key(&group.identifier) {
            return Err(EngineError::GroupAlreadyExists(group.identifier.clone()));
        }
        let group = Arc::new(group);
        groups.insert(group.identifier.clone(), Arc::clone(&group));
        Ok(group)
    }

    fn group(&self, group_id: &str) -> Result<Arc<NodeGroup>, EngineError> {
        self.groups
            .read()
            .unwrap()
            .get(group_id)
            .cloned()
            .ok_or_else(|| EngineError::GroupNotFound(group_id.to_string()))
    }

    /// Resolve the owning group of a provider-ID.
    fn group_for_node(&self, provider_id: &str) -> Result<Arc<NodeGroup>, EngineError> {
        let group_id = mpas_core::providerid::decode_group(self.server_id(), provider_id)?;
        self.group(&group_id)
            .map_err(|_| EngineError::GroupForNodeNotFound(group_id, provider_id.to_string()))
    }

    fn creation_extras(&self, group: &NodeGroup) -> NodeCreationExtra {
        let kube_adm = self.kube_adm.read().unwrap().clone();
        NodeCreationExtra {
            group_id: group.identifier.clone(),
            kube_host: kube_adm.address,
            kube_token: kube_adm.token,
            kube_ca_cert: kube_adm.cacert,
            kube_extra_args: kube_adm.extra_arguments,
            kubeconfig: self.config.kube_ctl_config.clone(),
            image: self.config.image.clone(),
            cloud_init: self.config.cloud_init.clone(),
            mount_points: self.config.mount_points.clone(),
            node_labels: group.node_labels.clone(),
            system_labels: group.system_labels.clone(),
            vm_provision: self.config.auto_provision,
            cache_dir: self.cache_dir.clone(),
        }
    }

    /// Persist the registry when it exists on disk. Failures are logged;
    /// the triggering operation already succeeded.
    pub fn save_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = snapshot::save(&self.to_document(), path) {
            warn!(path = %path.display(), error = %e, "Snapshot save failed");
        }
    }

    pub fn to_document(&self) -> ServerDocument {
        let mut groups: Vec<GroupDocument> = self
            .groups
            .read()
            .unwrap()
            .values()
            .map(|g| GroupDocument::from_group(g))
            .collect();
        groups.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        ServerDocument {
            server_id: self.server_id().to_string(),
            kube_adm: self.kube_adm.read().unwrap().clone(),
            resource_limiter: self.resource_limiter.read().unwrap().clone(),
            groups,
            saved_at: time::utc_now(),
        }
    }

    /// Run discovery for every registered group, reconciling the model with
    /// cluster state. Invoked at startup before serving.
    pub fn auto_discover_all(&self, scale_down_disabled: bool) {
        let groups: Vec<Arc<NodeGroup>> =
            self.groups.read().unwrap().values().cloned().collect();

        for group in groups {
            if let Err(e) =
                group.auto_discovery(scale_down_disabled, &self.config.kube_ctl_config)
            {
                warn!(group = %group.identifier, error = %e, "Auto-discovery failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Execute one request. Token mismatch rejects before anything else.
    pub fn dispatch(&self, request: Request) -> Response {
        if request.provider_id() != self.server_id() {
            warn!("Secret doesn't match with target server");
            return Response::Error(ApiError::from(EngineError::ProviderMismatch));
        }

        let result = match request {
            Request::Connect {
                resource_limiter,
                kube_adm,
                ..
            } => self.connect(resource_limiter, kube_adm),
            Request::Name { .. } => Ok(Response::Name {
                name: PROVIDER_NAME.to_string(),
            }),
            Request::NodeGroups { .. } => self.node_groups(),
            Request::NodeGroupForNode { node, .. } => self.node_group_for_node(&node),
            Request::GetAvailableMachineTypes { .. } => self.available_machine_types(),
            Request::NewNodeGroup { machine_type, .. } => self.new_node_group(&machine_type),
            Request::GetResourceLimiter { .. } => Ok(Response::ResourceLimiter(
                self.resource_limiter.read().unwrap().clone(),
            )),
            Request::Refresh { .. } => Ok(Response::Ok),
            Request::Cleanup { .. } => self.cleanup_all(),
            Request::MaxSize { node_group_id, .. } => self
                .group(&node_group_id)
                .map(|g| Response::Size {
                    size: g.max_size as i64,
                }),
            Request::MinSize { node_group_id, .. } => self
                .group(&node_group_id)
                .map(|g| Response::Size {
                    size: g.min_size as i64,
                }),
            Request::TargetSize { node_group_id, .. } => self
                .group(&node_group_id)
                .map(|g| Response::Size {
                    size: g.target_size() as i64,
                }),
            Request::IncreaseSize {
                node_group_id,
                delta,
                ..
            } => self.increase_size(&node_group_id, delta),
            Request::DecreaseTargetSize {
                node_group_id,
                delta,
                ..
            } => self.decrease_target_size(&node_group_id, delta),
            Request::DeleteNodes {
                node_group_id,
                nodes,
                ..
            } => self.delete_nodes(&node_group_id, &nodes),
            Request::Id { node_group_id, .. } => self.group(&node_group_id).map(|g| Response::Id {
                id: g.identifier.clone(),
            }),
            Request::Debug { node_group_id, .. } => {
                self.group(&node_group_id).map(|g| Response::Debug {
                    info: format!("{}-{}", self.server_id(), g.identifier),
                })
            }
            Request::Nodes { node_group_id, .. } => {
                self.group(&node_group_id).map(|g| Response::Instances {
                    instances: g.instances(),
                })
            }
            Request::TemplateNodeInfo { node_group_id, .. } => {
                self.template_node_info(&node_group_id)
            }
            Request::Exist { node_group_id, .. } => Ok(Response::Exists {
                exists: self.groups.read().unwrap().contains_key(&node_group_id),
            }),
            Request::Create { node_group_id, .. } => self.create(&node_group_id),
            Request::Delete { node_group_id, .. } => self.delete(&node_group_id),
            Request::Autoprovisioned { .. } => Ok(Response::Autoprovisioned {
                autoprovisioned: true,
            }),
            Request::Belongs {
                node_group_id,
                node,
                ..
            } => self.belongs(&node_group_id, &node),
            Request::Pricing { .. } => self.pricing(),
            Request::NodePrice { .. } => self.price(self.config.node_price),
            Request::PodPrice { .. } => self.price(self.config.pod_price),
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Request failed");
                Response::Error(ApiError::from(err))
            }
        }
    }

    fn connect(
        &self,
        resource_limiter: Option<ResourceLimiter>,
        kube_adm: Option<KubeAdmConfig>,
    ) -> Result<Response, EngineError> {
        if let Some(limiter) = resource_limiter {
            *self.resource_limiter.write().unwrap() = limiter;
        }
        if let Some(kube_adm) = kube_adm {
            *self.kube_adm.write().unwrap() = kube_adm;
        }
        Ok(Response::Connected { connected: true })
    }

    fn node_groups(&self) -> Result<Response, EngineError> {
        let mut node_groups: Vec<String> =
            self.groups.read().unwrap().keys().cloned().collect();
        node_groups.sort();
        Ok(Response::NodeGroups { node_groups })
    }

    fn node_group_for_node(&self, node_json: &str) -> Result<Response, EngineError> {
        let node = kube::node_from_json(node_json)?;
        let group = self.group_for_node(&node.spec.provider_id)?;
        Ok(Response::NodeGroup {
            node_group_id: group.identifier.clone(),
        })
    }

    fn available_machine_types(&self) -> Result<Response, EngineError> {
        if !self.config.optionals.get_available_machine_types {
            return Err(EngineError::NotImplemented("GetAvailableMachineTypes"));
        }
        let mut machine_types: Vec<String> = self.config.machines.keys().cloned().collect();
        machine_types.sort();
        Ok(Response::MachineTypes { machine_types })
    }

    fn new_node_group(&self, machine_type: &str) -> Result<Response, EngineError> {
        if !self.config.optionals.new_node_group {
            return Err(EngineError::NotImplemented("NewNodeGroup"));
        }

        let machine = self
            .config
            .machines
            .get(machine_type)
            .copied()
            .ok_or_else(|| EngineError::MachineTypeNotFound(machine_type.to_string()))?;

        let group_id = format!("ng-{}", time::unix_now());
        let group = NodeGroup::new(
            &group_id,
            self.server_id(),
            machine,
            self.config.min_node,
            self.config.max_node,
            self.config.node_labels.clone(),
            self.config.system_labels.clone(),
        );
        self.register_group(group)?;

        info!(group = %group_id, machine = %machine_type, "Registered node group");
        self.save_snapshot();

        Ok(Response::NodeGroup {
            node_group_id: group_id,
        })
    }

    fn create(&self, group_id: &str) -> Result<Response, EngineError> {
        if !self.config.optionals.create {
            return Err(EngineError::NotImplemented("Create"));
        }

        let group = self.group(group_id)?;

        if group.status() == mpas_core::state::GroupStatus::NotCreated {
            group.set_status(mpas_core::state::GroupStatus::Created);

            if group.min_size > 0 {
                let extras = self.creation_extras(&group);
                group.set_size(group.min_size, &extras)?;
            }
        }

        self.save_snapshot();
        Ok(Response::NodeGroup {
            node_group_id: group.identifier.clone(),
        })
    }

    fn delete(&self, group_id: &str) -> Result<Response, EngineError> {
        if !self.config.optionals.delete {
            return Err(EngineError::NotImplemented("Delete"));
        }

        let group = self.group(group_id)?;
        group.cleanup(&self.config.kube_ctl_config)?;

        self.groups.write().unwrap().remove(group_id);
        info!(group = %group_id, "Deleted node group");
        self.save_snapshot();

        Ok(Response::Ok)
    }

    fn increase_size(&self, group_id: &str, delta: i64) -> Result<Response, EngineError> {
        let group = self.group(group_id)?;

        if delta <= 0 {
            return Err(EngineError::SizeMustBePositive);
        }

        // Increase is relative to realized members, not target.
        let new_size = group.member_count() + delta as usize;
        if new_size > group.max_size {
            return Err(EngineError::SizeTooLarge {
                desired: new_size,
                max: group.max_size,
            });
        }

        let extras = self.creation_extras(&group);
        group.set_size(new_size, &extras)?;
        self.save_snapshot();

        Ok(Response::Ok)
    }

    fn decrease_target_size(&self, group_id: &str, delta: i64) -> Result<Response, EngineError> {
        let group = self.group(group_id)?;

        if delta >= 0 {
            return Err(EngineError::SizeMustBeNegative);
        }

        let target = group.target_size();
        let new_size = target as i64 + delta;
        let existing = group.member_count();

        // Shrinking the target into the realized set means deleting nodes;
        // that path is DeleteNodes.
        if new_size < existing as i64 {
            return Err(EngineError::AttemptDeleteNodes {
                target,
                delta,
                existing,
            });
        }

        let extras = self.creation_extras(&group);
        group.set_size(new_size as usize, &extras)?;
        self.save_snapshot();

        Ok(Response::Ok)
    }

    fn delete_nodes(&self, group_id: &str, nodes: &[String]) -> Result<Response, EngineError> {
        let group = self.group(group_id)?;

        // Min-size floor is checked against the whole request up front.
        if group.target_size() < group.min_size + nodes.len() {
            return Err(EngineError::MinSizeReached(group.identifier.clone()));
        }

        for node_json in nodes {
            let node: KubeNode = kube::node_from_json(node_json)?;
            let provider_id = &node.spec.provider_id;

            let owner = self.group_for_node(provider_id)?;
            if owner.identifier != group.identifier {
                return Err(EngineError::UnableToDeleteNode(
                    provider_id.clone(),
                    group.identifier.clone(),
                ));
            }

            let node_name = mpas_core::providerid::decode_node(self.server_id(), provider_id)?;
            group.delete_node_by_name(&self.config.kube_ctl_config, &node_name)?;
        }

        self.save_snapshot();
        Ok(Response::Ok)
    }

    fn belongs(&self, group_id: &str, node_json: &str) -> Result<Response, EngineError> {
        let node = kube::node_from_json(node_json)?;
        let owner = self.group_for_node(&node.spec.provider_id)?;

        let belongs = owner.identifier == group_id && {
            let node_name =
                mpas_core::providerid::decode_node(self.server_id(), &node.spec.provider_id)?;
            owner.contains_member(&node_name)
        };

        Ok(Response::Belongs { belongs })
    }

    fn template_node_info(&self, group_id: &str) -> Result<Response, EngineError> {
        if !self.config.optionals.template_node_info {
            return Err(EngineError::NotImplemented("TemplateNodeInfo"));
        }

        let group = self.group(group_id)?;

        // A synthesized record with the group identity and nothing else; the
        // controller uses it for scale-up simulation.
        let mut template = KubeNode::default();
        template.spec.provider_id = group.provider_id();
        template.spec.unschedulable = false;

        let node = serde_json::to_string(&template)
            .map_err(|e| EngineError::NodeParse(e.to_string()))?;
        Ok(Response::NodeInfo { node })
    }

    fn cleanup_all(&self) -> Result<Response, EngineError> {
        let groups: Vec<Arc<NodeGroup>> =
            self.groups.read().unwrap().values().cloned().collect();

        let mut last_error = None;
        for group in groups {
            if let Err(e) = group.cleanup(&self.config.kube_ctl_config) {
                last_error = Some(e);
            }
        }

        self.save_snapshot();
        match last_error {
            Some(e) => Err(e),
            None => Ok(Response::Ok),
        }
    }

    fn pricing(&self) -> Result<Response, EngineError> {
        if !self.config.optionals.pricing {
            return Err(EngineError::NotImplemented("Pricing"));
        }
        Ok(Response::PricingModel {
            model_id: self.server_id().to_string(),
        })
    }

    fn price(&self, price: f64) -> Result<Response, EngineError> {
        if !self.config.optionals.pricing {
            return Err(EngineError::NotImplemented("Pricing"));
        }
        Ok(Response::Price { price })
    }
}
