//! The node-group scaling engine.
//!
//! A group serializes every size-changing operation behind one state mutex,
//! held across subprocess waits so the controller observes sequential
//! semantics per group. `status` lives in an atomic so a concurrent cleanup
//! can flip it to Deleting while a batch holds the lock; the in-flight batch
//! observes the flip between launches and abandons its tail. The pending
//! counter is the rendezvous cleanup waits on before deleting members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::{debug, error, info, warn};

use mpas_core::errors::EngineError;
use mpas_core::kube::{
    ANNOTATION_AUTO_PROVISIONED, ANNOTATION_NODE_INDEX, ANNOTATION_SCALE_DOWN_DISABLED,
    LABEL_GROUP_NAME,
};
use mpas_core::machine::MachineType;
use mpas_core::protocol::Instance;
use mpas_core::providerid;
use mpas_core::state::{GroupStatus, NodeState};
use mpas_driver::kubectl;

use crate::node::{Node, NodeCreationExtra};

/// Mutable registry of a group: realized members, in-flight pending records,
/// and the high-water creation index. Indices never recycle.
#[derive(Debug, Default)]
pub struct GroupInner {
    pub members: HashMap<String, Node>,
    pub pending: HashMap<String, Node>,
    pub last_created_index: usize,
}

/// A named cohort of VMs scaled as a unit.
#[derive(Debug)]
pub struct NodeGroup {
    pub identifier: String,
    pub server_id: String,
    pub machine: MachineType,
    pub min_size: usize,
    pub max_size: usize,
    pub node_labels: HashMap<String, String>,
    pub system_labels: HashMap<String, String>,
    status: AtomicU8,
    state: Mutex<GroupInner>,
    pending_count: Mutex<usize>,
    pending_drained: Condvar,
}

impl NodeGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: &str,
        server_id: &str,
        machine: MachineType,
        min_size: usize,
        max_size: usize,
        node_labels: HashMap<String, String>,
        system_labels: HashMap<String, String>,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            server_id: server_id.to_string(),
            machine,
            min_size,
            max_size,
            node_labels,
            system_labels,
            status: AtomicU8::new(GroupStatus::NotCreated.as_u8()),
            state: Mutex::new(GroupInner::default()),
            pending_count: Mutex::new(0),
            pending_drained: Condvar::new(),
        }
    }

    /// Rebuild a group from its snapshot document.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        identifier: &str,
        server_id: &str,
        machine: MachineType,
        min_size: usize,
        max_size: usize,
        node_labels: HashMap<String, String>,
        system_labels: HashMap<String, String>,
        status: GroupStatus,
        last_created_index: usize,
        members: Vec<Node>,
    ) -> Self {
        let group = Self::new(
            identifier,
            server_id,
            machine,
            min_size,
            max_size,
            node_labels,
            system_labels,
        );
        group.status.store(status.as_u8(), Ordering::SeqCst);
        {
            let mut st = group.state.lock().unwrap();
            st.last_created_index = last_created_index;
            for node in members {
                st.members.insert(node.name.clone(), node);
            }
        }
        group
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: GroupStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    /// Deterministic member name for a creation index.
    pub fn node_name(&self, index: usize) -> String {
        format!("{}-vm-{:02}", self.identifier, index)
    }

    pub fn provider_id(&self) -> String {
        providerid::encode_group(&self.server_id, &self.identifier)
    }

    pub fn provider_id_for_node(&self, node_name: &str) -> String {
        providerid::encode_node(&self.server_id, &self.identifier, node_name)
    }

    /// Requested capacity the engine is working towards.
    pub fn target_size(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.pending.len() + st.members.len()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().unwrap().members.len()
    }

    pub fn contains_member(&self, node_name: &str) -> bool {
        self.state.lock().unwrap().members.contains_key(node_name)
    }

    pub fn last_created_index(&self) -> usize {
        self.state.lock().unwrap().last_created_index
    }

    /// Every member as `{provider-id, state}` for the `Nodes` reply.
    pub fn instances(&self) -> Vec<Instance> {
        let st = self.state.lock().unwrap();
        let mut instances: Vec<Instance> = st
            .members
            .values()
            .map(|node| Instance {
                id: node.provider_id.clone(),
                state: node.state,
            })
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Members cloned for the snapshot document. Pending records are
    /// transient and excluded.
    pub fn members_for_snapshot(&self) -> Vec<Node> {
        let st = self.state.lock().unwrap();
        let mut members: Vec<Node> = st.members.values().cloned().collect();
        members.sort_by_key(|n| n.index);
        members
    }

    /// Reconcile the requested size with the current target.
    pub fn set_size(&self, new_size: usize, extras: &NodeCreationExtra) -> Result<(), EngineError> {
        let mut st = self.state.lock().unwrap();
        let target = (st.pending.len() + st.members.len()) as i64;
        let delta = new_size as i64 - target;

        debug!(group = %self.identifier, target, delta, "Set node group size");

        if delta < 0 {
            self.delete_nodes_locked(&mut st, delta, extras)
        } else if delta > 0 {
            self.add_nodes_locked(&mut st, delta as usize, extras)
        } else {
            Ok(())
        }
    }

    /// Bulk bring-up. Allocates the whole batch into pending up front, then
    /// launches serially; any launch failure rolls the entire batch back and
    /// returns the original error.
    fn add_nodes_locked(
        &self,
        st: &mut GroupInner,
        delta: usize,
        extras: &NodeCreationExtra,
    ) -> Result<(), EngineError> {
        let mut batch: Vec<String> = Vec::with_capacity(delta);

        for _ in 0..delta {
            if self.status() != GroupStatus::Created {
                debug!(group = %self.identifier, "Group is not accepting nodes");
                break;
            }

            st.last_created_index += 1;
            let name = self.node_name(st.last_created_index);
            let node = Node {
                provider_id: self.provider_id_for_node(&name),
                name: name.clone(),
                index: st.last_created_index,
                memory: self.machine.memsize,
                cpu: self.machine.vcpus,
                disk: self.machine.disksize,
                addresses: Vec::new(),
                state: NodeState::NotCreated,
                auto_provisioned: true,
            };

            st.pending.insert(name.clone(), node);
            self.add_pending(1);
            batch.push(name);
        }

        for name in &batch {
            if self.status() != GroupStatus::Created {
                debug!(group = %self.identifier, "Group no longer accepting nodes, abandoning batch");
                break;
            }

            let result = match st.pending.get_mut(name) {
                Some(node) => node.launch(extras),
                None => continue,
            };

            match result {
                Ok(()) => {
                    if let Some(node) = st.pending.remove(name) {
                        st.members.insert(name.clone(), node);
                        self.finish_pending(1);
                    }
                }
                Err(err) => {
                    error!(group = %self.identifier, node = %name, error = %err, "Unable to launch VM");
                    self.rollback_batch(st, &batch, extras);
                    return Err(err);
                }
            }
        }

        // Drain any abandoned tail so a waiting cleanup can proceed. The
        // records never launched, so there is nothing to reap.
        for name in &batch {
            if st.pending.remove(name).is_some() {
                self.finish_pending(1);
            }
        }

        Ok(())
    }

    /// Undo a failed batch: every record of the batch leaves the model, and
    /// any VM that actually exists is best-effort deleted.
    fn rollback_batch(&self, st: &mut GroupInner, batch: &[String], extras: &NodeCreationExtra) {
        for name in batch {
            let node = match st.pending.remove(name) {
                Some(node) => {
                    self.finish_pending(1);
                    Some(node)
                }
                None => st.members.remove(name),
            };

            let Some(mut node) = node else { continue };

            match node.probe() {
                Ok(state) if state != NodeState::NotCreated => {
                    if let Err(e) = node.delete(&extras.kubeconfig) {
                        error!(group = %self.identifier, node = %name, error = %e, "Rollback delete failed");
                    }
                }
                _ => {}
            }
        }
    }

    /// Tear down `-delta` members, walking positions from the end of the
    /// realized set. Names that do not resolve (index gaps) are skipped.
    fn delete_nodes_locked(
        &self,
        st: &mut GroupInner,
        delta: i64,
        extras: &NodeCreationExtra,
    ) -> Result<(), EngineError> {
        let start = st.members.len() as i64 - 1;
        let end = st.members.len() as i64 + delta;

        for position in (end.max(0)..=start).rev() {
            let name = self.node_name(position as usize);

            let Some(node) = st.members.get_mut(&name) else {
                continue;
            };

            if let Err(e) = node.delete(&extras.kubeconfig) {
                error!(group = %self.identifier, node = %name, error = %e, "Unable to delete VM");
                return Err(e);
            }

            st.members.remove(&name);
        }

        Ok(())
    }

    /// Probe every member so `addresses` and `state` reflect reality.
    pub fn refresh(&self) {
        let mut st = self.state.lock().unwrap();
        for node in st.members.values_mut() {
            if let Err(e) = node.probe() {
                warn!(group = %self.identifier, node = %node.name, error = %e, "Probe failed");
            }
        }
    }

    /// Destructor: stop accepting nodes, wait out in-flight bring-ups, then
    /// delete every member. Per-node errors are logged and the last one is
    /// returned.
    pub fn cleanup(&self, kubeconfig: &str) -> Result<(), EngineError> {
        info!(group = %self.identifier, "Cleaning up node group");

        self.set_status(GroupStatus::Deleting);
        self.wait_pending_drained();

        let mut st = self.state.lock().unwrap();
        let mut last_error = None;

        for node in st.members.values_mut() {
            if let Err(e) = node.delete(kubeconfig) {
                error!(group = %self.identifier, node = %node.name, error = %e, "Failed to delete VM during cleanup");
                last_error = Some(e);
            }
        }

        st.members.clear();
        st.pending.clear();
        self.set_status(GroupStatus::Deleted);

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rebuild membership from the cluster node list. This is the only path
    /// by which foreign nodes become visible and the only path by which a
    /// restarted engine reattaches to VMs it previously created.
    pub fn auto_discovery(
        &self,
        scale_down_disabled: bool,
        kubeconfig: &str,
    ) -> Result<(), EngineError> {
        let node_list = kubectl::list_nodes(kubeconfig)?;

        let mut st = self.state.lock().unwrap();
        let former = std::mem::take(&mut st.members);
        st.pending.clear();

        for cluster_node in node_list.items {
            let provider_id = cluster_node.spec.provider_id.clone();
            if provider_id.is_empty() {
                continue;
            }

            // Foreign schemes and other groups are simply not ours.
            let Ok(group_id) = providerid::decode_group(&self.server_id, &provider_id) else {
                continue;
            };
            if group_id != self.identifier {
                continue;
            }
            let Ok(node_name) = providerid::decode_node(&self.server_id, &provider_id) else {
                continue;
            };
            if node_name.is_empty() {
                continue;
            }

            let running_ip = cluster_node.internal_ip().unwrap_or_default().to_string();
            info!(
                group = %self.identifier,
                node = %node_name,
                ip = %running_ip,
                "Discovered cluster node"
            );

            let annotation_index = cluster_node
                .metadata
                .annotations
                .get(ANNOTATION_NODE_INDEX)
                .and_then(|v| v.parse::<usize>().ok());
            if let Some(index) = annotation_index {
                st.last_created_index = st.last_created_index.max(index);
            }

            let mut node = match former.get(&node_name) {
                Some(known) => known.clone(),
                None => {
                    let auto_provisioned = cluster_node
                        .metadata
                        .annotations
                        .get(ANNOTATION_AUTO_PROVISIONED)
                        .is_some_and(|v| v == "true");

                    let node = Node {
                        provider_id: provider_id.clone(),
                        name: node_name.clone(),
                        index: annotation_index.unwrap_or(0),
                        memory: self.machine.memsize,
                        cpu: self.machine.vcpus,
                        disk: self.machine.disksize,
                        addresses: vec![running_ip.clone()],
                        state: NodeState::Running,
                        auto_provisioned,
                    };

                    let annotations = vec![
                        (
                            ANNOTATION_SCALE_DOWN_DISABLED.to_string(),
                            (scale_down_disabled && !auto_provisioned).to_string(),
                        ),
                        (
                            ANNOTATION_AUTO_PROVISIONED.to_string(),
                            auto_provisioned.to_string(),
                        ),
                        (ANNOTATION_NODE_INDEX.to_string(), node.index.to_string()),
                    ];
                    if let Err(e) =
                        kubectl::annotate(&cluster_node.metadata.name, &annotations, kubeconfig)
                    {
                        warn!(node = %cluster_node.metadata.name, error = %e, "Unable to annotate node");
                    }

                    let labels = vec![(LABEL_GROUP_NAME.to_string(), self.identifier.clone())];
                    if let Err(e) =
                        kubectl::label(&cluster_node.metadata.name, &labels, kubeconfig)
                    {
                        warn!(node = %cluster_node.metadata.name, error = %e, "Unable to label node");
                    }

                    node
                }
            };

            if let Err(e) = node.probe() {
                warn!(group = %self.identifier, node = %node_name, error = %e, "VM probe failed after discovery");
            }

            st.members.insert(node_name, node);
        }

        Ok(())
    }

    /// Delete one member by name. Min-size policy is the server's concern.
    pub fn delete_node_by_name(
        &self,
        kubeconfig: &str,
        node_name: &str,
    ) -> Result<(), EngineError> {
        let mut st = self.state.lock().unwrap();

        match st.members.get_mut(node_name) {
            Some(node) => {
                node.delete(kubeconfig)?;
                st.members.remove(node_name);
                Ok(())
            }
            None => Err(EngineError::NodeNotInGroup(
                node_name.to_string(),
                self.identifier.clone(),
            )),
        }
    }

    pub fn pending_count(&self) -> usize {
        *self.pending_count.lock().unwrap()
    }

    fn add_pending(&self, n: usize) {
        *self.pending_count.lock().unwrap() += n;
    }

    fn finish_pending(&self, n: usize) {
        let mut count = self.pending_count.lock().unwrap();
        *count = count.saturating_sub(n);
        if *count == 0 {
            self.pending_drained.notify_all();
        }
    }

    fn wait_pending_drained(&self) {
        let mut count = self.pending_count.lock().unwrap();
        while *count > 0 {
            count = self.pending_drained.wait(count).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use mpas_driver::shell_mock::{self, MockResponse};

    const SERVER: &str = "multipass";

    fn info_json(name: &str, state: &str) -> String {
        format!(
            r#"{{"errors": [], "info": {{"{name}": {{"state": "{state}", "ipv4": ["10.114.21.7"]}}}}}}"#
        )
    }

    fn vm_name_of(line: &str) -> String {
        // "multipass info <name> --format=json"
        line.split_whitespace().nth(2).unwrap_or("").to_string()
    }

    fn ready_json(name: &str) -> String {
        format!(
            r#"{{"metadata": {{"name": "{name}"}},
                 "status": {{"conditions": [{{"type": "Ready", "status": "True"}}]}}}}"#
        )
    }

    fn test_extras(cache_dir: &Path) -> NodeCreationExtra {
        NodeCreationExtra {
            group_id: "ng-1".to_string(),
            kube_host: "192.168.1.20:6443".to_string(),
            kube_token: "abcdef.0123456789abcdef".to_string(),
            kube_ca_cert: "sha256:1234".to_string(),
            kube_extra_args: Vec::new(),
            kubeconfig: "/etc/kubernetes/admin.conf".to_string(),
            image: String::new(),
            cloud_init: serde_json::Value::Null,
            mount_points: HashMap::new(),
            node_labels: HashMap::new(),
            system_labels: HashMap::new(),
            vm_provision: true,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    fn test_group() -> NodeGroup {
        let group = NodeGroup::new(
            "ng-1",
            SERVER,
            MachineType {
                memsize: 2048,
                vcpus: 2,
                disksize: 5120,
            },
            0,
            5,
            HashMap::new(),
            HashMap::new(),
        );
        group.set_status(GroupStatus::Created);
        group
    }

    /// Handler where every VM in `live` exists and every launch succeeds.
    fn happy_handler() -> impl FnMut(&str) -> MockResponse + 'static {
        let mut live: Vec<String> = Vec::new();
        move |line: &str| {
            if line.starts_with("multipass launch") {
                let name = line.split_whitespace().nth(3).unwrap().to_string();
                live.push(name);
                MockResponse::empty()
            } else if line.starts_with("multipass info") {
                let name = vm_name_of(line);
                if live.contains(&name) {
                    MockResponse::ok(&info_json(&name, "Running"))
                } else {
                    MockResponse::ok(r#"{"errors": [], "info": {}}"#)
                }
            } else if line.starts_with("kubectl get nodes") {
                MockResponse::ok(&ready_json(&vm_name_of(line)))
            } else {
                MockResponse::empty()
            }
        }
    }

    #[test]
    fn test_node_name_is_zero_padded() {
        let group = test_group();
        assert_eq!(group.node_name(1), "ng-1-vm-01");
        assert_eq!(group.node_name(12), "ng-1-vm-12");
        assert_eq!(group.node_name(101), "ng-1-vm-101");
    }

    #[test]
    fn test_provider_ids_decode_back() {
        let group = test_group();
        assert_eq!(
            providerid::decode_group(SERVER, &group.provider_id()).unwrap(),
            "ng-1"
        );
        let node_id = group.provider_id_for_node("ng-1-vm-03");
        assert_eq!(
            providerid::decode_node(SERVER, &node_id).unwrap(),
            "ng-1-vm-03"
        );
    }

    #[test]
    fn test_add_nodes_grows_members() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(happy_handler());

        let group = test_group();
        group.set_size(2, &test_extras(dir.path())).unwrap();

        // P1: members + pending == target size at every stable point.
        assert_eq!(group.target_size(), 2);
        assert_eq!(group.member_count(), 2);
        assert_eq!(group.pending_count(), 0);
        assert!(group.contains_member("ng-1-vm-01"));
        assert!(group.contains_member("ng-1-vm-02"));
        assert_eq!(group.last_created_index(), 2);
    }

    #[test]
    fn test_indices_are_unique_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(happy_handler());

        let group = test_group();
        group.set_size(3, &test_extras(dir.path())).unwrap();

        // P2: all indices distinct and <= last_created_index.
        let members = group.members_for_snapshot();
        let mut indices: Vec<usize> = members.iter().map(|n| n.index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 3);
        assert!(indices.iter().all(|i| *i <= group.last_created_index()));
    }

    #[test]
    fn test_launch_failure_rolls_back_whole_batch() {
        let dir = tempfile::tempdir().unwrap();

        // First launch succeeds, second fails.
        let mut launches = 0;
        let mut live: Vec<String> = Vec::new();
        let _guard = shell_mock::install(move |line: &str| {
            if line.starts_with("multipass launch") {
                launches += 1;
                if launches == 2 {
                    return MockResponse::fail("cannot pull image");
                }
                live.push(line.split_whitespace().nth(3).unwrap().to_string());
                MockResponse::empty()
            } else if line.starts_with("multipass info") {
                let name = vm_name_of(line);
                if live.contains(&name) {
                    MockResponse::ok(&info_json(&name, "Running"))
                } else {
                    MockResponse::ok(r#"{"errors": [], "info": {}}"#)
                }
            } else if line.starts_with("kubectl get nodes") {
                MockResponse::ok(&ready_json(&vm_name_of(line)))
            } else {
                MockResponse::empty()
            }
        });

        let group = test_group();
        let err = group.set_size(2, &test_extras(dir.path())).unwrap_err();
        assert!(matches!(err, EngineError::VMLaunchFailed { .. }));

        // P7 / scenario 2: no new members, empty pending, indices consumed.
        assert_eq!(group.member_count(), 0);
        assert_eq!(group.target_size(), 0);
        assert_eq!(group.pending_count(), 0);
        assert_eq!(group.last_created_index(), 2);

        // The successfully launched first VM was reaped.
        assert_eq!(shell_mock::calls_matching("multipass delete --purge ng-1-vm-01"), 1);
        assert_eq!(shell_mock::calls_matching("multipass delete --purge ng-1-vm-02"), 0);
    }

    #[test]
    fn test_indices_are_not_recycled_after_rollback() {
        let dir = tempfile::tempdir().unwrap();

        // Fail every launch once, then succeed.
        let mut fail_next = true;
        let mut live: Vec<String> = Vec::new();
        let _guard = shell_mock::install(move |line: &str| {
            if line.starts_with("multipass launch") {
                if fail_next {
                    fail_next = false;
                    return MockResponse::fail("transient launch failure");
                }
                live.push(line.split_whitespace().nth(3).unwrap().to_string());
                MockResponse::empty()
            } else if line.starts_with("multipass info") {
                let name = vm_name_of(line);
                if live.contains(&name) {
                    MockResponse::ok(&info_json(&name, "Running"))
                } else {
                    MockResponse::ok(r#"{"errors": [], "info": {}}"#)
                }
            } else if line.starts_with("kubectl get nodes") {
                MockResponse::ok(&ready_json(&vm_name_of(line)))
            } else {
                MockResponse::empty()
            }
        });

        let group = test_group();
        let extras = test_extras(dir.path());

        assert!(group.set_size(1, &extras).is_err());
        group.set_size(1, &extras).unwrap();

        // The retry consumed a fresh index.
        assert!(group.contains_member("ng-1-vm-02"));
        assert!(!group.contains_member("ng-1-vm-01"));
        assert_eq!(group.last_created_index(), 2);
    }

    #[test]
    fn test_set_size_down_deletes_from_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(happy_handler());

        let group = test_group();
        let extras = test_extras(dir.path());
        group.set_size(3, &extras).unwrap();

        group.set_size(1, &extras).unwrap();

        assert_eq!(group.member_count(), 1);
        assert_eq!(group.target_size(), 1);
        // The positional walk covers positions 2 and 1, so vm-02 and vm-01
        // go and vm-03 survives.
        assert!(group.contains_member("ng-1-vm-03"));
        assert_eq!(shell_mock::calls_matching("multipass delete --purge ng-1-vm-01"), 1);
        assert_eq!(shell_mock::calls_matching("multipass delete --purge ng-1-vm-02"), 1);
    }

    #[test]
    fn test_set_size_noop_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(happy_handler());

        let group = test_group();
        let extras = test_extras(dir.path());
        group.set_size(2, &extras).unwrap();

        let calls_before = shell_mock::recorded_calls().len();
        group.set_size(2, &extras).unwrap();
        assert_eq!(shell_mock::recorded_calls().len(), calls_before);
    }

    #[test]
    fn test_add_nodes_refused_unless_created() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(happy_handler());

        let group = test_group();
        group.set_status(GroupStatus::Deleting);

        group.set_size(3, &test_extras(dir.path())).unwrap();
        assert_eq!(group.target_size(), 0);
        assert_eq!(group.pending_count(), 0);
        assert_eq!(shell_mock::calls_matching("multipass launch"), 0);
    }

    #[test]
    fn test_cleanup_cancels_in_flight_batch() {
        let dir = tempfile::tempdir().unwrap();

        // Scenario 6, deterministic form: the first launch flips the group
        // to Deleting (as a concurrent Delete RPC would); the batch must
        // abandon its tail and cleanup must leave nothing behind.
        let group = Arc::new(test_group());
        let flipper = Arc::clone(&group);

        let mut live: Vec<String> = Vec::new();
        let _guard = shell_mock::install(move |line: &str| {
            if line.starts_with("multipass launch") {
                flipper.set_status(GroupStatus::Deleting);
                live.push(line.split_whitespace().nth(3).unwrap().to_string());
                MockResponse::empty()
            } else if line.starts_with("multipass info") {
                let name = vm_name_of(line);
                if live.contains(&name) {
                    MockResponse::ok(&info_json(&name, "Running"))
                } else {
                    MockResponse::ok(r#"{"errors": [], "info": {}}"#)
                }
            } else if line.starts_with("kubectl get nodes") {
                MockResponse::ok(&ready_json(&vm_name_of(line)))
            } else {
                MockResponse::empty()
            }
        });

        let extras = test_extras(dir.path());
        group.set_size(5, &extras).unwrap();

        // Only the first launch ran; the tail was abandoned and drained.
        assert_eq!(shell_mock::calls_matching("multipass launch"), 1);
        assert_eq!(group.member_count(), 1);
        assert_eq!(group.pending_count(), 0);

        group.cleanup("/etc/kubernetes/admin.conf").unwrap();
        assert_eq!(group.status(), GroupStatus::Deleted);
        assert_eq!(group.member_count(), 0);
        assert_eq!(group.target_size(), 0);
        assert_eq!(shell_mock::calls_matching("multipass delete --purge"), 1);
    }

    #[test]
    fn test_cleanup_reports_last_error_but_clears() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(happy_handler());

        let group = test_group();
        group.set_size(1, &test_extras(dir.path())).unwrap();

        // A foreign node in the model refuses deletion; cleanup surfaces
        // that error but still clears the registry.
        {
            let mut st = group.state.lock().unwrap();
            st.members.insert(
                "master-01".to_string(),
                Node {
                    provider_id: group.provider_id_for_node("master-01"),
                    name: "master-01".to_string(),
                    index: 0,
                    memory: 0,
                    cpu: 0,
                    disk: 0,
                    addresses: Vec::new(),
                    state: NodeState::Running,
                    auto_provisioned: false,
                },
            );
        }

        let err = group.cleanup("/kc").unwrap_err();
        assert!(matches!(err, EngineError::ForeignVM(_)));
        assert_eq!(group.status(), GroupStatus::Deleted);
        assert_eq!(group.member_count(), 0);
        // Only the auto-provisioned VM was purged.
        assert_eq!(shell_mock::calls_matching("multipass delete --purge"), 1);
    }

    #[test]
    fn test_delete_node_by_name_unknown() {
        let _guard = shell_mock::install(|_| MockResponse::empty());
        let group = test_group();
        assert!(matches!(
            group.delete_node_by_name("/kc", "ng-1-vm-99"),
            Err(EngineError::NodeNotInGroup(..))
        ));
    }

    #[test]
    fn test_refresh_updates_member_state() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(happy_handler());

        let group = test_group();
        group.set_size(1, &test_extras(dir.path())).unwrap();
        drop(_guard);

        let _guard = shell_mock::install(|line: &str| {
            if line.starts_with("multipass info") {
                MockResponse::ok(&info_json("ng-1-vm-01", "Stopped"))
            } else {
                MockResponse::empty()
            }
        });
        group.refresh();

        let members = group.members_for_snapshot();
        assert_eq!(members[0].state, NodeState::Stopped);
    }

    #[test]
    fn test_auto_discovery_rebinds_and_skips_foreign_scheme() {
        // Scenario 4: one engine-owned node at index 3 plus a control-plane
        // node with a foreign provider-ID scheme.
        let owned_id = providerid::encode_node(SERVER, "ng-1", "ng-1-vm-03");
        let node_list = format!(
            r#"{{"items": [
                {{
                    "metadata": {{
                        "name": "ng-1-vm-03",
                        "annotations": {{"node-index": "3", "auto-provisioned": "true"}}
                    }},
                    "spec": {{"providerID": "{owned_id}"}},
                    "status": {{"addresses": [{{"type": "InternalIP", "address": "10.114.21.7"}}]}}
                }},
                {{
                    "metadata": {{"name": "master-01"}},
                    "spec": {{"providerID": "k3s://master-01/object?type=node&name=master-01"}},
                    "status": {{"addresses": [{{"type": "InternalIP", "address": "10.114.21.1"}}]}}
                }}
            ]}}"#
        );

        let _guard = shell_mock::install(move |line: &str| {
            if line.starts_with("kubectl get nodes") {
                MockResponse::ok(&node_list)
            } else if line.starts_with("multipass info") {
                MockResponse::ok(&info_json("ng-1-vm-03", "Running"))
            } else {
                MockResponse::empty()
            }
        });

        let group = test_group();
        group.auto_discovery(true, "/kc").unwrap();

        assert_eq!(group.member_count(), 1);
        assert!(group.contains_member("ng-1-vm-03"));
        assert!(!group.contains_member("master-01"));
        assert!(group.last_created_index() >= 3);

        // The freshly discovered node was re-annotated and re-labeled.
        assert_eq!(shell_mock::calls_matching("scale-down-disabled=false"), 1);
        assert_eq!(shell_mock::calls_matching("group-name=ng-1"), 1);
    }

    #[test]
    fn test_auto_discovery_marks_foreign_members_read_only() {
        // A node carrying our scheme but auto-provisioned=false joins the
        // model read-only, with scale-down disabled.
        let foreign_id = providerid::encode_node(SERVER, "ng-1", "master-01");
        let node_list = format!(
            r#"{{"items": [{{
                "metadata": {{
                    "name": "master-01",
                    "annotations": {{"auto-provisioned": "false"}}
                }},
                "spec": {{"providerID": "{foreign_id}"}},
                "status": {{"addresses": [{{"type": "InternalIP", "address": "10.114.21.1"}}]}}
            }}]}}"#
        );

        let _guard = shell_mock::install(move |line: &str| {
            if line.starts_with("kubectl get nodes") {
                MockResponse::ok(&node_list)
            } else if line.starts_with("multipass info") {
                MockResponse::ok(&info_json("master-01", "Running"))
            } else {
                MockResponse::empty()
            }
        });

        let group = test_group();
        group.auto_discovery(true, "/kc").unwrap();

        let members = group.members_for_snapshot();
        assert_eq!(members.len(), 1);
        assert!(!members[0].auto_provisioned);
        assert_eq!(shell_mock::calls_matching("scale-down-disabled=true"), 1);
    }

    #[test]
    fn test_auto_discovery_reuses_known_members() {
        let owned_id = providerid::encode_node(SERVER, "ng-1", "ng-1-vm-01");
        let node_list = format!(
            r#"{{"items": [{{
                "metadata": {{"name": "ng-1-vm-01", "annotations": {{"node-index": "1"}}}},
                "spec": {{"providerID": "{owned_id}"}},
                "status": {{"addresses": [{{"type": "InternalIP", "address": "10.114.21.7"}}]}}
            }}]}}"#
        );

        let _guard = shell_mock::install(move |line: &str| {
            if line.starts_with("kubectl get nodes") {
                MockResponse::ok(&node_list)
            } else if line.starts_with("multipass info") {
                MockResponse::ok(&info_json("ng-1-vm-01", "Running"))
            } else {
                MockResponse::empty()
            }
        });

        let group = NodeGroup::restore(
            "ng-1",
            SERVER,
            MachineType::default(),
            0,
            5,
            HashMap::new(),
            HashMap::new(),
            GroupStatus::Created,
            1,
            vec![Node {
                provider_id: owned_id.clone(),
                name: "ng-1-vm-01".to_string(),
                index: 1,
                memory: 2048,
                cpu: 2,
                disk: 5120,
                addresses: Vec::new(),
                state: NodeState::Running,
                auto_provisioned: true,
            }],
        );

        group.auto_discovery(false, "/kc").unwrap();

        assert_eq!(group.member_count(), 1);
        // Known members are reattached without re-annotation.
        assert_eq!(shell_mock::calls_matching("kubectl annotate"), 0);
        let members = group.members_for_snapshot();
        assert_eq!(members[0].memory, 2048);
    }
}
