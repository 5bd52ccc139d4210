//! Façade over `kubectl` for cluster-side node administration.
//!
//! Every operation takes the admin kubeconfig path explicitly; nothing is
//! cached between calls. Whether a failure is fatal is the caller's policy:
//! bring-up treats these as hard errors, teardown logs and proceeds.

use std::time::Duration;

use tracing::info;

use mpas_core::errors::EngineError;
use mpas_core::kube::{KubeNode, KubeNodeList};

use super::shell;

/// `wait_ready` polls the Ready condition up to this many times.
pub const READY_POLLS: u32 = 12;
/// Delay between Ready polls. 12 × 5s bounds the wait at one minute.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn api_call(e: anyhow::Error) -> EngineError {
    EngineError::KubeCall(e.to_string())
}

/// List every node in the cluster.
pub fn list_nodes(kubeconfig: &str) -> Result<KubeNodeList, EngineError> {
    let out = shell::pipe(
        "kubectl",
        &[
            "get",
            "nodes",
            "--output",
            "json",
            "--kubeconfig",
            kubeconfig,
        ],
    )
    .map_err(api_call)?;

    serde_json::from_str(&out).map_err(|e| EngineError::NodeParse(e.to_string()))
}

/// Fetch a single node document.
pub fn get_node(name: &str, kubeconfig: &str) -> Result<KubeNode, EngineError> {
    let out = shell::pipe(
        "kubectl",
        &[
            "get",
            "nodes",
            name,
            "--output",
            "json",
            "--kubeconfig",
            kubeconfig,
        ],
    )
    .map_err(api_call)?;

    serde_json::from_str(&out).map_err(|e| EngineError::NodeParse(e.to_string()))
}

fn apply_pairs(
    verb: &str,
    name: &str,
    pairs: &[(String, String)],
    kubeconfig: &str,
) -> Result<(), EngineError> {
    let mut args = vec![verb.to_string(), "nodes".to_string(), name.to_string()];
    for (k, v) in pairs {
        args.push(format!("{k}={v}"));
    }
    args.push("--overwrite".to_string());
    args.push("--kubeconfig".to_string());
    args.push(kubeconfig.to_string());

    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    shell::run("kubectl", &refs).map_err(api_call)
}

/// Annotate a node, overwriting existing values.
pub fn annotate(
    name: &str,
    pairs: &[(String, String)],
    kubeconfig: &str,
) -> Result<(), EngineError> {
    apply_pairs("annotate", name, pairs, kubeconfig)
}

/// Label a node, overwriting existing values.
pub fn label(name: &str, pairs: &[(String, String)], kubeconfig: &str) -> Result<(), EngineError> {
    apply_pairs("label", name, pairs, kubeconfig)
}

/// Mark a node unschedulable.
pub fn cordon(name: &str, kubeconfig: &str) -> Result<(), EngineError> {
    shell::run("kubectl", &["cordon", name, "--kubeconfig", kubeconfig]).map_err(api_call)
}

/// Mark a node schedulable again.
pub fn uncordon(name: &str, kubeconfig: &str) -> Result<(), EngineError> {
    shell::run("kubectl", &["uncordon", name, "--kubeconfig", kubeconfig]).map_err(api_call)
}

/// Evict all pods from a node ahead of deletion.
pub fn drain(name: &str, kubeconfig: &str) -> Result<(), EngineError> {
    shell::run(
        "kubectl",
        &[
            "drain",
            name,
            "--delete-local-data",
            "--force",
            "--ignore-daemonsets",
            "--kubeconfig",
            kubeconfig,
        ],
    )
    .map_err(api_call)
}

/// Delete the cluster node object.
pub fn delete_node(name: &str, kubeconfig: &str) -> Result<(), EngineError> {
    shell::run(
        "kubectl",
        &["delete", "node", name, "--kubeconfig", kubeconfig],
    )
    .map_err(api_call)
}

/// Poll until the node's Ready condition is True, bounded at one minute.
pub fn wait_ready(name: &str, kubeconfig: &str) -> Result<(), EngineError> {
    wait_ready_with(name, kubeconfig, READY_POLLS, READY_POLL_INTERVAL)
}

/// `wait_ready` with explicit bounds, for callers that poll differently.
pub fn wait_ready_with(
    name: &str,
    kubeconfig: &str,
    polls: u32,
    interval: Duration,
) -> Result<(), EngineError> {
    for attempt in 0..polls {
        let node = get_node(name, kubeconfig)?;

        if node.is_ready() {
            info!(node = %name, "The kubernetes node is Ready");
            return Ok(());
        }

        info!(node = %name, attempt, "The kubernetes node is not ready");
        std::thread::sleep(interval);
    }

    Err(EngineError::NodeNotReady(name.to_string()))
}
