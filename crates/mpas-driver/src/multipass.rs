//! Façade over the `multipass` host tool.
//!
//! Every operation forks one subprocess and normalizes its result; no state
//! is kept here. Errors are typed so the engine can classify them in reply
//! envelopes.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use mpas_core::errors::EngineError;
use mpas_core::state::NodeState;

use super::shell;

/// Parsed `multipass info <name> --format=json` document.
#[derive(Debug, Default, Deserialize)]
pub struct VmInfoDocument {
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
    #[serde(default)]
    pub info: HashMap<String, VmInfo>,
}

/// Per-VM section of the info document. Only the fields the engine reads are
/// typed; the rest of the payload is ignored.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct VmInfo {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub release: String,
}

/// Observed VM status: normalized state plus reported IPv4 addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatus {
    pub state: NodeState,
    pub ipv4: Vec<String>,
}

/// Launch a new VM and wait for the tool to report it started.
pub fn launch(
    name: &str,
    mem_mb: i32,
    cpus: i32,
    disk_mb: i32,
    cloud_init: Option<&Path>,
    image: &str,
) -> Result<(), EngineError> {
    let mut args = vec![
        "launch".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];

    if mem_mb > 0 {
        args.push(format!("--mem={mem_mb}M"));
    }
    if cpus > 0 {
        args.push(format!("--cpus={cpus}"));
    }
    if disk_mb > 0 {
        args.push(format!("--disk={disk_mb}M"));
    }
    if let Some(path) = cloud_init {
        args.push(format!("--cloud-init={}", path.display()));
    }
    if !image.is_empty() {
        args.push(image.to_string());
    }

    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    shell::run("multipass", &refs).map_err(|e| EngineError::VMLaunchFailed {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Mount a host path into the guest. Failures are reported for the caller to
/// log; a missing mount does not abort a bring-up.
pub fn mount(host_path: &str, name: &str, guest_path: &str) -> anyhow::Result<()> {
    shell::run(
        "multipass",
        &["mount", host_path, &format!("{name}:{guest_path}")],
    )
}

/// Query a VM's state and addresses.
pub fn info(name: &str) -> Result<VmStatus, EngineError> {
    let info_failed = |reason: String| EngineError::VMInfoFailed {
        name: name.to_string(),
        reason,
    };

    let out = shell::pipe("multipass", &["info", name, "--format=json"])
        .map_err(|e| info_failed(e.to_string()))?;

    let doc: VmInfoDocument =
        serde_json::from_str(&out).map_err(|e| info_failed(e.to_string()))?;

    let vm = doc
        .info
        .get(name)
        .ok_or_else(|| EngineError::VMNotFound(name.to_string()))?;

    Ok(VmStatus {
        state: NodeState::from_tool_state(&vm.state),
        ipv4: vm.ipv4.clone(),
    })
}

/// Start a stopped VM.
pub fn start(name: &str) -> Result<(), EngineError> {
    shell::run("multipass", &["start", name]).map_err(|e| EngineError::VMStartFailed {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Stop a running VM.
pub fn stop(name: &str) -> Result<(), EngineError> {
    shell::run("multipass", &["stop", name]).map_err(|e| EngineError::VMStopFailed {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Delete a VM and purge its storage.
pub fn delete_purge(name: &str) -> Result<(), EngineError> {
    shell::run("multipass", &["delete", "--purge", name]).map_err(|e| {
        EngineError::VMDeleteFailed {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Run a command inside the guest as the privileged user.
pub fn exec(name: &str, args: &[&str]) -> anyhow::Result<()> {
    let mut argv = vec!["exec", name, "--", "sudo"];
    argv.extend_from_slice(args);
    shell::run("multipass", &argv)
}

/// Copy a host file into the guest.
pub fn copy_files(host_path: &str, target: &str) -> anyhow::Result<()> {
    shell::run("multipass", &["copy-files", host_path, target])
}

/// Execute a script body inside the guest.
///
/// The body lands in `<cache_dir>/set-kubelet-default-<name>.sh`, is copied
/// to the guest's /tmp and run with bash under sudo. The host copy is removed
/// on every exit path.
pub fn exec_script(name: &str, body: &str, cache_dir: &Path) -> Result<(), EngineError> {
    let kubelet_failed = |reason: String| EngineError::KubeletNotConfigured {
        name: name.to_string(),
        reason,
    };

    let file_name = format!("set-kubelet-default-{name}.sh");
    let host_path = cache_dir.join(&file_name);
    let guest_path = format!("/tmp/{file_name}");

    std::fs::write(&host_path, body).map_err(|e| kubelet_failed(e.to_string()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o755));
    }

    let result = copy_files(&host_path.display().to_string(), &format!("{name}:{guest_path}"))
        .and_then(|_| exec(name, &["bash", &guest_path]));

    let _ = std::fs::remove_file(&host_path);

    result.map_err(|e| kubelet_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock::{self, MockResponse};

    fn info_json(name: &str, state: &str, ips: &[&str]) -> String {
        let ips = ips
            .iter()
            .map(|ip| format!("\"{ip}\""))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{"errors": [], "info": {{"{name}": {{"state": "{state}", "ipv4": [{ips}], "release": "20.04 LTS"}}}}}}"#
        )
    }

    #[test]
    fn test_launch_builds_full_argv() {
        let _guard = shell_mock::install(|_| MockResponse::empty());
        launch(
            "ng-1-vm-01",
            4096,
            4,
            10240,
            Some(Path::new("/tmp/ci.yaml")),
            "bionic",
        )
        .unwrap();

        let calls = shell_mock::recorded_calls();
        assert_eq!(
            calls[0],
            "multipass launch --name ng-1-vm-01 --mem=4096M --cpus=4 --disk=10240M --cloud-init=/tmp/ci.yaml bionic"
        );
    }

    #[test]
    fn test_launch_omits_zero_resources_and_empty_image() {
        let _guard = shell_mock::install(|_| MockResponse::empty());
        launch("vm", 0, 0, 0, None, "").unwrap();
        assert_eq!(
            shell_mock::recorded_calls()[0],
            "multipass launch --name vm"
        );
    }

    #[test]
    fn test_launch_failure_is_typed() {
        let _guard = shell_mock::install(|_| MockResponse::fail("image not found"));
        let err = launch("vm", 0, 0, 0, None, "").unwrap_err();
        match err {
            EngineError::VMLaunchFailed { name, reason } => {
                assert_eq!(name, "vm");
                assert!(reason.contains("image not found"));
            }
            other => panic!("Expected VMLaunchFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_info_parses_state_and_addresses() {
        let _guard = shell_mock::install(|_| {
            MockResponse::ok(&info_json("vm-01", "Running", &["10.114.21.7"]))
        });
        let status = info("vm-01").unwrap();
        assert_eq!(status.state, NodeState::Running);
        assert_eq!(status.ipv4, vec!["10.114.21.7".to_string()]);
    }

    #[test]
    fn test_info_normalizes_unknown_state() {
        let _guard =
            shell_mock::install(|_| MockResponse::ok(&info_json("vm-01", "Suspending", &[])));
        assert_eq!(info("vm-01").unwrap().state, NodeState::Undefined);
    }

    #[test]
    fn test_info_missing_name_is_not_found() {
        let _guard =
            shell_mock::install(|_| MockResponse::ok(&info_json("other-vm", "Running", &[])));
        assert!(matches!(info("vm-01"), Err(EngineError::VMNotFound(_))));
    }

    #[test]
    fn test_info_tool_failure() {
        let _guard = shell_mock::install(|_| MockResponse::fail("instance does not exist"));
        assert!(matches!(
            info("vm-01"),
            Err(EngineError::VMInfoFailed { .. })
        ));
    }

    #[test]
    fn test_info_parse_failure() {
        let _guard = shell_mock::install(|_| MockResponse::ok("not json"));
        assert!(matches!(
            info("vm-01"),
            Err(EngineError::VMInfoFailed { .. })
        ));
    }

    #[test]
    fn test_stop_and_delete_argv() {
        let _guard = shell_mock::install(|_| MockResponse::empty());
        stop("vm-01").unwrap();
        delete_purge("vm-01").unwrap();
        let calls = shell_mock::recorded_calls();
        assert_eq!(calls[0], "multipass stop vm-01");
        assert_eq!(calls[1], "multipass delete --purge vm-01");
    }

    #[test]
    fn test_exec_runs_under_sudo() {
        let _guard = shell_mock::install(|_| MockResponse::empty());
        exec("vm-01", &["kubeadm", "join", "10.0.0.1:6443"]).unwrap();
        assert_eq!(
            shell_mock::recorded_calls()[0],
            "multipass exec vm-01 -- sudo kubeadm join 10.0.0.1:6443"
        );
    }

    #[test]
    fn test_exec_script_copies_runs_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(|_| MockResponse::empty());

        exec_script("vm-01", "#!/bin/bash\ntrue\n", dir.path()).unwrap();

        let calls = shell_mock::recorded_calls();
        assert!(calls[0].starts_with("multipass copy-files"));
        assert!(calls[0].ends_with("vm-01:/tmp/set-kubelet-default-vm-01.sh"));
        assert_eq!(
            calls[1],
            "multipass exec vm-01 -- sudo bash /tmp/set-kubelet-default-vm-01.sh"
        );
        assert!(!dir.path().join("set-kubelet-default-vm-01.sh").exists());
    }

    #[test]
    fn test_exec_script_cleans_up_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = shell_mock::install(|_| MockResponse::fail("copy failed"));

        let err = exec_script("vm-01", "true", dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::KubeletNotConfigured { .. }));
        assert!(!dir.path().join("set-kubelet-default-vm-01.sh").exists());
    }
}
