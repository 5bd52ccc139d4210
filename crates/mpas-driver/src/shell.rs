use std::process::{Command, Output};

use anyhow::{Context, Result};
use tracing::debug;

/// Run a command on the host, capturing output.
fn output(cmd: &str, args: &[&str]) -> Result<Output> {
    #[cfg(any(test, feature = "mock-shell"))]
    if let Some(out) = super::shell_mock::intercept(cmd, args) {
        return Ok(out);
    }

    debug!(cmd, args = ?args, "shell");

    Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))
}

/// Run a command and return trimmed stdout.
///
/// A non-zero exit yields an error carrying the exit code and trimmed stderr,
/// so callers can embed the tool's own diagnostic in their reply.
pub fn pipe(cmd: &str, args: &[&str]) -> Result<String> {
    let out = output(cmd, args)?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        anyhow::bail!(
            "{} exited with {}: {}",
            cmd,
            out.status.code().unwrap_or(-1),
            stderr
        );
    }

    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Run a command for its side effect only.
pub fn run(cmd: &str, args: &[&str]) -> Result<()> {
    pipe(cmd, args).map(|_| ())
}
