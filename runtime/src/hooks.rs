//! OCI lifecycle hook execution.
//!
//! Hooks get the container state JSON on stdin, runc-style. A hook that
//! exits non-zero (or overruns its timeout) aborts `create` with a full
//! rollback.

use crate::bundle::OciHook;
use crate::error::RuntimeError;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HookState<'a> {
    oci_version: &'a str,
    id: &'a str,
    pid: i32,
    bundle: &'a Path,
}

pub async fn run_prestart(
    hooks: &[OciHook],
    container_id: &str,
    bundle: &Path,
    shim_pid: i32,
) -> Result<(), RuntimeError> {
    let state = serde_json::to_vec(&HookState {
        oci_version: crate::config::OCI_VERSION,
        id: container_id,
        pid: shim_pid,
        bundle,
    })?;

    for hook in hooks {
        tracing::debug!(path = %hook.path.display(), "running prestart hook");

        let mut cmd = Command::new(&hook.path);
        // args[0] is the hook's argv[0] by OCI convention.
        if hook.args.len() > 1 {
            cmd.args(&hook.args[1..]);
        }
        for env in &hook.env {
            if let Some((key, value)) = env.split_once('=') {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::Hook(format!("cannot spawn hook {}: {}", hook.path.display(), e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&state).await;
        }

        let status = match hook.timeout {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(RuntimeError::Hook(format!(
                            "hook {} timed out after {}s",
                            hook.path.display(),
                            secs
                        )));
                    }
                }
            }
            None => child.wait().await?,
        };

        if !status.success() {
            return Err(RuntimeError::Hook(format!(
                "hook {} exited with {}",
                hook.path.display(),
                status.code().unwrap_or(-1)
            )));
        }
    }

    Ok(())
}
