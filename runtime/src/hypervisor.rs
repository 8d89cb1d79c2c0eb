//! Hypervisor lifecycle.
//!
//! The command line comes from the configured argument template; this
//! module substitutes the per-VM values, launches the process (inside the
//! container's netns when one exists) and waits for the agent channel
//! sockets to surface.

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::state::pid_alive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};

pub const CTL_SOCKET: &str = "agent-ctl.sock";
pub const IO_SOCKET: &str = "agent-io.sock";

const CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHANNEL_WAIT: Duration = Duration::from_secs(10);

pub struct HypervisorHandle {
    pub pid: i32,
    pub ctl_path: PathBuf,
    pub io_path: PathBuf,
    child: Child,
}

impl HypervisorHandle {
    /// Forcibly stop the VM and reap it. Rollback path only.
    pub async fn kill(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

pub async fn launch(
    config: &RuntimeConfig,
    token: &str,
    vm_dir: &Path,
    rootfs: &Path,
    netns: Option<&str>,
) -> Result<HypervisorHandle, RuntimeError> {
    tokio::fs::create_dir_all(vm_dir).await?;
    let ctl_path = vm_dir.join(CTL_SOCKET);
    let io_path = vm_dir.join(IO_SOCKET);

    let args: Vec<String> = config
        .hypervisor_args
        .iter()
        .map(|arg| {
            arg.replace("{token}", token)
                .replace("{ctl}", &ctl_path.to_string_lossy())
                .replace("{io}", &io_path.to_string_lossy())
                .replace("{kernel}", &config.kernel_path.to_string_lossy())
                .replace("{image}", &config.image_path.to_string_lossy())
                .replace("{rootfs}", &rootfs.to_string_lossy())
        })
        .collect();

    let mut cmd = match netns {
        // The hypervisor must see the bridged taps, so it runs inside the
        // container's namespace.
        Some(ns) => {
            let mut cmd = Command::new("ip");
            cmd.args(["netns", "exec", ns]);
            cmd.arg(&config.hypervisor_path);
            cmd
        }
        None => Command::new(&config.hypervisor_path),
    };
    cmd.args(&args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    tracing::info!(token, hypervisor = %config.hypervisor_path.display(), "launching vm");
    let mut child = cmd.spawn().map_err(|e| {
        RuntimeError::Hypervisor(format!(
            "cannot spawn {}: {}",
            config.hypervisor_path.display(),
            e
        ))
    })?;
    let pid = child.id().map(|p| p as i32).unwrap_or(-1);

    // The channel sockets appearing is the boot milestone we block on; the
    // agent-ready frame is awaited separately once the proxy attaches.
    let deadline = tokio::time::Instant::now() + CHANNEL_WAIT;
    while !(ctl_path.exists() && io_path.exists()) {
        if let Some(status) = child.try_wait()? {
            return Err(RuntimeError::Hypervisor(format!(
                "hypervisor exited during boot with {}",
                status.code().unwrap_or(-1)
            )));
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(RuntimeError::Hypervisor(
                "agent channel sockets never appeared".to_string(),
            ));
        }
        tokio::time::sleep(CHANNEL_POLL_INTERVAL).await;
    }

    Ok(HypervisorHandle {
        pid,
        ctl_path,
        io_path,
        child,
    })
}

/// Stop a hypervisor from a later invocation, where only the pid survived.
/// Polite first, then firm, then reaped by init.
pub async fn stop_pid(pid: i32, grace: Duration) {
    if !pid_alive(pid) {
        return;
    }
    let target = nix::unistd::Pid::from_raw(pid);
    let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while pid_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(CHANNEL_POLL_INTERVAL).await;
    }
    if pid_alive(pid) {
        tracing::warn!(pid, "hypervisor ignored SIGTERM, killing");
        let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGKILL);
    }
}
