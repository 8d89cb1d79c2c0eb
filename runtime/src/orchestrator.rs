//! The per-invocation command processor: sequences namespace setup, shim
//! spawn, VM boot, agent handshake and shim release for each OCI verb, and
//! unwinds in reverse order when a step fails.

use crate::bundle::Bundle;
use crate::config::{RuntimeConfig, OCI_VERSION};
use crate::error::RuntimeError;
use crate::hypervisor::{self, HypervisorHandle};
use crate::netns::{self, NetworkNamespace};
use crate::shim::{self, ShimHandle};
use crate::state::{
    dir_owner, pid_alive, stale_assets, ContainerState, HypervisorAssets, StateStore, Status,
    HYPERVISOR_PID_FILE,
};
use crate::hooks;
use chrono::Utc;
use cradle_protocol::control::Opcode;
use cradle_protocol::types::{ExecDef, KillDef, ProcessSpec};
use cradle_protocol::{ProtocolError, ProxyClient};
use serde::Serialize;
use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// A `list` row: the persisted record joined with current/latest asset
/// details.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullContainerState {
    #[serde(flatten)]
    pub state: ContainerState,
    pub current_hypervisor: HypervisorAssets,
    pub latest_hypervisor: HypervisorAssets,
    pub stale_assets: Vec<String>,
}

pub struct Orchestrator {
    config: RuntimeConfig,
    store: StateStore,
}

/// Resources acquired so far during `create`, torn down in reverse order
/// when a later step fails.
#[derive(Default)]
struct CreateCleanup {
    client: Option<ProxyClient>,
    pod_started: bool,
    hypervisor: Option<HypervisorHandle>,
    netns: Option<NetworkNamespace>,
    shim: Option<ShimHandle>,
}

impl CreateCleanup {
    async fn run(mut self, store: &StateStore, id: &str) {
        tracing::warn!(container = id, "create failed, rolling back");
        if let Some(mut client) = self.client.take() {
            if self.pod_started {
                if let Err(e) = client.hyper(Opcode::DestroyPod, &serde_json::json!({})).await {
                    tracing::warn!(error = %e, "rollback DestroyPod failed");
                }
            }
            if let Err(e) = client.bye().await {
                tracing::warn!(error = %e, "rollback Bye failed");
            }
        }
        if let Some(hv) = self.hypervisor.take() {
            hv.kill().await;
        }
        if let Some(ns) = self.netns.take() {
            if let Err(e) = ns.destroy().await {
                tracing::warn!(error = %e, "rollback netns teardown failed");
            }
        }
        if let Some(shim) = self.shim.take() {
            shim.abort().await;
        }
        if let Err(e) = store.remove(id).await {
            tracing::warn!(error = %e, "rollback state removal failed");
        }
    }
}

impl Orchestrator {
    pub fn new(config: RuntimeConfig) -> Self {
        let store = StateStore::new(config.root.clone());
        Self { config, store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    async fn connect(&self) -> Result<ProxyClient, RuntimeError> {
        ProxyClient::connect(&self.config.proxy_sock)
            .await
            .map_err(|e| {
                RuntimeError::ChannelClosed(format!(
                    "cannot reach proxy at {}: {}",
                    self.config.proxy_sock.display(),
                    e
                ))
            })
    }

    async fn attach(&self, token: &str) -> Result<ProxyClient, RuntimeError> {
        let mut client = self.connect().await?;
        client.attach(token).await?;
        Ok(client)
    }

    fn latest_assets(&self) -> HypervisorAssets {
        HypervisorAssets {
            hypervisor_path: self.config.hypervisor_path.clone(),
            kernel_path: self.config.kernel_path.clone(),
            image_path: self.config.image_path.clone(),
        }
    }

    // ------------------------------------------------------------------
    // create
    // ------------------------------------------------------------------

    pub async fn create(&self, id: &str, bundle_path: &Path) -> Result<(), RuntimeError> {
        validate_id(id)?;
        let bundle = Bundle::load(bundle_path).await?;

        // Directory creation is the atomic claim on the id; the loser of a
        // race fails here with zero side effects on the winner's VM.
        let dir = self.store.claim(id).await?;

        let mut cleanup = CreateCleanup::default();
        match self.create_inner(id, &bundle, &dir, &mut cleanup).await {
            Ok(()) => Ok(()),
            Err(e) => {
                cleanup.run(&self.store, id).await;
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        id: &str,
        bundle: &Bundle,
        dir: &Path,
        cleanup: &mut CreateCleanup,
    ) -> Result<(), RuntimeError> {
        let token = Uuid::new_v4().to_string();

        // Host-side namespaces; everything else lives inside the VM.
        cleanup.netns = Some(NetworkNamespace::create(id).await?);

        // Shim first, paused: hooks want the init pid, and the engine is
        // already watching our child as the container process.
        let proceed = shim::proceed_path(dir);
        shim::make_proceed_fifo(&proceed)?;
        let shim_handle = shim::spawn_paused(
            &self.config,
            &token,
            id,
            &proceed,
            &dir.join(shim::SHIM_LOG),
        )
        .await?;
        let shim_pid = shim_handle.pid;
        cleanup.shim = Some(shim_handle);

        hooks::run_prestart(bundle.prestart_hooks(), id, &bundle.path, shim_pid).await?;

        cleanup
            .netns
            .as_ref()
            .expect("netns created above")
            .bridge_taps(self.config.network_helper.as_deref())
            .await?;

        let rootfs = bundle.rootfs();
        let hv = hypervisor::launch(
            &self.config,
            &token,
            &dir.join("vm"),
            &rootfs,
            cleanup.netns.as_ref().map(|ns| ns.name.as_str()),
        )
        .await?;
        tokio::fs::write(dir.join(HYPERVISOR_PID_FILE), hv.pid.to_string())
            .await
            .map_err(RuntimeError::from)?;
        let ctl_path = hv.ctl_path.to_string_lossy().to_string();
        let io_path = hv.io_path.to_string_lossy().to_string();
        cleanup.hypervisor = Some(hv);

        let mut client = self.connect().await?;
        client.hello(&token, &ctl_path, &io_path).await?;
        cleanup.client = Some(client);
        let client = cleanup.client.as_mut().expect("client stored above");

        wait_ready(client, self.config.ready_timeout).await?;

        client
            .hyper(Opcode::StartPod, &bundle.pod_def(id, &rootfs))
            .await?;
        cleanup.pod_started = true;

        let (seqs, stream_fd) = client.allocate_io(2).await?;
        cleanup
            .shim
            .as_ref()
            .expect("shim spawned above")
            .send_handoff(&seqs, stream_fd.as_raw_fd())?;
        drop(stream_fd);

        let state = ContainerState {
            oci_version: OCI_VERSION.to_string(),
            id: id.to_string(),
            pid: shim_pid,
            status: Status::Created,
            bundle: bundle.path.clone(),
            rootfs: rootfs.clone(),
            created: Utc::now(),
            annotations: bundle.spec.annotations.clone(),
            owner: dir_owner(&rootfs)?,
            vm_token: token,
            sequences: seqs,
            hypervisor: self.latest_assets(),
        };
        self.store.save(&state).await?;

        // The shim (and the VM behind it) outlive this invocation. The
        // session just disconnects, no Bye: the registration must survive.
        cleanup.shim = None;
        cleanup.hypervisor = None;
        cleanup.netns = None;
        cleanup.client = None;

        tracing::info!(container = id, pid = shim_pid, "container created");
        Ok(())
    }

    // ------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------

    pub async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.store.load(id).await?;
        if state.status != Status::Created {
            return Err(RuntimeError::PreconditionFailed(format!(
                "cannot start container in state {}",
                state.status
            )));
        }

        let bundle = Bundle::load(&state.bundle).await?;
        let mut client = self.attach(&state.vm_token).await?;
        client
            .hyper(Opcode::NewContainer, &bundle.container_def(id))
            .await?;

        shim::release(&shim::proceed_path(&self.store.container_dir(id)))?;

        state.status = Status::Running;
        self.store.save(&state).await?;
        tracing::info!(container = id, "container started");
        Ok(())
    }

    // ------------------------------------------------------------------
    // exec
    // ------------------------------------------------------------------

    /// Run an auxiliary process in the container's pod: a second shim,
    /// a second pair of sequences, no new namespaces or networking. Waits
    /// for the process and returns its exit status.
    pub async fn exec(&self, id: &str, process: ProcessSpec) -> Result<i32, RuntimeError> {
        let state = self.store.load(id).await?;
        if state.status != Status::Running {
            return Err(RuntimeError::PreconditionFailed(format!(
                "cannot exec in container in state {}",
                state.status
            )));
        }

        let mut client = self.attach(&state.vm_token).await?;
        let (seqs, stream_fd) = client.allocate_io(2).await?;

        let exec_id = format!("{}-exec-{}", id, &Uuid::new_v4().to_string()[..8]);
        let dir = self.store.container_dir(id);
        let proceed = dir.join(format!("{}.proceed", exec_id));
        shim::make_proceed_fifo(&proceed)?;

        let shim_handle = match shim::spawn_paused(
            &self.config,
            &state.vm_token,
            &exec_id,
            &proceed,
            &dir.join(shim::SHIM_LOG),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = tokio::fs::remove_file(&proceed).await;
                return Err(e);
            }
        };

        let setup = async {
            shim_handle.send_handoff(&seqs, stream_fd.as_raw_fd())?;
            client
                .hyper(
                    Opcode::ExecCmd,
                    &ExecDef {
                        container: id.to_string(),
                        id: exec_id.clone(),
                        process,
                    },
                )
                .await?;
            shim::release(&proceed)?;
            Ok::<(), RuntimeError>(())
        }
        .await;

        let _ = tokio::fs::remove_file(&proceed).await;
        drop(stream_fd);
        if let Err(e) = setup {
            shim_handle.abort().await;
            return Err(e);
        }

        let code = shim_handle.wait().await?;
        tracing::info!(container = id, exec = %exec_id, code, "exec finished");
        Ok(code)
    }

    // ------------------------------------------------------------------
    // kill
    // ------------------------------------------------------------------

    pub async fn kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        let signum = parse_signal(signal)?;
        let state = self.store.load(id).await?;
        if state.status == Status::Stopped {
            return Err(RuntimeError::PreconditionFailed(
                "container is stopped".to_string(),
            ));
        }

        if signum == libc::SIGKILL || signum == libc::SIGSTOP {
            // The shim cannot catch these; go through the proxy directly.
            let mut client = self.attach(&state.vm_token).await?;
            client
                .hyper(
                    Opcode::KillContainer,
                    &KillDef {
                        container: id.to_string(),
                        signal: signum as u32,
                    },
                )
                .await?;
        } else {
            // The shim's handler forwards the signal into the guest.
            let target = nix::unistd::Pid::from_raw(state.pid);
            match nix::sys::signal::kill(target, nix::sys::signal::Signal::try_from(signum)
                .map_err(|_| RuntimeError::BadRequest(format!("invalid signal {}", signum)))?)
            {
                Ok(()) => {}
                Err(nix::errno::Errno::ESRCH) => {
                    tracing::debug!(container = id, pid = state.pid, "shim already gone");
                }
                Err(e) => return Err(RuntimeError::Internal(format!("kill failed: {}", e))),
            }
        }

        // No waiting here; status transitions happen when delete or state
        // observes the process is gone.
        Ok(())
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    /// Failures past this point are logged, not returned: the user asked
    /// for removal, so state goes away even if resources leak.
    pub async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        let state = self.store.load(id).await?;
        let dir = self.store.container_dir(id);

        if state.status == Status::Running && pid_alive(state.pid) {
            if let Err(e) = self.kill(id, "TERM").await {
                tracing::warn!(error = %e, "delete: TERM failed");
            }
            if !wait_pid_gone(state.pid, self.config.delete_timeout).await {
                tracing::warn!(container = id, "graceful stop timed out, forcing");
                match self.attach(&state.vm_token).await {
                    Ok(mut client) => {
                        if let Err(e) = client
                            .hyper(
                                Opcode::KillContainer,
                                &KillDef {
                                    container: id.to_string(),
                                    signal: libc::SIGKILL as u32,
                                },
                            )
                            .await
                        {
                            tracing::warn!(error = %e, "delete: forced kill failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "delete: cannot reach proxy"),
                }
                if !wait_pid_gone(state.pid, Duration::from_secs(2)).await {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(state.pid),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
            }
        }

        // Destroy the pod and release the VM; this was its only container.
        match self.attach(&state.vm_token).await {
            Ok(mut client) => {
                if let Err(e) = client.hyper(Opcode::DestroyPod, &serde_json::json!({})).await {
                    tracing::warn!(error = %e, "delete: DestroyPod failed");
                }
                if let Err(e) = client.bye().await {
                    tracing::warn!(error = %e, "delete: Bye failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "delete: cannot reach proxy"),
        }

        if let Ok(content) = tokio::fs::read_to_string(dir.join(HYPERVISOR_PID_FILE)).await {
            if let Ok(pid) = content.trim().parse::<i32>() {
                hypervisor::stop_pid(pid, self.config.delete_timeout).await;
            }
        }

        if let Err(e) = netns::destroy_for(id).await {
            tracing::warn!(error = %e, "delete: netns teardown failed");
        }

        // A shim that never left its pause (container created but not
        // started) has nothing left to wait for.
        if pid_alive(state.pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(state.pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }

        self.store.remove(id).await?;
        tracing::info!(container = id, "container deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // state / list
    // ------------------------------------------------------------------

    pub async fn state(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let mut state = self.store.load(id).await?;
        // The shim lives exactly as long as the container's init; a dead
        // shim means the container stopped behind our back.
        if state.status == Status::Running && !pid_alive(state.pid) {
            state.status = Status::Stopped;
            self.store.save(&state).await?;
        }
        Ok(state)
    }

    pub async fn list(&self) -> Result<Vec<FullContainerState>, RuntimeError> {
        let latest = self.latest_assets();

        // Read-only join with the proxy's view; a missing proxy is fine.
        let registered: Option<HashSet<String>> = match self.connect().await {
            Ok(mut client) => client
                .status()
                .await
                .ok()
                .map(|s| s.vms.into_iter().map(|vm| vm.token).collect()),
            Err(_) => None,
        };

        let mut rows = Vec::new();
        for id in self.store.list_ids().await? {
            let mut state = match self.store.load(&id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(container = %id, error = %e, "skipping unreadable record");
                    continue;
                }
            };

            if state.status == Status::Running {
                let vm_gone = registered
                    .as_ref()
                    .map(|tokens| !tokens.contains(&state.vm_token))
                    .unwrap_or(false);
                if vm_gone || !pid_alive(state.pid) {
                    state.status = Status::Stopped;
                }
            }

            let stale = stale_assets(&state.hypervisor, &latest)
                .into_iter()
                .map(String::from)
                .collect();
            rows.push(FullContainerState {
                current_hypervisor: state.hypervisor.clone(),
                latest_hypervisor: latest.clone(),
                stale_assets: stale,
                state,
            });
        }
        Ok(rows)
    }
}

async fn wait_ready(client: &mut ProxyClient, timeout: Duration) -> Result<(), RuntimeError> {
    let wait = async {
        loop {
            let notif = client.next_notification().await?;
            if notif.opcode == Opcode::Ready {
                return Ok::<(), ProtocolError>(());
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(RuntimeError::Timeout(
            "agent never announced ready".to_string(),
        )),
    }
}

async fn wait_pid_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

fn validate_id(id: &str) -> Result<(), RuntimeError> {
    if id.is_empty() {
        return Err(RuntimeError::BadRequest("container id is empty".to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(RuntimeError::BadRequest(format!(
            "container id {} contains invalid characters",
            id
        )));
    }
    Ok(())
}

/// Accepts `TERM`, `SIGTERM` and plain numbers.
pub fn parse_signal(signal: &str) -> Result<i32, RuntimeError> {
    if let Ok(n) = signal.parse::<i32>() {
        if (1..=31).contains(&n) {
            return Ok(n);
        }
        return Err(RuntimeError::BadRequest(format!(
            "signal number {} out of range",
            n
        )));
    }

    let name = signal.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let n = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ILL" => libc::SIGILL,
        "TRAP" => libc::SIGTRAP,
        "ABRT" => libc::SIGABRT,
        "BUS" => libc::SIGBUS,
        "FPE" => libc::SIGFPE,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "SEGV" => libc::SIGSEGV,
        "USR2" => libc::SIGUSR2,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        "URG" => libc::SIGURG,
        "XCPU" => libc::SIGXCPU,
        "XFSZ" => libc::SIGXFSZ,
        "VTALRM" => libc::SIGVTALRM,
        "PROF" => libc::SIGPROF,
        "WINCH" => libc::SIGWINCH,
        "IO" => libc::SIGIO,
        "SYS" => libc::SIGSYS,
        _ => {
            return Err(RuntimeError::BadRequest(format!(
                "unknown signal {}",
                signal
            )))
        }
    };
    Ok(n)
}
