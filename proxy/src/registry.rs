//! The VM registry: unique owner of per-VM state.
//!
//! Sessions and sequence numbers are plain indices (ids and integers)
//! validated against the registry on each use, so no reference cycles exist
//! between VMs, sessions and sequences.

use crate::agent::{spawn_control, ControlHandle};
use crate::error::ProxyError;
use crate::iomux::IoMux;
use cradle_protocol::control::ControlMessage;
use cradle_protocol::types::VmStatus;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

pub struct VmEntry {
    pub token: String,
    pub control: ControlHandle,
    pub io: IoMux,
    healthy: Arc<AtomicBool>,
    containers: AtomicU32,
    sessions: std::sync::Mutex<HashSet<u64>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    early_notifications: std::sync::Mutex<Option<broadcast::Receiver<ControlMessage>>>,
}

impl VmEntry {
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn containers(&self) -> u32 {
        self.containers.load(Ordering::SeqCst)
    }

    pub fn container_started(&self) {
        self.containers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn container_destroyed(&self) {
        let _ = self
            .containers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
    }

    pub fn session_count(&self) -> u32 {
        self.sessions.lock().unwrap().len() as u32
    }

    pub fn sessions_insert(&self, session: u64) {
        self.sessions.lock().unwrap().insert(session);
    }

    /// The notification subscription created before the control task began
    /// reading. Only the registering session gets it; later sessions
    /// subscribe fresh.
    pub fn take_early_notifications(&self) -> Option<broadcast::Receiver<ControlMessage>> {
        self.early_notifications.lock().unwrap().take()
    }

    pub fn track_pump(&self, tasks: Vec<JoinHandle<()>>) {
        self.tasks.lock().unwrap().extend(tasks);
    }

    fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.healthy.store(false, Ordering::SeqCst);
    }
}

pub struct VmRegistry {
    vms: Mutex<HashMap<String, Arc<VmEntry>>>,
    hyper_timeout: Duration,
}

impl VmRegistry {
    pub fn new(hyper_timeout: Duration) -> Self {
        Self {
            vms: Mutex::new(HashMap::new()),
            hyper_timeout,
        }
    }

    /// `Hello`: open both agent channels and create the registration.
    pub async fn register(
        &self,
        token: &str,
        ctl_path: &str,
        io_path: &str,
    ) -> Result<Arc<VmEntry>, ProxyError> {
        let mut vms = self.vms.lock().await;
        if vms.contains_key(token) {
            return Err(ProxyError::Conflict(token.to_string()));
        }

        let ctl_stream = UnixStream::connect(ctl_path).await?;
        let io_stream = UnixStream::connect(io_path).await?;

        let healthy = Arc::new(AtomicBool::new(true));
        let (control, ctl_task, early_rx) =
            spawn_control(token.to_string(), ctl_stream, self.hyper_timeout, healthy.clone());
        let (io, io_task) = IoMux::spawn(token.to_string(), io_stream, healthy.clone());

        let entry = Arc::new(VmEntry {
            token: token.to_string(),
            control,
            io,
            healthy,
            containers: AtomicU32::new(0),
            sessions: std::sync::Mutex::new(HashSet::new()),
            tasks: std::sync::Mutex::new(vec![ctl_task, io_task]),
            early_notifications: std::sync::Mutex::new(Some(early_rx)),
        });
        vms.insert(token.to_string(), entry.clone());

        tracing::info!(token, ctl_path, io_path, "vm registered");
        Ok(entry)
    }

    pub async fn get(&self, token: &str) -> Result<Arc<VmEntry>, ProxyError> {
        self.vms
            .lock()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownVm(token.to_string()))
    }

    /// Bind a session to a VM.
    pub async fn attach(&self, token: &str, session: u64) -> Result<Arc<VmEntry>, ProxyError> {
        let entry = self.get(token).await?;
        entry.sessions.lock().unwrap().insert(session);
        Ok(entry)
    }

    /// Drop a session's binding and subscriptions. Removes the registration
    /// when the last session detaches from a VM with no containers left (or
    /// from an unhealthy VM, whose refcount can no longer drain).
    pub async fn detach(&self, entry: &Arc<VmEntry>, session: u64) {
        entry.sessions.lock().unwrap().remove(&session);
        entry.io.release_session(session);

        let removable = entry.session_count() == 0
            && (entry.containers() == 0 || !entry.healthy());
        if removable {
            let mut vms = self.vms.lock().await;
            // Re-check under the map lock; another session may have attached.
            if entry.session_count() == 0 && (entry.containers() == 0 || !entry.healthy()) {
                if vms.remove(&entry.token).is_some() {
                    entry.shutdown();
                    tracing::info!(token = %entry.token, "vm unregistered");
                }
            }
        }
    }

    pub async fn status(&self) -> Vec<VmStatus> {
        let vms = self.vms.lock().await;
        vms.values()
            .map(|vm| VmStatus {
                token: vm.token.clone(),
                healthy: vm.healthy(),
                containers: vm.containers(),
                sessions: vm.session_count(),
                sequences: vm.io.sequence_count() as u32,
            })
            .collect()
    }
}
