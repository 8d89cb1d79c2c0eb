//! Persisted per-container state.
//!
//! One directory per container under the configured root, holding a JSON
//! state file (replaced atomically: write to temp, rename) and a pid file
//! with the shim's pid.

use crate::error::RuntimeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const STATE_FILE: &str = "state.json";
pub const PID_FILE: &str = "pid";
pub const HYPERVISOR_PID_FILE: &str = "hypervisor.pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Created => write!(f, "created"),
            Status::Running => write!(f, "running"),
            Status::Stopped => write!(f, "stopped"),
        }
    }
}

/// Boot asset paths a container's VM was launched with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypervisorAssets {
    pub hypervisor_path: PathBuf,
    pub kernel_path: PathBuf,
    pub image_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    /// The shim's pid; what the engine sees as the container init.
    pub pid: i32,
    pub status: Status,
    pub bundle: PathBuf,
    pub rootfs: PathBuf,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Uid owning the rootfs directory.
    pub owner: u32,
    pub vm_token: String,
    pub sequences: Vec<u64>,
    pub hypervisor: HypervisorAssets,
}

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.container_dir(id).join(STATE_FILE).exists()
    }

    /// Claim the container directory. Creation is atomic, so of two racing
    /// `create` invocations exactly one wins.
    pub async fn claim(&self, id: &str) -> Result<PathBuf, RuntimeError> {
        fs::create_dir_all(&self.root).await?;
        let dir = self.container_dir(id);
        match fs::create_dir(&dir).await {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(
                RuntimeError::Conflict(format!("container {} already exists", id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, state: &ContainerState) -> Result<(), RuntimeError> {
        let dir = self.container_dir(&state.id);
        fs::create_dir_all(&dir).await?;

        let content = serde_json::to_vec_pretty(state)?;
        atomic_write(&dir.join(STATE_FILE), &content).await?;
        atomic_write(&dir.join(PID_FILE), state.pid.to_string().as_bytes()).await?;

        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let path = self.container_dir(id).join(STATE_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound(format!(
                    "container {} does not exist",
                    id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| RuntimeError::Internal(format!("corrupt state for {}: {}", id, e)))
    }

    pub async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let dir = self.container_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_ids(&self) -> Result<Vec<String>, RuntimeError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().join(STATE_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), RuntimeError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Which of `current`'s assets differ from the host's configured latest.
/// New containers always get the latest assets, so divergence means stale.
pub fn stale_assets(current: &HypervisorAssets, latest: &HypervisorAssets) -> Vec<&'static str> {
    let mut stale = Vec::new();
    if current.kernel_path != latest.kernel_path {
        stale.push("kernel");
    }
    if current.image_path != latest.image_path {
        stale.push("image");
    }
    stale
}

/// Liveness probe: signal 0 checks existence without delivering anything.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Uid owning `dir`; the container's recorded owner.
pub fn dir_owner(dir: &Path) -> Result<u32, RuntimeError> {
    let st = nix::sys::stat::stat(dir)
        .map_err(|e| RuntimeError::Internal(format!("stat {}: {}", dir.display(), e)))?;
    Ok(st.st_uid)
}
