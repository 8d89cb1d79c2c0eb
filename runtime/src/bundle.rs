//! Minimal OCI bundle loading: the subset of `config.json` the orchestrator
//! needs to build pod and container definitions.

use crate::error::RuntimeError;
use cradle_protocol::types::{ContainerDef, PodDef, ProcessSpec};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub process: OciProcess,
    pub root: OciRoot,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub hooks: Option<OciHooks>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: OciUser,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
}

fn default_cwd() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciUser {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OciRoot {
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciHooks {
    #[serde(default)]
    pub prestart: Vec<OciHook>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OciHook {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub path: PathBuf,
    pub spec: OciSpec,
}

impl Bundle {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref().to_path_buf();
        let config_path = path.join(CONFIG_FILE);
        let content = fs::read_to_string(&config_path).await.map_err(|e| {
            RuntimeError::BadRequest(format!(
                "cannot read bundle config {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let spec: OciSpec = serde_json::from_str(&content).map_err(|e| {
            RuntimeError::BadRequest(format!("malformed bundle config: {}", e))
        })?;
        if spec.process.args.is_empty() {
            return Err(RuntimeError::BadRequest(
                "bundle process has no args".to_string(),
            ));
        }
        Ok(Self { path, spec })
    }

    /// Rootfs path; relative roots resolve against the bundle directory.
    pub fn rootfs(&self) -> PathBuf {
        if self.spec.root.path.is_absolute() {
            self.spec.root.path.clone()
        } else {
            self.path.join(&self.spec.root.path)
        }
    }

    pub fn process_spec(&self) -> ProcessSpec {
        let p = &self.spec.process;
        ProcessSpec {
            terminal: p.terminal,
            user: p.user.uid.to_string(),
            group: p.user.gid.to_string(),
            args: p.args.clone(),
            env: p.env.clone(),
            workdir: p.cwd.clone(),
        }
    }

    pub fn pod_def(&self, id: &str, share_dir: &Path) -> PodDef {
        PodDef {
            hostname: self
                .spec
                .hostname
                .clone()
                .unwrap_or_else(|| id.to_string()),
            share_dir: share_dir.to_string_lossy().to_string(),
            dns: Vec::new(),
            whitelist: Vec::new(),
            containers: Vec::new(),
        }
    }

    pub fn container_def(&self, id: &str) -> ContainerDef {
        ContainerDef {
            id: id.to_string(),
            rootfs: self.rootfs().to_string_lossy().to_string(),
            fstype: "9p".to_string(),
            image: String::new(),
            volumes: Vec::new(),
            process: self.process_spec(),
            restart_policy: "never".to_string(),
            initialize: false,
        }
    }

    pub fn prestart_hooks(&self) -> &[OciHook] {
        self.spec
            .hooks
            .as_ref()
            .map(|h| h.prestart.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "ociVersion": "1.0.2",
        "process": {"args": ["/bin/true"], "cwd": "/", "env": ["PATH=/bin"]},
        "root": {"path": "rootfs"},
        "hostname": "box",
        "annotations": {"a": "b"}
    }"#;

    async fn write_bundle(dir: &Path, config: &str) {
        std::fs::create_dir_all(dir.join("rootfs")).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), config).unwrap();
    }

    #[tokio::test]
    async fn test_load_minimal_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), MINIMAL).await;

        let bundle = Bundle::load(dir.path()).await.unwrap();
        assert_eq!(bundle.spec.process.args, vec!["/bin/true"]);
        assert_eq!(bundle.rootfs(), dir.path().join("rootfs"));
        assert_eq!(bundle.spec.hostname.as_deref(), Some("box"));
    }

    #[tokio::test]
    async fn test_missing_config_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Bundle::load(dir.path()).await,
            Err(RuntimeError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_config_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "{not json").await;
        assert!(matches!(
            Bundle::load(dir.path()).await,
            Err(RuntimeError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_args_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            r#"{"ociVersion": "1.0.2", "process": {"args": []}, "root": {"path": "rootfs"}}"#,
        )
        .await;
        assert!(matches!(
            Bundle::load(dir.path()).await,
            Err(RuntimeError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_container_def_carries_process() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), MINIMAL).await;

        let bundle = Bundle::load(dir.path()).await.unwrap();
        let def = bundle.container_def("c1");
        assert_eq!(def.id, "c1");
        assert_eq!(def.fstype, "9p");
        assert_eq!(def.process.args, vec!["/bin/true"]);
        assert_eq!(def.process.env, vec!["PATH=/bin"]);

        let pod = bundle.pod_def("c1", Path::new("/run/share"));
        assert_eq!(pod.hostname, "box");
    }
}
