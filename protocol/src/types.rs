//! JSON bodies carried by control messages.
//!
//! The agent-facing types are a versioned compatibility contract with the
//! guest; field names follow the agent's camelCase JSON.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Agent payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDef {
    pub hostname: String,
    pub share_dir: String,
    #[serde(default)]
    pub dns: Vec<String>,
    /// Routes/CIDRs the guest is allowed to reach.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// The agent's pod structure allows several containers; the proxy
    /// rejects more than one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDef {
    pub id: String,
    pub rootfs: String,
    pub fstype: String,
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<VolumeDef>,
    pub process: ProcessSpec,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    #[serde(default)]
    pub initialize: bool,
}

fn default_restart_policy() -> String {
    "never".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDef {
    pub device: String,
    pub mount_point: String,
    pub fstype: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub workdir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecDef {
    pub container: String,
    /// Identifier for the spawned process; exit notifications carry it.
    pub id: String,
    pub process: ProcessSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillDef {
    pub container: String,
    pub signal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateSeqDef {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedSeqs {
    pub seqs: Vec<u64>,
}

/// Body of the `ProcessExited` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExitedInfo {
    pub container: String,
    /// Exit status as the shim reports it: the exit code for normal exits,
    /// 128 + signal number for signal deaths.
    pub status: i32,
}

/// Body of the agent `Ready` notification and `AgentError` replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentErrorBody {
    pub code: i32,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Proxy command socket payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloDef {
    pub token: String,
    pub ctl_path: String,
    pub io_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachDef {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateIoDef {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedIo {
    pub seqs: Vec<u64>,
}

/// `Hyper` wraps an agent opcode and its body for proxy-mediated delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperDef {
    pub op: u32,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Body of `Err` replies on the command socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    pub token: String,
    pub healthy: bool,
    pub containers: u32,
    pub sessions: u32,
    pub sequences: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub vms: Vec<VmStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_def_roundtrip() {
        let pod = PodDef {
            hostname: "cradle-pod".to_string(),
            share_dir: "/run/cradle/shared".to_string(),
            dns: vec!["1.1.1.1".to_string()],
            whitelist: vec![],
            containers: vec![],
        };
        let json = serde_json::to_string(&pod).unwrap();
        assert!(json.contains("shareDir"));
        assert!(!json.contains("containers"));

        let back: PodDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hostname, "cradle-pod");
        assert_eq!(back.dns.len(), 1);
    }

    #[test]
    fn test_container_def_defaults() {
        let json = r#"{
            "id": "c1",
            "rootfs": "/rootfs",
            "fstype": "9p",
            "image": "busybox",
            "process": {"args": ["/bin/true"]}
        }"#;
        let def: ContainerDef = serde_json::from_str(json).unwrap();
        assert_eq!(def.restart_policy, "never");
        assert!(!def.initialize);
        assert!(def.process.env.is_empty());
    }

    #[test]
    fn test_hyper_def_wraps_arbitrary_body() {
        let hyper = HyperDef {
            op: 0x24,
            data: serde_json::json!({"container": "c1", "signal": 15}),
        };
        let json = serde_json::to_vec(&hyper).unwrap();
        let back: HyperDef = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.op, 0x24);
        let kill: KillDef = serde_json::from_value(back.data).unwrap();
        assert_eq!(kill.signal, 15);
    }
}
