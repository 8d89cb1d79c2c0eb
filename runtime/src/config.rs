//! Runtime configuration.
//!
//! Built from CLI flags over compiled defaults; loading a configuration
//! file is the engine's concern, not ours.

use std::path::PathBuf;
use std::time::Duration;

/// OCI version string recorded in persisted state.
pub const OCI_VERSION: &str = "1.0.2";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Per-container state directories live under here.
    pub root: PathBuf,
    /// Proxy command socket.
    pub proxy_sock: PathBuf,
    /// The shim binary to spawn per container.
    pub shim_path: PathBuf,

    /// Hypervisor binary and the boot assets every new VM gets.
    pub hypervisor_path: PathBuf,
    pub kernel_path: PathBuf,
    pub image_path: PathBuf,
    /// Hypervisor argument template. Building the real command line is the
    /// packaging layer's job; we substitute `{token}`, `{ctl}`, `{io}`,
    /// `{kernel}`, `{image}` and `{rootfs}` placeholders.
    pub hypervisor_args: Vec<String>,

    /// Helper invoked inside the netns to bridge veth devices to taps.
    pub network_helper: Option<PathBuf>,

    /// Per agent command.
    pub hyper_timeout: Duration,
    /// Boot until the agent announces itself.
    pub ready_timeout: Duration,
    /// Graceful-exit wait during delete.
    pub delete_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/run/cradle/containers"),
            proxy_sock: PathBuf::from("/run/cradle/proxy.sock"),
            shim_path: PathBuf::from("cradle-shim"),
            hypervisor_path: PathBuf::from("/usr/bin/qemu-lite-system-x86_64"),
            kernel_path: PathBuf::from("/usr/share/cradle/vmlinuz.container"),
            image_path: PathBuf::from("/usr/share/cradle/cradle-guest.img"),
            hypervisor_args: vec![
                "-machine".to_string(),
                "pc-lite,accel=kvm".to_string(),
                "-kernel".to_string(),
                "{kernel}".to_string(),
                "-device".to_string(),
                "nvdimm,memdev=mem0".to_string(),
                "-object".to_string(),
                "memory-backend-file,id=mem0,mem-path={image},share=on".to_string(),
                "-fsdev".to_string(),
                "local,id=pod9p,path={rootfs},security_model=none".to_string(),
                "-device".to_string(),
                "virtio-9p-pci,fsdev=pod9p,mount_tag=shared".to_string(),
                "-chardev".to_string(),
                "socket,id=agentctl,path={ctl},server=on,wait=off".to_string(),
                "-device".to_string(),
                "virtserialport,chardev=agentctl,name=agent.channel.0".to_string(),
                "-chardev".to_string(),
                "socket,id=agentio,path={io},server=on,wait=off".to_string(),
                "-device".to_string(),
                "virtserialport,chardev=agentio,name=agent.channel.1".to_string(),
                "-name".to_string(),
                "{token}".to_string(),
            ],
            network_helper: None,
            hyper_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(10),
        }
    }
}
