//! Network namespace setup and teardown.
//!
//! The namespace is created per container; actual veth-to-tap bridging is
//! the network plugin's job and is delegated to a configured helper binary
//! run inside the namespace.

use crate::error::RuntimeError;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug)]
pub struct NetworkNamespace {
    pub name: String,
}

impl NetworkNamespace {
    pub async fn create(container_id: &str) -> Result<Self, RuntimeError> {
        let name = format!("cradle-{}", container_id);
        run_ip(&["netns", "add", &name]).await?;
        tracing::debug!(netns = %name, "network namespace created");
        Ok(Self { name })
    }

    /// Bridge each host-visible veth in the namespace to a tap the
    /// hypervisor will attach. The helper owns the details.
    pub async fn bridge_taps(&self, helper: Option<&Path>) -> Result<(), RuntimeError> {
        let Some(helper) = helper else {
            tracing::debug!(netns = %self.name, "no network helper configured, skipping bridge");
            return Ok(());
        };

        let status = Command::new(helper)
            .arg(&self.name)
            .status()
            .await
            .map_err(|e| {
                RuntimeError::Internal(format!(
                    "cannot run network helper {}: {}",
                    helper.display(),
                    e
                ))
            })?;
        if !status.success() {
            return Err(RuntimeError::Internal(format!(
                "network helper {} exited with {}",
                helper.display(),
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }

    pub async fn destroy(&self) -> Result<(), RuntimeError> {
        run_ip(&["netns", "delete", &self.name]).await?;
        tracing::debug!(netns = %self.name, "network namespace removed");
        Ok(())
    }
}

/// Teardown for a namespace known only by container id (the delete path,
/// where no handle survived the creating invocation).
pub async fn destroy_for(container_id: &str) -> Result<(), RuntimeError> {
    let ns = NetworkNamespace {
        name: format!("cradle-{}", container_id),
    };
    ns.destroy().await
}

async fn run_ip(args: &[&str]) -> Result<(), RuntimeError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| RuntimeError::Internal(format!("cannot run ip {:?}: {}", args, e)))?;
    if !output.status.success() {
        return Err(RuntimeError::Internal(format!(
            "ip {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
