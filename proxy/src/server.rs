//! Command socket accept loop.

use crate::registry::VmRegistry;
use crate::session::run_session;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;

pub struct ProxyServer {
    listener: UnixListener,
    registry: Arc<VmRegistry>,
}

impl ProxyServer {
    /// Bind the well-known command socket, replacing any stale socket file
    /// left by a previous run.
    pub fn bind(socket_path: &Path, hyper_timeout: Duration) -> std::io::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        tracing::info!(path = %socket_path.display(), "proxy listening");

        Ok(Self {
            listener,
            registry: Arc::new(VmRegistry::new(hyper_timeout)),
        })
    }

    pub fn registry(&self) -> Arc<VmRegistry> {
        self.registry.clone()
    }

    /// Accept clients until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut next_session: u64 = 1;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let id = next_session;
                    next_session += 1;
                    tokio::spawn(run_session(id, stream, self.registry.clone()));
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping accept loop");
                    return Ok(());
                }
            }
        }
    }
}
