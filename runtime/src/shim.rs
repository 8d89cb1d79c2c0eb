//! Shim launching and release.
//!
//! The shim starts paused: it blocks on the handoff socket (mapped to its
//! fd 3) until the sequences and the stream socketpair arrive, then on the
//! proceed FIFO until `start` (or `exec`) releases it. The FIFO lives in
//! the container state directory so a later invocation can open it.

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use nix::sys::socket::{sendmsg, socketpair, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType};
use std::io::{IoSlice, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub const PROCEED_FIFO: &str = "proceed";
pub const SHIM_LOG: &str = "shim.log";

/// Descriptor number the shim expects the handoff socket on.
const HANDOFF_FD: RawFd = 3;

pub struct ShimHandle {
    pub pid: i32,
    handoff: OwnedFd,
    child: tokio::process::Child,
}

impl ShimHandle {
    /// Deliver the allocated sequences and the stream socketpair end. This
    /// is what unblocks the shim's first pause.
    pub fn send_handoff(&self, seqs: &[u64], stream_fd: RawFd) -> Result<(), RuntimeError> {
        if seqs.len() != 2 {
            return Err(RuntimeError::Internal(format!(
                "expected 2 sequences for the shim, got {}",
                seqs.len()
            )));
        }
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&seqs[0].to_be_bytes());
        buf[8..].copy_from_slice(&seqs[1].to_be_bytes());

        let iov = [IoSlice::new(&buf)];
        let fds = [stream_fd];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(
            self.handoff.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )
        .map_err(|e| RuntimeError::Internal(format!("shim handoff send failed: {}", e)))?;
        Ok(())
    }

    /// Rollback path: the shim never ran, take it down hard.
    pub async fn abort(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Wait for the shim to exit and return the container process's status
    /// as the shim reports it.
    pub async fn wait(mut self) -> Result<i32, RuntimeError> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(128 + status_signal(&status)))
    }
}

#[cfg(unix)]
fn status_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

pub fn proceed_path(container_dir: &Path) -> PathBuf {
    container_dir.join(PROCEED_FIFO)
}

pub fn make_proceed_fifo(path: &Path) -> Result<(), RuntimeError> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600))
        .map_err(|e| RuntimeError::Internal(format!("mkfifo {}: {}", path.display(), e)))
}

/// Spawn the shim paused. Its stdio is inherited from us, which is how the
/// engine ends up owning the container's stdio.
pub async fn spawn_paused(
    config: &RuntimeConfig,
    token: &str,
    process_id: &str,
    proceed: &Path,
    log: &Path,
) -> Result<ShimHandle, RuntimeError> {
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(|e| RuntimeError::Internal(format!("socketpair failed: {}", e)))?;

    // Our end must not leak into the shim.
    set_cloexec(ours.as_raw_fd())?;

    let mut cmd = Command::new(&config.shim_path);
    cmd.arg("--proxy-sock")
        .arg(&config.proxy_sock)
        .arg("--token")
        .arg(token)
        .arg("--container")
        .arg(process_id)
        .arg("--proceed")
        .arg(proceed)
        .arg("--log")
        .arg(log);

    let theirs_raw = theirs.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            if theirs_raw != HANDOFF_FD {
                nix::unistd::dup2(theirs_raw, HANDOFF_FD)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                let _ = nix::unistd::close(theirs_raw);
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        RuntimeError::Internal(format!(
            "cannot spawn shim {}: {}",
            config.shim_path.display(),
            e
        ))
    })?;
    drop(theirs);

    let pid = child.id().map(|p| p as i32).unwrap_or(-1);
    tracing::info!(pid, process_id, "shim spawned paused");

    Ok(ShimHandle {
        pid,
        handoff: ours,
        child,
    })
}

/// Release a paused shim by writing the proceed byte. Opening the FIFO
/// non-blocking fails with ENXIO when no shim is reading, which catches a
/// shim that died while paused.
pub fn release(proceed: &Path) -> Result<(), RuntimeError> {
    let mut fifo = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(proceed)
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::ENXIO) {
                RuntimeError::PreconditionFailed("shim is not waiting for release".to_string())
            } else {
                RuntimeError::Internal(format!("cannot open proceed fifo: {}", e))
            }
        })?;
    fifo.write_all(&[1])
        .map_err(|e| RuntimeError::Internal(format!("proceed write failed: {}", e)))?;
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<(), RuntimeError> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| RuntimeError::Internal(format!("fcntl cloexec: {}", e)))?;
    Ok(())
}
