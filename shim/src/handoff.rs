//! Startup handoff from the runtime.
//!
//! The runtime spawns the shim with a socketpair end on fd 3. Once it has
//! performed `AllocateIo` on the shim's behalf, it writes the two sequence
//! numbers (8 bytes each, big-endian) with the stream socketpair descriptor
//! attached as SCM_RIGHTS. The proceed FIFO is opened separately: a single
//! byte releases the shim into running mode, end-of-file without a byte
//! aborts it.

use crate::error::ShimError;
use cradle_protocol::fdpass;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use tokio::net::UnixStream;

/// Descriptor number the runtime maps the handoff socket to.
pub const HANDOFF_FD: RawFd = 3;

pub struct Handoff {
    /// Sequence covering stdin and stdout.
    pub stdio_seq: u64,
    /// Sequence covering stderr.
    pub stderr_seq: u64,
    /// Our end of the stream socketpair into the proxy.
    pub stream: OwnedFd,
}

/// Block on the inherited handoff socket until the runtime delivers the
/// sequence numbers and the stream descriptor.
pub async fn receive() -> Result<Handoff, ShimError> {
    let sock = unsafe { std::os::unix::net::UnixStream::from_raw_fd(HANDOFF_FD) };
    sock.set_nonblocking(true)?;
    let sock = UnixStream::from_std(sock)?;

    let mut buf = [0u8; 16];
    let mut filled = 0;
    let mut stream = None;
    while filled < buf.len() {
        let (n, fd) = fdpass::recv_with_fd(&sock, &mut buf[filled..]).await?;
        if n == 0 {
            return Err(ShimError::Handoff(
                "runtime closed the handoff socket".to_string(),
            ));
        }
        if fd.is_some() {
            stream = fd;
        }
        filled += n;
    }

    let stdio_seq = u64::from_be_bytes(buf[..8].try_into().unwrap());
    let stderr_seq = u64::from_be_bytes(buf[8..].try_into().unwrap());
    let stream = stream.ok_or(ShimError::MissingStreamFd)?;

    tracing::debug!(stdio_seq, stderr_seq, "handoff received");
    Ok(Handoff {
        stdio_seq,
        stderr_seq,
        stream,
    })
}

/// Wait on the proceed FIFO. `true` means run, `false` means the runtime
/// abandoned the container before starting it.
pub async fn wait_proceed(path: PathBuf) -> Result<bool, ShimError> {
    // Opening the FIFO read-only blocks until the runtime opens the write
    // side, which is the pause the orchestration relies on.
    tokio::task::spawn_blocking(move || -> Result<bool, ShimError> {
        let mut fifo = std::fs::File::open(&path)?;
        let mut byte = [0u8; 1];
        let n = fifo.read(&mut byte)?;
        Ok(n == 1)
    })
    .await
    .map_err(|e| ShimError::Internal(format!("proceed wait task failed: {}", e)))?
}
