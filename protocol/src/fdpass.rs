//! SCM_RIGHTS file-descriptor passing over UNIX stream sockets.
//!
//! The socketpair end for a shim travels as ancillary data on the same
//! connection that carries the `AllocateIo` reply, so the receiver consumes
//! the descriptor atomically with the reply bytes.

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Send `bytes` over `stream`, attaching `fd` as SCM_RIGHTS ancillary data
/// to the first byte. Continues plain writes until everything is sent.
pub async fn send_with_fd(stream: &UnixStream, bytes: &[u8], fd: RawFd) -> io::Result<()> {
    let mut sent = 0usize;
    let mut fd_sent = false;

    while sent < bytes.len() {
        let attach_fd = !fd_sent;
        let n = stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&bytes[sent..])];
                let fds = [fd];
                let scm = [ControlMessage::ScmRights(&fds)];
                let cmsgs: &[ControlMessage] = if attach_fd { &scm } else { &[] };
                sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
                    .map_err(errno_to_io)
            })
            .await?;
        if n > 0 {
            fd_sent = true;
        }
        sent += n;
    }

    Ok(())
}

/// Receive into `buf`, returning the byte count and any descriptor that
/// arrived in the ancillary data.
pub async fn recv_with_fd(
    stream: &UnixStream,
    buf: &mut [u8],
) -> io::Result<(usize, Option<OwnedFd>)> {
    stream
        .async_io(Interest::READABLE, || {
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let mut iov = [IoSliceMut::new(buf)];
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(errno_to_io)?;

            let n = msg.bytes;
            let mut received = None;
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    if let Some(&fd) = fds.first() {
                        received = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            Ok((n, received))
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::IntoRawFd;

    #[tokio::test]
    async fn test_fd_travels_with_bytes() {
        let (a, b) = UnixStream::pair().unwrap();

        // A socketpair end to smuggle across.
        let (keep, send) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();

        send_with_fd(&a, b"reply-bytes", send.as_raw_fd())
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, fd) = recv_with_fd(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply-bytes");
        let fd = fd.expect("descriptor should arrive with the bytes");

        // Write through the kept end, read through the received one.
        nix::unistd::write(keep.as_raw_fd(), b"x").unwrap();
        let mut one = [0u8; 1];
        nix::unistd::read(fd.as_raw_fd(), &mut one).unwrap();
        assert_eq!(&one, b"x");
    }

    #[tokio::test]
    async fn test_plain_bytes_carry_no_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        a.writable().await.unwrap();
        a.try_write(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let (n, fd) = recv_with_fd(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(fd.is_none());
    }

    #[tokio::test]
    async fn test_socketpair_end_usable_after_transfer() {
        let (a, b) = UnixStream::pair().unwrap();

        let (sp_a, sp_b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();

        send_with_fd(&a, b"io", sp_b.into_raw_fd()).await.unwrap();

        let mut buf = [0u8; 8];
        let (_, fd) = recv_with_fd(&b, &mut buf).await.unwrap();
        let received = fd.unwrap();

        nix::unistd::write(sp_a.as_raw_fd(), b"frame").unwrap();
        let mut out = [0u8; 5];
        nix::unistd::read(received.as_raw_fd(), &mut out).unwrap();
        assert_eq!(&out, b"frame");
    }
}
