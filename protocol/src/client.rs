//! Client side of the proxy command socket, used by the runtime and the shim.

use crate::control::{ControlDecoder, ControlMessage, Opcode};
use crate::error::ProtocolError;
use crate::fdpass;
use crate::types::{
    AllocateIoDef, AllocatedIo, AttachDef, ErrorBody, HelloDef, HyperDef, StatusReply,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

/// One connection to the proxy command socket.
///
/// Requests are serialized: the proxy answers a session's commands in the
/// order they were sent, so a single pending correlation id suffices.
/// Unsolicited notifications arriving between replies are queued for
/// [`ProxyClient::next_notification`].
pub struct ProxyClient {
    stream: UnixStream,
    decoder: ControlDecoder,
    next_corr: u32,
    notifications: VecDeque<ControlMessage>,
    pending_fd: Option<OwnedFd>,
}

impl ProxyClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self {
            stream,
            decoder: ControlDecoder::new(),
            next_corr: 0,
            notifications: VecDeque::new(),
            pending_fd: None,
        })
    }

    fn next_corr(&mut self) -> u32 {
        // 0 is reserved for notifications.
        self.next_corr = self.next_corr.wrapping_add(1);
        if self.next_corr == 0 {
            self.next_corr = 1;
        }
        self.next_corr
    }

    async fn recv_message(&mut self) -> Result<ControlMessage, ProtocolError> {
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(msg);
            }
            let mut buf = [0u8; 4096];
            let (n, fd) = fdpass::recv_with_fd(&self.stream, &mut buf).await?;
            if n == 0 {
                return Err(ProtocolError::ChannelClosed);
            }
            if let Some(fd) = fd {
                self.pending_fd = Some(fd);
            }
            self.decoder.feed(&buf[..n]);
        }
    }

    async fn recv_reply(&mut self, corr: u32) -> Result<ControlMessage, ProtocolError> {
        loop {
            let msg = self.recv_message().await?;
            if msg.is_notification() {
                self.notifications.push_back(msg);
                continue;
            }
            if msg.corr != corr {
                tracing::warn!(
                    expected = corr,
                    got = msg.corr,
                    "discarding reply with unexpected correlation id"
                );
                continue;
            }
            if msg.opcode == Opcode::Err {
                let err: ErrorBody = msg.parse_body()?;
                return Err(ProtocolError::Remote {
                    kind: err.kind,
                    message: err.message,
                });
            }
            return Ok(msg);
        }
    }

    /// Send one request and wait for its reply.
    pub async fn call<T: Serialize>(
        &mut self,
        opcode: Opcode,
        body: &T,
    ) -> Result<ControlMessage, ProtocolError> {
        let corr = self.next_corr();
        let msg = ControlMessage::with_body(opcode, corr, body)?;
        self.stream.write_all(&msg.encode()).await?;
        self.recv_reply(corr).await
    }

    pub async fn hello(
        &mut self,
        token: &str,
        ctl_path: &str,
        io_path: &str,
    ) -> Result<(), ProtocolError> {
        self.call(
            Opcode::Hello,
            &HelloDef {
                token: token.to_string(),
                ctl_path: ctl_path.to_string(),
                io_path: io_path.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn attach(&mut self, token: &str) -> Result<(), ProtocolError> {
        self.call(
            Opcode::Attach,
            &AttachDef {
                token: token.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Ask the agent for `count` sequences; returns them with the stream
    /// socketpair end delivered in the reply's ancillary data.
    pub async fn allocate_io(&mut self, count: u32) -> Result<(Vec<u64>, OwnedFd), ProtocolError> {
        let reply = self.call(Opcode::AllocateIo, &AllocateIoDef { count }).await?;
        let allocated: AllocatedIo = reply.parse_body()?;
        let fd = self.pending_fd.take().ok_or(ProtocolError::MissingFd)?;
        Ok((allocated.seqs, fd))
    }

    /// Forward an agent command through the proxy and wait for the agent's
    /// reply body.
    pub async fn hyper<T: Serialize>(
        &mut self,
        op: Opcode,
        data: &T,
    ) -> Result<ControlMessage, ProtocolError> {
        let def = HyperDef {
            op: op.as_u32(),
            data: serde_json::to_value(data)?,
        };
        self.call(Opcode::Hyper, &def).await
    }

    pub async fn bye(&mut self) -> Result<(), ProtocolError> {
        let corr = self.next_corr();
        let msg = ControlMessage::empty(Opcode::Bye, corr);
        self.stream.write_all(&msg.encode()).await?;
        self.recv_reply(corr).await?;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<StatusReply, ProtocolError> {
        let corr = self.next_corr();
        let msg = ControlMessage::empty(Opcode::Status, corr);
        self.stream.write_all(&msg.encode()).await?;
        let reply = self.recv_reply(corr).await?;
        reply.parse_body()
    }

    /// Wait for the next unsolicited notification (agent `Ready`,
    /// `ProcessExited`, ...) forwarded by the proxy.
    pub async fn next_notification(&mut self) -> Result<ControlMessage, ProtocolError> {
        if let Some(msg) = self.notifications.pop_front() {
            return Ok(msg);
        }
        loop {
            let msg = self.recv_message().await?;
            if msg.is_notification() {
                return Ok(msg);
            }
            tracing::warn!(
                corr = msg.corr,
                "discarding reply received while waiting for notification"
            );
        }
    }
}
