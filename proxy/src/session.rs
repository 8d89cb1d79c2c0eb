//! One task per client connection on the command socket.
//!
//! Requests are served strictly in arrival order, so a session's replies
//! come back in the order its commands were sent. Notifications from the
//! attached VM's agent are forwarded between requests.

use crate::error::ProxyError;
use crate::iomux::spawn_pumps;
use crate::registry::{VmEntry, VmRegistry};
use cradle_protocol::control::{ControlDecoder, ControlMessage, Opcode};
use cradle_protocol::fdpass;
use cradle_protocol::types::{
    AllocateIoDef, AllocatedIo, AllocatedSeqs, AttachDef, ErrorBody, HelloDef, HyperDef, PodDef,
    StatusReply,
};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::broadcast;

struct Session {
    id: u64,
    registry: Arc<VmRegistry>,
    attached: Option<Arc<VmEntry>>,
    notifications: Option<broadcast::Receiver<ControlMessage>>,
}

pub async fn run_session(id: u64, stream: UnixStream, registry: Arc<VmRegistry>) {
    tracing::debug!(session = id, "client connected");

    let mut session = Session {
        id,
        registry: registry.clone(),
        attached: None,
        notifications: None,
    };
    let mut decoder = ControlDecoder::new();
    let mut buf = vec![0u8; 16 * 1024];

    'conn: loop {
        loop {
            match decoder.next_message() {
                Ok(Some(msg)) => {
                    if session.dispatch(&stream, msg).await.is_err() {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(session = id, error = %e, "malformed client frame, closing");
                    break 'conn;
                }
            }
        }

        tokio::select! {
            ready = stream.readable() => {
                if ready.is_err() {
                    break 'conn;
                }
                match stream.try_read(&mut buf) {
                    Ok(0) => break 'conn,
                    Ok(n) => decoder.feed(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => break 'conn,
                }
            }
            notif = recv_notification(&mut session.notifications), if session.notifications.is_some() => {
                match notif {
                    Some(msg) => {
                        if send_all(&stream, &msg.encode()).await.is_err() {
                            break 'conn;
                        }
                    }
                    // The VM went away; stop polling its notifications.
                    None => session.notifications = None,
                }
            }
        }
    }

    // Disconnect counts as detaching; an in-flight agent reply for this
    // session will be discarded by the control task.
    if let Some(vm) = session.attached.take() {
        registry.detach(&vm, id).await;
    }
    tracing::debug!(session = id, "client disconnected");
}

async fn recv_notification(
    rx: &mut Option<broadcast::Receiver<ControlMessage>>,
) -> Option<ControlMessage> {
    let rx = rx.as_mut()?;
    loop {
        match rx.recv().await {
            Ok(msg) => return Some(msg),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "session lagged behind notifications");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

impl Session {
    async fn dispatch(
        &mut self,
        stream: &UnixStream,
        msg: ControlMessage,
    ) -> std::io::Result<()> {
        let corr = msg.corr;
        let result = match msg.opcode {
            Opcode::Hello => self.op_hello(&msg).await,
            Opcode::Attach => self.op_attach(&msg).await,
            Opcode::AllocateIo => self.op_allocate_io(&msg).await,
            Opcode::Hyper => self.op_hyper(&msg).await.map(|v| (v, None)),
            Opcode::Bye => self.op_bye().await.map(|v| (v, None)),
            Opcode::Status => self.op_status().await.map(|v| (v, None)),
            other => Err(ProxyError::UnknownOpcode(other.as_u32())),
        };

        match result {
            Ok((body, fd)) => {
                let reply = ControlMessage::new(Opcode::Ok, corr, body);
                match fd {
                    Some(fd) => {
                        fdpass::send_with_fd(stream, &reply.encode(), fd.as_raw_fd()).await?
                    }
                    None => send_all(stream, &reply.encode()).await?,
                }
            }
            Err(e) => {
                tracing::debug!(session = self.id, error = %e, "command failed");
                let body = ErrorBody {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                };
                let reply = ControlMessage::with_body(Opcode::Err, corr, &body)
                    .unwrap_or_else(|_| ControlMessage::empty(Opcode::Err, corr));
                send_all(stream, &reply.encode()).await?;
            }
        }
        Ok(())
    }

    fn vm(&self) -> Result<&Arc<VmEntry>, ProxyError> {
        self.attached.as_ref().ok_or(ProxyError::NotAttached)
    }

    async fn bind(&mut self, vm: Arc<VmEntry>) {
        if let Some(old) = self.attached.take() {
            self.registry.detach(&old, self.id).await;
        }
        // The registering session inherits the subscription opened before
        // the control task started, so the agent's ready frame is not lost.
        self.notifications = Some(
            vm.take_early_notifications()
                .unwrap_or_else(|| vm.control.subscribe()),
        );
        self.attached = Some(vm);
    }

    async fn op_hello(
        &mut self,
        msg: &ControlMessage,
    ) -> Result<(Vec<u8>, Option<OwnedFd>), ProxyError> {
        let def: HelloDef = msg.parse_body()?;
        let vm = self
            .registry
            .register(&def.token, &def.ctl_path, &def.io_path)
            .await?;
        vm.sessions_insert(self.id);
        self.bind(vm).await;
        Ok((b"{}".to_vec(), None))
    }

    async fn op_attach(
        &mut self,
        msg: &ControlMessage,
    ) -> Result<(Vec<u8>, Option<OwnedFd>), ProxyError> {
        let def: AttachDef = msg.parse_body()?;
        let vm = self.registry.attach(&def.token, self.id).await?;
        self.bind(vm).await;
        Ok((b"{}".to_vec(), None))
    }

    async fn op_allocate_io(
        &mut self,
        msg: &ControlMessage,
    ) -> Result<(Vec<u8>, Option<OwnedFd>), ProxyError> {
        let def: AllocateIoDef = msg.parse_body()?;
        if def.count == 0 || def.count > 2 {
            return Err(ProxyError::BadRequest(format!(
                "sequence count must be 1 or 2, got {}",
                def.count
            )));
        }
        let vm = self.vm()?.clone();
        if !vm.healthy() {
            return Err(ProxyError::ChannelClosed);
        }

        let reply = vm
            .control
            .call(
                Opcode::AllocateSeq.as_u32(),
                serde_json::json!({ "count": def.count }),
            )
            .await?;
        let allocated: AllocatedSeqs = serde_json::from_value(reply)?;
        if allocated.seqs.len() != def.count as usize {
            return Err(ProxyError::BadRequest(format!(
                "agent allocated {} sequences, wanted {}",
                allocated.seqs.len(),
                def.count
            )));
        }

        let (kept, handed) = UnixStream::pair()?;
        let pumps = spawn_pumps(&vm.io, self.id, &allocated.seqs, kept);
        vm.track_pump(pumps);

        let handed: OwnedFd = handed.into_std()?.into();
        let body = serde_json::to_vec(&AllocatedIo {
            seqs: allocated.seqs,
        })?;

        tracing::info!(session = self.id, token = %vm.token, "io sequences allocated");
        Ok((body, Some(handed)))
    }

    async fn op_hyper(&mut self, msg: &ControlMessage) -> Result<Vec<u8>, ProxyError> {
        let def: HyperDef = msg.parse_body()?;
        let vm = self.vm()?.clone();
        if !vm.healthy() {
            return Err(ProxyError::ChannelClosed);
        }

        let op = Opcode::from_u32(def.op);
        if !op.is_agent_command() {
            return Err(ProxyError::UnknownOpcode(def.op));
        }

        // One container per pod: reject wider pod definitions before they
        // reach the agent.
        if op == Opcode::StartPod {
            let pod: PodDef = serde_json::from_value(def.data.clone())
                .map_err(|e| ProxyError::BadRequest(format!("invalid pod definition: {}", e)))?;
            if pod.containers.len() > 1 {
                return Err(ProxyError::InvalidPod);
            }
        }

        let reply = vm.control.call(def.op, def.data).await?;

        match op {
            Opcode::StartPod => vm.container_started(),
            Opcode::DestroyPod => vm.container_destroyed(),
            _ => {}
        }

        Ok(serde_json::to_vec(&reply)?)
    }

    async fn op_bye(&mut self) -> Result<Vec<u8>, ProxyError> {
        let vm = self.attached.take().ok_or(ProxyError::NotAttached)?;
        self.notifications = None;
        self.registry.detach(&vm, self.id).await;
        Ok(b"{}".to_vec())
    }

    async fn op_status(&mut self) -> Result<Vec<u8>, ProxyError> {
        let reply = StatusReply {
            vms: self.registry.status().await,
        };
        Ok(serde_json::to_vec(&reply)?)
    }
}

/// Write all of `bytes`, tolerating partial writes on the nonblocking socket.
async fn send_all(stream: &UnixStream, bytes: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        stream.writable().await?;
        match stream.try_write(&bytes[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
