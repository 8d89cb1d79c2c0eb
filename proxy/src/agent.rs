//! The agent control channel: strictly serialized, one outstanding command
//! at a time.
//!
//! A reader task owns the read half and forwards whole decoded messages
//! over a queue, so waiting for a reply can never tear a frame apart. The
//! command task owns the write half: requests from sessions are queued and
//! fed to the agent FIFO, which gives the system-wide arrival ordering for
//! `Hyper` calls. Replies are matched by correlation id; unsolicited frames
//! (correlation id 0) are broadcast to every attached session.

use crate::error::ProxyError;
use cradle_protocol::control::{read_message, ControlMessage, Opcode};
use cradle_protocol::types::AgentErrorBody;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const COMMAND_QUEUE_DEPTH: usize = 64;
const INBOUND_QUEUE_DEPTH: usize = 64;
const NOTIFICATION_QUEUE_DEPTH: usize = 64;

pub struct ControlRequest {
    pub op: u32,
    pub data: serde_json::Value,
    pub reply: oneshot::Sender<Result<serde_json::Value, ProxyError>>,
}

/// Handle to a VM's control-channel task.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
    healthy: Arc<AtomicBool>,
    notifications: broadcast::Sender<ControlMessage>,
}

impl ControlHandle {
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.notifications.subscribe()
    }

    /// Queue one agent command and wait for its reply. Returns
    /// `ChannelClosed` immediately once the VM is unhealthy.
    pub async fn call(
        &self,
        op: u32,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, ProxyError> {
        if !self.healthy() {
            return Err(ProxyError::ChannelClosed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlRequest {
                op,
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProxyError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ProxyError::ChannelClosed)?
    }
}

/// Spawn the control-channel tasks for one VM.
///
/// The returned receiver was subscribed before the reader started, so it
/// cannot miss notifications the agent sends right after the channel opens
/// (the ready frame in particular). It is handed to the registering
/// session.
pub fn spawn_control(
    token: String,
    stream: UnixStream,
    timeout: Duration,
    healthy: Arc<AtomicBool>,
) -> (
    ControlHandle,
    JoinHandle<()>,
    broadcast::Receiver<ControlMessage>,
) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (notify_tx, early_rx) = broadcast::channel(NOTIFICATION_QUEUE_DEPTH);
    let handle = ControlHandle {
        tx,
        healthy: healthy.clone(),
        notifications: notify_tx.clone(),
    };

    let (mut reader, writer) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<ControlMessage>(INBOUND_QUEUE_DEPTH);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(msg) => {
                    if in_tx.send(msg).await.is_err() {
                        return;
                    }
                }
                // Closing the queue is the closed-channel signal.
                Err(_) => return,
            }
        }
    });

    let task = tokio::spawn(async move {
        run_control(&token, writer, rx, in_rx, notify_tx, timeout, healthy).await;
        reader_task.abort();
    });

    (handle, task, early_rx)
}

async fn run_control(
    token: &str,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<ControlRequest>,
    mut inbound: mpsc::Receiver<ControlMessage>,
    notify_tx: broadcast::Sender<ControlMessage>,
    timeout: Duration,
    healthy: Arc<AtomicBool>,
) {
    let mut corr: u32 = 0;

    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(m) if m.is_notification() => {
                    let _ = notify_tx.send(m);
                }
                Some(m) => {
                    tracing::warn!(token, corr = m.corr,
                        "reply with no command in flight, discarding");
                }
                None => {
                    tracing::error!(token, "control channel closed by agent");
                    break;
                }
            },
            req = queue.recv() => {
                let Some(req) = req else { break };

                corr = corr.wrapping_add(1);
                if corr == 0 {
                    corr = 1;
                }

                let msg = ControlMessage::new(
                    Opcode::from_u32(req.op),
                    corr,
                    serde_json::to_vec(&req.data).unwrap_or_else(|_| b"{}".to_vec()),
                );
                if let Err(e) = writer.write_all(&msg.encode()).await {
                    tracing::error!(token, error = %e, "control channel write failed");
                    let _ = req.reply.send(Err(ProxyError::ChannelClosed));
                    break;
                }

                let result = wait_reply(&mut inbound, &notify_tx, corr, timeout).await;
                let fatal = matches!(result, Err(ProxyError::Timeout) | Err(ProxyError::ChannelClosed));

                // A dropped receiver means the client disconnected; the
                // reply is discarded but the channel stays usable.
                let _ = req.reply.send(result);

                if fatal {
                    break;
                }
            }
        }
    }

    healthy.store(false, Ordering::SeqCst);
    tracing::warn!(token, "control channel unhealthy, failing queued commands");

    // Fail everything still queued; in-flight callers already got their
    // Timeout or ChannelClosed above.
    queue.close();
    while let Some(req) = queue.recv().await {
        let _ = req.reply.send(Err(ProxyError::ChannelClosed));
    }
}

/// Wait for the reply matching `corr`, forwarding notifications that arrive
/// in the meantime.
async fn wait_reply(
    inbound: &mut mpsc::Receiver<ControlMessage>,
    notify_tx: &broadcast::Sender<ControlMessage>,
    corr: u32,
    timeout: Duration,
) -> Result<serde_json::Value, ProxyError> {
    let deadline = Instant::now() + timeout;

    loop {
        let msg = match tokio::time::timeout_at(deadline, inbound.recv()).await {
            Err(_) => return Err(ProxyError::Timeout),
            Ok(None) => return Err(ProxyError::ChannelClosed),
            Ok(Some(msg)) => msg,
        };

        if msg.is_notification() {
            let _ = notify_tx.send(msg);
            continue;
        }
        if msg.corr != corr {
            tracing::warn!(expected = corr, got = msg.corr, "stale reply, discarding");
            continue;
        }

        return match msg.opcode {
            Opcode::AgentAck => {
                if msg.body.is_empty() {
                    Ok(serde_json::Value::Null)
                } else {
                    Ok(serde_json::from_slice(&msg.body)?)
                }
            }
            Opcode::AgentError => {
                let err: AgentErrorBody = msg.parse_body()?;
                Err(ProxyError::Agent {
                    code: err.code,
                    message: err.message,
                })
            }
            // Unknown reply opcodes fail the RPC, not the channel.
            other => Err(ProxyError::UnknownOpcode(other.as_u32())),
        };
    }
}
