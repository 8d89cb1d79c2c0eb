//! The agent I/O channel: one reader that routes inbound frames by sequence
//! number, one lock-guarded writer for outbound frames.
//!
//! Each subscribed sequence gets its own bounded buffer. A slow consumer
//! fills its buffer and starts losing frames for that sequence only; every
//! other sequence keeps flowing.

use cradle_protocol::stream::{StreamDecoder, StreamFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Per-sequence backlog bound, in frames.
const SEQ_BUFFER_FRAMES: usize = 256;

/// A frame header whose payload never arrives within this window means the
/// channel is corrupt.
const STALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

struct SeqRoute {
    session: u64,
    tx: mpsc::Sender<StreamFrame>,
}

/// Routing state for one VM's I/O channel.
#[derive(Clone)]
pub struct IoMux {
    routes: Arc<Mutex<HashMap<u64, SeqRoute>>>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

impl IoMux {
    /// Split the channel socket and start the inbound router task.
    pub fn spawn(token: String, stream: UnixStream, healthy: Arc<AtomicBool>) -> (Self, JoinHandle<()>) {
        let (mut reader, writer) = stream.into_split();
        let routes: Arc<Mutex<HashMap<u64, SeqRoute>>> = Arc::new(Mutex::new(HashMap::new()));
        let mux = Self {
            routes: routes.clone(),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        };

        let task = tokio::spawn(async move {
            let mut decoder = StreamDecoder::new();
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                // A partial frame that stops making progress is a malformed
                // declared length; fatal to the whole channel.
                let read = if decoder.pending() > 0 {
                    match tokio::time::timeout(STALL_TIMEOUT, reader.read(&mut buf)).await {
                        Ok(read) => read,
                        Err(_) => {
                            tracing::error!(token = %token, "io channel stalled mid-frame");
                            break;
                        }
                    }
                } else {
                    reader.read(&mut buf).await
                };
                let n = match read {
                    Ok(0) => {
                        tracing::warn!(token = %token, "io channel closed by peer");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(token = %token, error = %e, "io channel read failed");
                        break;
                    }
                };
                decoder.feed(&buf[..n]);

                while let Some(frame) = decoder.next_frame() {
                    route_inbound(&routes, frame);
                }
            }
            healthy.store(false, Ordering::SeqCst);
            // Dropping every route wakes the per-session pumps, which then
            // synthesize end-of-stream toward their shims.
            routes.lock().unwrap().clear();
        });

        (mux, task)
    }

    /// Subscribe `session` to `seq`; returns the bounded frame buffer the
    /// session pump drains.
    pub fn register(&self, session: u64, seq: u64) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(SEQ_BUFFER_FRAMES);
        self.routes
            .lock()
            .unwrap()
            .insert(seq, SeqRoute { session, tx });
        rx
    }

    /// Drop every sequence subscribed by `session`.
    pub fn release_session(&self, session: u64) {
        self.routes
            .lock()
            .unwrap()
            .retain(|_, route| route.session != session);
    }

    pub fn sequence_count(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    /// Write one outbound frame under the channel writer lock. Frames from a
    /// single pump keep their order; interleaving between pumps respects
    /// frame boundaries.
    pub async fn write_frame(&self, frame: &StreamFrame) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame.encode()).await
    }
}

fn route_inbound(routes: &Mutex<HashMap<u64, SeqRoute>>, frame: StreamFrame) {
    let mut routes = routes.lock().unwrap();
    let seq = frame.seq;
    let Some(route) = routes.get(&seq) else {
        tracing::debug!(seq, "dropping frame for unknown sequence");
        return;
    };

    let eos = frame.is_end_of_stream();
    match route.tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(seq, "subscriber backlog full, dropping frame");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            routes.remove(&seq);
            return;
        }
    }

    // The terminal packet releases the routing entry; later frames for
    // this sequence are dropped above.
    if eos {
        routes.remove(&seq);
    }
}

/// Pump tasks tying one shim socketpair to the VM's I/O channel.
///
/// Outbound: frames read off the socketpair are copied byte-for-byte onto
/// the channel in write order. Inbound: each subscribed sequence's buffer is
/// drained to the socketpair; when a buffer closes before its end-of-stream
/// arrived, one is synthesized so the shim can finish.
pub fn spawn_pumps(
    mux: &IoMux,
    session: u64,
    seqs: &[u64],
    shim_sock: UnixStream,
) -> Vec<JoinHandle<()>> {
    let (mut sock_reader, sock_writer) = shim_sock.into_split();
    let mut tasks = Vec::new();

    // Shim -> agent.
    let outbound_mux = mux.clone();
    tasks.push(tokio::spawn(async move {
        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = match sock_reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            decoder.feed(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                if let Err(e) = outbound_mux.write_frame(&frame).await {
                    tracing::error!(session, error = %e, "outbound frame write failed");
                    return;
                }
            }
        }
    }));

    // Agent -> shim, one drain task per sequence sharing the write half.
    let sock_writer = Arc::new(tokio::sync::Mutex::new(sock_writer));
    for &seq in seqs {
        let mut rx = mux.register(session, seq);
        let writer = sock_writer.clone();
        tasks.push(tokio::spawn(async move {
            let mut saw_eos = false;
            while let Some(frame) = rx.recv().await {
                saw_eos = frame.is_end_of_stream();
                let mut writer = writer.lock().await;
                if writer.write_all(&frame.encode()).await.is_err() {
                    return;
                }
                if saw_eos {
                    break;
                }
            }
            if !saw_eos {
                let eos = StreamFrame::end_of_stream(seq);
                let mut writer = writer.lock().await;
                let _ = writer.write_all(&eos.encode()).await;
            }
        }));
    }

    tasks
}
