//! The stream bridge: stdin framed onto the stdio sequence, socketpair
//! frames demultiplexed back to stdout and stderr.

use crate::error::ShimError;
use cradle_protocol::stream::{fragment, StreamDecoder, StreamFrame, DEFAULT_MAX_PAYLOAD};
use std::os::fd::OwnedFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Pump stdin and stdout/stderr until the agent closes both sequences.
/// Returns once end-of-stream has been observed for stdio and stderr; the
/// exit status follows separately as an agent notification.
pub async fn run(stream: OwnedFd, stdio_seq: u64, stderr_seq: u64) -> Result<(), ShimError> {
    let std_stream: std::os::unix::net::UnixStream = stream.into();
    std_stream.set_nonblocking(true)?;
    let stream = UnixStream::from_std(std_stream)?;
    let (mut sock_reader, mut sock_writer) = stream.into_split();

    // Host stdin -> framed -> socketpair. The write half belongs to this
    // task alone, so frame order matches read order.
    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => {
                    let eos = StreamFrame::end_of_stream(stdio_seq);
                    let _ = sock_writer.write_all(&eos.encode()).await;
                    return;
                }
                Ok(n) => {
                    for frame in fragment(stdio_seq, &buf[..n], DEFAULT_MAX_PAYLOAD) {
                        if sock_writer.write_all(&frame.encode()).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "stdin read failed");
                    return;
                }
            }
        }
    });

    // Socketpair -> stdout/stderr by sequence.
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut stdio_done = false;
    let mut stderr_done = false;

    while !(stdio_done && stderr_done) {
        let n = match sock_reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("proxy closed the stream socketpair");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                stdin_task.abort();
                return Err(e.into());
            }
        };
        decoder.feed(&buf[..n]);

        while let Some(frame) = decoder.next_frame() {
            if frame.seq == stdio_seq {
                if frame.is_end_of_stream() {
                    stdio_done = true;
                    let _ = stdout.flush().await;
                } else {
                    stdout.write_all(&frame.payload).await?;
                    stdout.flush().await?;
                }
            } else if frame.seq == stderr_seq {
                if frame.is_end_of_stream() {
                    stderr_done = true;
                    let _ = stderr.flush().await;
                } else {
                    stderr.write_all(&frame.payload).await?;
                    stderr.flush().await?;
                }
            } else {
                tracing::warn!(seq = frame.seq, "frame for a sequence that is not ours");
            }
        }
    }

    stdin_task.abort();
    tracing::debug!("both sequences closed");
    Ok(())
}
