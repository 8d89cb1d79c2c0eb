//! Integration tests driving a real proxy server against a scripted
//! in-process agent over UNIX sockets.

use cradle_protocol::control::{read_message, ControlMessage, Opcode};
use cradle_protocol::stream::{StreamDecoder, StreamFrame};
use cradle_protocol::types::PodDef;
use cradle_protocol::{ProtocolError, ProxyClient};
use cradle_proxy::ProxyServer;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

struct FakeAgent {
    pub ctl_path: PathBuf,
    pub io_path: PathBuf,
    /// Agent command opcodes in arrival order.
    pub ops: Arc<Mutex<Vec<u32>>>,
}

/// Listens on a control and an I/O socket. Control commands are answered
/// with an ack echoing the request body (`AllocateSeq` gets fresh sequence
/// numbers instead); the I/O channel echoes bytes verbatim. With
/// `mute = true` commands are read and recorded but never answered.
fn spawn_fake_agent(dir: &Path, name: &str, mute: bool) -> FakeAgent {
    let ctl_path = dir.join(format!("{}-ctl.sock", name));
    let io_path = dir.join(format!("{}-io.sock", name));
    let ops: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let ctl_listener = UnixListener::bind(&ctl_path).unwrap();
    let io_listener = UnixListener::bind(&io_path).unwrap();

    let ops_clone = ops.clone();
    tokio::spawn(async move {
        let (mut stream, _) = ctl_listener.accept().await.unwrap();

        // The agent announces readiness as soon as its channel is up.
        let ready = ControlMessage::empty(Opcode::Ready, 0);
        stream.write_all(&ready.encode()).await.unwrap();

        let mut next_seq: u64 = 1;
        loop {
            let msg = match read_message(&mut stream).await {
                Ok(msg) => msg,
                Err(_) => return,
            };
            ops_clone.lock().unwrap().push(msg.opcode.as_u32());
            if mute {
                continue;
            }

            let reply = if msg.opcode == Opcode::AllocateSeq {
                let body: serde_json::Value = msg.parse_body().unwrap();
                let count = body["count"].as_u64().unwrap_or(1);
                let seqs: Vec<u64> = (0..count).map(|i| next_seq + i).collect();
                next_seq += count;
                ControlMessage::with_body(
                    Opcode::AgentAck,
                    msg.corr,
                    &serde_json::json!({ "seqs": seqs }),
                )
                .unwrap()
            } else {
                ControlMessage::new(Opcode::AgentAck, msg.corr, msg.body.clone())
            };
            if stream.write_all(&reply.encode()).await.is_err() {
                return;
            }
        }
    });

    tokio::spawn(async move {
        let (mut stream, _) = io_listener.accept().await.unwrap();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    FakeAgent {
        ctl_path,
        io_path,
        ops,
    }
}

fn start_proxy(dir: &Path, hyper_timeout: Duration) -> PathBuf {
    let socket = dir.join("proxy.sock");
    let server = ProxyServer::bind(&socket, hyper_timeout).unwrap();
    tokio::spawn(server.serve_with_shutdown(std::future::pending::<()>()));
    socket
}

async fn connect(socket: &Path) -> ProxyClient {
    // The accept loop may not have started yet.
    for _ in 0..50 {
        if let Ok(client) = ProxyClient::connect(socket).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("proxy never came up at {:?}", socket);
}

fn shim_stream(fd: OwnedFd) -> UnixStream {
    let std_stream: std::os::unix::net::UnixStream = fd.into();
    std_stream.set_nonblocking(true).unwrap();
    UnixStream::from_std(std_stream).unwrap()
}

fn remote_kind(err: ProtocolError) -> String {
    match err {
        ProtocolError::Remote { kind, .. } => kind,
        other => panic!("expected remote error, got: {}", other),
    }
}

#[tokio::test]
async fn test_hello_ready_and_hyper_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", false);
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let mut client = connect(&socket).await;
    client
        .hello(
            "vm1",
            agent.ctl_path.to_str().unwrap(),
            agent.io_path.to_str().unwrap(),
        )
        .await
        .unwrap();

    let notif = tokio::time::timeout(Duration::from_secs(5), client.next_notification())
        .await
        .expect("ready notification must arrive")
        .unwrap();
    assert_eq!(notif.opcode, Opcode::Ready);

    let pod = PodDef {
        hostname: "p".into(),
        share_dir: "/tmp/share".into(),
        ..Default::default()
    };
    client.hyper(Opcode::StartPod, &pod).await.unwrap();

    assert_eq!(
        agent.ops.lock().unwrap().as_slice(),
        &[Opcode::StartPod.as_u32()]
    );
}

#[tokio::test]
async fn test_duplicate_hello_is_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", false);
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let ctl = agent.ctl_path.to_str().unwrap().to_string();
    let io = agent.io_path.to_str().unwrap().to_string();

    let mut first = connect(&socket).await;
    first.hello("vm1", &ctl, &io).await.unwrap();

    let mut second = connect(&socket).await;
    let err = second.hello("vm1", &ctl, &io).await.unwrap_err();
    assert_eq!(remote_kind(err), "Conflict");

    // The first registration is untouched.
    let pod = PodDef {
        hostname: "p".into(),
        share_dir: "/s".into(),
        ..Default::default()
    };
    first.hyper(Opcode::StartPod, &pod).await.unwrap();
}

#[tokio::test]
async fn test_attach_unknown_token_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let mut client = connect(&socket).await;
    let err = client.attach("nope").await.unwrap_err();
    assert_eq!(remote_kind(err), "NotFound");
}

#[tokio::test]
async fn test_concurrent_hyper_calls_each_get_their_own_reply() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", false);
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let mut owner = connect(&socket).await;
    owner
        .hello(
            "vm1",
            agent.ctl_path.to_str().unwrap(),
            agent.io_path.to_str().unwrap(),
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..4u32 {
        let socket = socket.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = connect(&socket).await;
            client.attach("vm1").await.unwrap();
            let body = serde_json::json!({ "container": format!("c{}", i) });
            let reply = client.hyper(Opcode::KillContainer, &body).await.unwrap();
            let echoed: serde_json::Value = reply.parse_body().unwrap();
            // The fake agent echoes the wrapped request body; a mismatched
            // reply would mean correlation ids got crossed.
            assert_eq!(echoed, body);
            client.bye().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let ops = agent.ops.lock().unwrap();
    assert_eq!(ops.len(), 4);
    assert!(ops.iter().all(|&op| op == Opcode::KillContainer.as_u32()));
}

#[tokio::test]
async fn test_allocate_io_stream_echo_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", false);
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let mut client = connect(&socket).await;
    client
        .hello(
            "vm1",
            agent.ctl_path.to_str().unwrap(),
            agent.io_path.to_str().unwrap(),
        )
        .await
        .unwrap();

    let (seqs, fd) = client.allocate_io(2).await.unwrap();
    assert_eq!(seqs.len(), 2);
    assert_ne!(seqs[0], seqs[1]);

    let mut stream = shim_stream(fd);
    for chunk in [&b"one"[..], b"two", b"three"] {
        let frame = StreamFrame::new(seqs[0], chunk.to_vec()).unwrap();
        stream.write_all(&frame.encode()).await.unwrap();
    }

    // The agent echoes the channel bytes; frames must come back whole and
    // in write order.
    let mut decoder = StreamDecoder::new();
    let mut got: Vec<Vec<u8>> = Vec::new();
    let mut buf = vec![0u8; 4096];
    while got.len() < 3 {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("echo frames must arrive")
            .unwrap();
        assert!(n > 0, "socketpair closed early");
        decoder.feed(&buf[..n]);
        while let Some(frame) = decoder.next_frame() {
            assert_eq!(frame.seq, seqs[0]);
            got.push(frame.payload);
        }
    }
    assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}

#[tokio::test]
async fn test_end_of_stream_releases_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", false);
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let mut client = connect(&socket).await;
    client
        .hello(
            "vm1",
            agent.ctl_path.to_str().unwrap(),
            agent.io_path.to_str().unwrap(),
        )
        .await
        .unwrap();

    let (seqs, fd) = client.allocate_io(2).await.unwrap();
    let mut stream = shim_stream(fd);

    let status = client.status().await.unwrap();
    assert_eq!(status.vms[0].sequences, 2);

    // The echoed terminal packets release both routing entries.
    for &seq in &seqs {
        stream
            .write_all(&StreamFrame::end_of_stream(seq).encode())
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = client.status().await.unwrap();
        if status.vms[0].sequences == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sequence table never drained"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_control_timeout_drives_unhealthy_then_bye_unregisters() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", true);
    let socket = start_proxy(dir.path(), Duration::from_millis(300));

    let mut client = connect(&socket).await;
    client
        .hello(
            "vm1",
            agent.ctl_path.to_str().unwrap(),
            agent.io_path.to_str().unwrap(),
        )
        .await
        .unwrap();

    let err = client
        .hyper(Opcode::NewContainer, &serde_json::json!({"id": "c1"}))
        .await
        .unwrap_err();
    assert_eq!(remote_kind(err), "Timeout");

    // The VM is unhealthy now; further commands fail fast.
    let err = client
        .hyper(Opcode::KillContainer, &serde_json::json!({"id": "c1"}))
        .await
        .unwrap_err();
    assert_eq!(remote_kind(err), "ChannelClosed");

    client.bye().await.unwrap();

    let mut probe = connect(&socket).await;
    let err = probe.attach("vm1").await.unwrap_err();
    assert_eq!(remote_kind(err), "NotFound");
}

#[tokio::test]
async fn test_multi_container_pod_rejected_before_agent() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", false);
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let mut client = connect(&socket).await;
    client
        .hello(
            "vm1",
            agent.ctl_path.to_str().unwrap(),
            agent.io_path.to_str().unwrap(),
        )
        .await
        .unwrap();

    let pod = serde_json::json!({
        "hostname": "p",
        "shareDir": "/s",
        "containers": [
            {"id": "a", "rootfs": "/a", "fstype": "9p", "image": "x",
             "process": {"args": ["/bin/true"]}},
            {"id": "b", "rootfs": "/b", "fstype": "9p", "image": "y",
             "process": {"args": ["/bin/true"]}}
        ]
    });
    let err = client.hyper(Opcode::StartPod, &pod).await.unwrap_err();
    assert_eq!(remote_kind(err), "BadRequest");

    // Rejected at the proxy boundary: the agent never saw it.
    assert!(agent.ops.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_refcount_keeps_registration_until_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let agent = spawn_fake_agent(dir.path(), "vm1", false);
    let socket = start_proxy(dir.path(), Duration::from_secs(5));

    let mut creator = connect(&socket).await;
    creator
        .hello(
            "vm1",
            agent.ctl_path.to_str().unwrap(),
            agent.io_path.to_str().unwrap(),
        )
        .await
        .unwrap();

    let pod = PodDef {
        hostname: "p".into(),
        share_dir: "/s".into(),
        ..Default::default()
    };
    creator.hyper(Opcode::StartPod, &pod).await.unwrap();
    creator.bye().await.unwrap();

    // A container is live, so the registration must survive the detach.
    let mut deleter = connect(&socket).await;
    deleter.attach("vm1").await.unwrap();
    deleter
        .hyper(Opcode::DestroyPod, &serde_json::json!({}))
        .await
        .unwrap();
    deleter.bye().await.unwrap();

    let mut probe = connect(&socket).await;
    let err = probe.attach("vm1").await.unwrap_err();
    assert_eq!(remote_kind(err), "NotFound");
}
