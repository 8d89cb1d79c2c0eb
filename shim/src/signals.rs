//! Host signal forwarding.
//!
//! Every catchable signal delivered to the shim is translated into a
//! `KillContainer` command for the container process in the guest. SIGKILL
//! and SIGSTOP never reach user code; the runtime sends those through the
//! proxy itself.

use cradle_protocol::control::Opcode;
use cradle_protocol::types::KillDef;
use cradle_protocol::ProxyClient;
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Signals the shim traps and forwards: the full catchable set, mirroring
/// what the runtime accepts for `kill`. Synchronous fault signals (ILL,
/// FPE, SEGV) may be refused by the handler registry; those fall through
/// to the install warning below.
const FORWARDED_SIGNALS: &[i32] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGUSR1,
    libc::SIGSEGV,
    libc::SIGUSR2,
    libc::SIGPIPE,
    libc::SIGALRM,
    libc::SIGTERM,
    libc::SIGSTKFLT,
    libc::SIGCHLD,
    libc::SIGCONT,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGURG,
    libc::SIGXCPU,
    libc::SIGXFSZ,
    libc::SIGVTALRM,
    libc::SIGPROF,
    libc::SIGWINCH,
    libc::SIGIO,
    libc::SIGPWR,
    libc::SIGSYS,
];

/// Install handlers and start the forwarding task. Signals are relayed in
/// arrival order over short-lived proxy sessions so forwarding never
/// contends with the main session's notification wait.
pub fn spawn_forwarders(proxy_sock: PathBuf, token: String, container: String) {
    let (tx, mut rx) = mpsc::channel::<i32>(16);

    for &signum in FORWARDED_SIGNALS {
        let tx = tx.clone();
        let mut stream = match signal(SignalKind::from_raw(signum)) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(signum, error = %e, "cannot install signal handler");
                continue;
            }
        };
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(signum).await.is_err() {
                    return;
                }
            }
        });
    }

    tokio::spawn(async move {
        while let Some(signum) = rx.recv().await {
            tracing::debug!(signum, container = %container, "forwarding signal");
            if let Err(e) = forward(&proxy_sock, &token, &container, signum).await {
                tracing::warn!(signum, error = %e, "signal forwarding failed");
            }
        }
    });
}

async fn forward(
    proxy_sock: &Path,
    token: &str,
    container: &str,
    signum: i32,
) -> Result<(), cradle_protocol::ProtocolError> {
    let mut client = ProxyClient::connect(proxy_sock).await?;
    client.attach(token).await?;
    client
        .hyper(
            Opcode::KillContainer,
            &KillDef {
                container: container.to_string(),
                signal: signum as u32,
            },
        )
        .await?;
    client.bye().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle_protocol::control::{read_message, write_message, ControlMessage};
    use cradle_protocol::types::HyperDef;
    use std::time::Duration;
    use tokio::net::UnixListener;

    /// Answers every command with Ok and records Hyper bodies.
    fn fake_proxy(listener: UnixListener) -> mpsc::UnboundedReceiver<HyperDef> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        let msg = match read_message(&mut stream).await {
                            Ok(msg) => msg,
                            Err(_) => return,
                        };
                        if msg.opcode == Opcode::Hyper {
                            if let Ok(def) = msg.parse_body::<HyperDef>() {
                                let _ = tx.send(def);
                            }
                        }
                        let reply = ControlMessage::empty(Opcode::Ok, msg.corr);
                        if write_message(&mut stream, &reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        rx
    }

    #[test]
    fn test_uncatchable_signals_stay_with_the_runtime() {
        assert!(!FORWARDED_SIGNALS.contains(&libc::SIGKILL));
        assert!(!FORWARDED_SIGNALS.contains(&libc::SIGSTOP));
        // Everything the runtime's kill path can route through the shim
        // must have a handler entry.
        for signum in [
            libc::SIGCONT,
            libc::SIGABRT,
            libc::SIGTRAP,
            libc::SIGBUS,
            libc::SIGCHLD,
            libc::SIGURG,
            libc::SIGXCPU,
            libc::SIGXFSZ,
            libc::SIGVTALRM,
            libc::SIGPROF,
            libc::SIGIO,
            libc::SIGSYS,
        ] {
            assert!(FORWARDED_SIGNALS.contains(&signum), "missing signal {}", signum);
        }
    }

    #[tokio::test]
    async fn test_forward_sends_kill_container() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("proxy.sock");
        let mut hypers = fake_proxy(UnixListener::bind(&sock).unwrap());

        forward(&sock, "tok-1", "c1", libc::SIGCONT).await.unwrap();

        let def = hypers.recv().await.expect("Hyper must reach the proxy");
        assert_eq!(def.op, Opcode::KillContainer.as_u32());
        let kill: KillDef = serde_json::from_value(def.data).unwrap();
        assert_eq!(kill.container, "c1");
        assert_eq!(kill.signal, libc::SIGCONT as u32);
    }

    #[tokio::test]
    async fn test_raised_signal_reaches_the_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("proxy.sock");
        let mut hypers = fake_proxy(UnixListener::bind(&sock).unwrap());

        spawn_forwarders(sock.clone(), "tok-1".to_string(), "c1".to_string());
        // Let the handler tasks install before raising.
        tokio::time::sleep(Duration::from_millis(100)).await;

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGWINCH).unwrap();

        let def = tokio::time::timeout(Duration::from_secs(5), hypers.recv())
            .await
            .expect("raised signal must be forwarded")
            .unwrap();
        assert_eq!(def.op, Opcode::KillContainer.as_u32());
        let kill: KillDef = serde_json::from_value(def.data).unwrap();
        assert_eq!(kill.signal, libc::SIGWINCH as u32);
    }
}
