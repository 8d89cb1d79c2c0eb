use clap::Parser;
use cradle_protocol::control::Opcode;
use cradle_protocol::types::ProcessExitedInfo;
use cradle_protocol::ProxyClient;
use cradle_shim::{bridge, handoff, signals, ShimError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cradle-shim")]
#[command(about = "Cradle shim - stands in for the container init on the host")]
struct Cli {
    /// Path of the proxy command socket
    #[arg(long)]
    proxy_sock: PathBuf,

    /// Token of the VM hosting the container
    #[arg(long)]
    token: String,

    /// Container (or exec) id this shim fronts
    #[arg(long)]
    container: String,

    /// FIFO the runtime writes the proceed byte to
    #[arg(long)]
    proceed: PathBuf,

    /// Log destination; stdio belongs to the container, so logs go to a
    /// file or nowhere
    #[arg(long)]
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(path) = &cli.log {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(move || file.try_clone().expect("clone log file"))
                .init();
        }
    }

    match run(cli).await {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            tracing::error!(error = %e, "shim failed");
            std::process::exit(255);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, ShimError> {
    // Paused: block until the runtime delivers sequences and the stream
    // socketpair over fd 3.
    let handoff = handoff::receive().await?;

    let mut client = ProxyClient::connect(&cli.proxy_sock).await?;
    client.attach(&cli.token).await?;
    tracing::info!(token = %cli.token, container = %cli.container, "attached, waiting for release");

    // Still paused: no I/O is pumped until the runtime says go.
    if !handoff::wait_proceed(cli.proceed.clone()).await? {
        tracing::info!("runtime abandoned the container, exiting");
        return Ok(1);
    }

    signals::spawn_forwarders(
        cli.proxy_sock.clone(),
        cli.token.clone(),
        cli.container.clone(),
    );

    let bridge_task = bridge::run(handoff.stream, handoff.stdio_seq, handoff.stderr_seq);
    let exit_task = wait_exit(&mut client, &cli.container);

    // Neither half may be abandoned: the shim stays alive while either of
    // its sequences is live, and only exits once the status is known.
    let (bridge_result, status) = tokio::join!(bridge_task, exit_task);
    bridge_result?;
    let status = status?;

    tracing::info!(container = %cli.container, status, "container exited");
    Ok(status)
}

async fn wait_exit(client: &mut ProxyClient, container: &str) -> Result<i32, ShimError> {
    loop {
        let notif = client.next_notification().await?;
        if notif.opcode != Opcode::ProcessExited {
            continue;
        }
        let info: ProcessExitedInfo = notif.parse_body()?;
        if info.container == container {
            return Ok(info.status);
        }
    }
}
