use clap::{Parser, Subcommand};
use cradle_proxy::{ProxyServer, DEFAULT_HYPER_TIMEOUT_SECS, DEFAULT_SOCKET_PATH};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cradle-proxy")]
#[command(about = "Cradle proxy - multiplexes agent channels for all VMs on this host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy daemon
    Start {
        /// Path of the command socket
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,

        /// Agent reply timeout in seconds
        #[arg(long, default_value_t = DEFAULT_HYPER_TIMEOUT_SECS)]
        hyper_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cradle=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            socket,
            hyper_timeout,
        } => {
            let server = ProxyServer::bind(&socket, Duration::from_secs(hyper_timeout))?;

            server
                .serve_with_shutdown(async {
                    signal::ctrl_c().await.expect("failed to listen for ctrl-c");
                    tracing::info!("Received shutdown signal, stopping proxy...");
                })
                .await?;

            if socket.exists() {
                let _ = std::fs::remove_file(&socket);
            }
        }
    }

    Ok(())
}
