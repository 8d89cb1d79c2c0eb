mod commands;

use clap::{Parser, Subcommand};
use commands::{list, load_process_spec};
use cradle_runtime::{Orchestrator, RuntimeConfig, RuntimeError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cradle")]
#[command(about = "Cradle - run OCI containers inside dedicated VMs")]
struct Cli {
    /// Root directory for container state
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Proxy command socket
    #[arg(long, global = true)]
    proxy_sock: Option<PathBuf>,

    /// Shim binary
    #[arg(long, global = true)]
    shim_path: Option<PathBuf>,

    /// Hypervisor binary
    #[arg(long, global = true)]
    hypervisor: Option<PathBuf>,

    /// Guest kernel
    #[arg(long, global = true)]
    kernel: Option<PathBuf>,

    /// Guest image
    #[arg(long, global = true)]
    image: Option<PathBuf>,

    /// Helper run inside the netns to bridge veths to taps
    #[arg(long, global = true)]
    network_helper: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container from an OCI bundle
    Create {
        id: String,

        /// Path to the OCI bundle directory
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Start a created container
    Start { id: String },
    /// Run an additional process in a running container
    Exec {
        id: String,

        /// Path to an OCI process document
        #[arg(long)]
        process: PathBuf,
    },
    /// Send a signal to a container
    Kill {
        id: String,

        /// Signal name or number
        #[arg(default_value = "TERM")]
        signal: String,
    },
    /// Delete a container and release its VM
    Delete { id: String },
    /// Show the state of a container
    State { id: String },
    /// List containers under the state root
    List {
        /// Output format: table or json
        #[arg(long, short, default_value = "table")]
        format: String,

        /// Display only container IDs
        #[arg(long, short)]
        quiet: bool,

        /// Display hypervisor asset columns and staleness
        #[arg(long)]
        show_all: bool,
    },
}

fn build_config(cli: &Cli) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(sock) = &cli.proxy_sock {
        config.proxy_sock = sock.clone();
    }
    if let Some(shim) = &cli.shim_path {
        config.shim_path = shim.clone();
    }
    if let Some(hypervisor) = &cli.hypervisor {
        config.hypervisor_path = hypervisor.clone();
    }
    if let Some(kernel) = &cli.kernel {
        config.kernel_path = kernel.clone();
    }
    if let Some(image) = &cli.image {
        config.image_path = image.clone();
    }
    config.network_helper = cli.network_helper.clone();
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let orchestrator = Orchestrator::new(build_config(&cli));

    match run(&cli.command, &orchestrator).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(command: &Commands, orchestrator: &Orchestrator) -> Result<i32, RuntimeError> {
    match command {
        Commands::Create { id, bundle } => {
            orchestrator.create(id, bundle).await?;
        }
        Commands::Start { id } => {
            orchestrator.start(id).await?;
        }
        Commands::Exec { id, process } => {
            let spec = load_process_spec(process)?;
            // Exec's exit code is the guest process's exit code.
            return orchestrator.exec(id, spec).await;
        }
        Commands::Kill { id, signal } => {
            orchestrator.kill(id, signal).await?;
        }
        Commands::Delete { id } => {
            orchestrator.delete(id).await?;
        }
        Commands::State { id } => {
            let state = orchestrator.state(id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::List {
            format,
            quiet,
            show_all,
        } => {
            let rows = orchestrator.list().await?;
            if *quiet {
                print!("{}", list::render_quiet(&rows));
            } else {
                match format.as_str() {
                    "table" => print!("{}", list::render_table(&rows, *show_all)),
                    "json" => println!("{}", list::render_json(&rows)?),
                    other => {
                        return Err(RuntimeError::BadRequest(format!(
                            "invalid format option {}, expected table or json",
                            other
                        )))
                    }
                }
            }
        }
    }
    Ok(0)
}
