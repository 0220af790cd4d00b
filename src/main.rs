use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use overworld_server::worldgen::GridMapGenerator;
use overworld_server::{ClientRegistry, Hub, HubConfig, ServerConfig};
use overworld_session::CliRuntime;

#[derive(Parser, Debug)]
#[command(name = "overworld", about = "Multi-agent repository exploration server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Data directory for realms, snapshots, and settings.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Command used to launch agent runtime processes.
    #[arg(long, default_value = "claude")]
    runtime_cmd: String,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data_dir = args
        .data_dir
        .unwrap_or_else(|| dirs_home().join(".overworld"));
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "cannot create data directory");
        std::process::exit(1);
    }

    tracing::info!(data_dir = %data_dir.display(), "Starting overworld server");

    let registry = Arc::new(ClientRegistry::new(256));
    let hub = Hub::new(
        HubConfig {
            data_dir,
            runtime: Arc::new(CliRuntime::new(args.runtime_cmd)),
            generator: Arc::new(GridMapGenerator::default()),
        },
        Arc::clone(&registry),
    )
    .await;
    let _pump = hub.start_signal_pump();

    let config = ServerConfig { port: args.port, ..ServerConfig::default() };
    let handle = match overworld_server::start(config, Arc::clone(&hub), registry).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    tracing::info!(port = handle.port, "Overworld server ready");

    // Wait for shutdown signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    }

    tracing::info!("Shutting down");
    hub.shutdown().await;
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
