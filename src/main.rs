//! Lattice Server - single-node control-plane bootstrap

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lattice_server::config::ServerArgs;
use lattice_server::control::ProcessControlPlane;
use lattice_server::deploy::{FileManifestDeployer, KubeApplier};
use lattice_server::frontend::TlsFrontendLauncher;
use lattice_server::{start_server, Collaborators, DEFAULT_PRODUCT_NAME};

/// Lattice - single-node cluster server
#[derive(Parser, Debug)]
#[command(name = "lattice-server", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the management server
    ///
    /// Prepares the data directory, starts the control plane and the HTTPS
    /// front-end, then writes the node token and an admin kubeconfig once the
    /// server CA exists.
    Server(ServerArgs),
}

/// Product name shown in operator instructions, taken from how we were invoked
fn product_name() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_PRODUCT_NAME.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let applier = KubeApplier::new(args.apply_kubeconfig.clone());
    let config = args.into_config(product_name())?;

    let collaborators = Collaborators::new(
        Arc::new(ProcessControlPlane::new()),
        Arc::new(TlsFrontendLauncher::new()),
        Arc::new(FileManifestDeployer::new(Arc::new(applier))),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    start_server(cancel.clone(), &config, &collaborators).await?;
    info!(port = config.tls.https_port, "Lattice server is running");

    cancel.cancelled().await;
    info!("Lattice server stopped");
    Ok(())
}
