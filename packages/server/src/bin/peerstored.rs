//! Peerstore service daemon.
//!
//! Loads an optional TOML configuration file, opens the configured
//! storage backend, and serves the engine until SIGINT or SIGTERM.
//! Exits zero on a clean shutdown and non-zero when startup fails.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use peerstore_server::{open_backend, BackendKind, Engine, ServiceConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "peerstored", about = "Peer-attribute store service")]
struct Args {
    /// Path of a TOML configuration file.
    #[arg(long, env = "PEERSTORED_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listening socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the storage backend name.
    #[arg(long)]
    database: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ServiceConfig::default(),
    };
    if let Some(socket) = &args.socket {
        config.socket.clone_from(socket);
    }
    if let Some(database) = &args.database {
        config.database.clone_from(database);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let kind: BackendKind = config
        .database
        .parse()
        .with_context(|| format!("selecting backend {:?}", config.database))?;
    let storage = open_backend(kind, &config).context("opening storage backend")?;

    let engine = Engine::bind(config, storage).context("binding engine")?;
    let shutdown = engine.shutdown_handle();

    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::error!(%err, "cannot install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        shutdown.trigger_drain();
    });

    engine.run().await;
    Ok(())
}
