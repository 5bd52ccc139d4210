use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use mpas_core::config::ServerConfig;
use mpas_engine::serve;
use mpas_engine::server::Server;
use mpas_engine::snapshot;

use crate::logging::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "mpas",
    version,
    about = "Cluster-autoscaler cloud provider for Multipass VMs"
)]
struct Cli {
    /// Path to the server configuration file
    #[arg(
        long,
        default_value = "/etc/default/multipass-cluster-autoscaler.json"
    )]
    config: PathBuf,

    /// Snapshot file for persisted state (omit to disable persistence)
    #[arg(long)]
    save: Option<PathBuf>,

    /// Directory for cloud-init and kubelet helper files
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Log output format: human or json
    #[arg(long, default_value = "human")]
    log_format: LogFormat,
}

/// Parse arguments, build or restore the server, reconcile with the cluster,
/// then serve until shutdown.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_format);

    let config = ServerConfig::from_file(&cli.config)?;

    let cache_dir = match cli.cache_dir {
        Some(dir) => dir,
        None => default_cache_dir()?,
    };
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create cache directory: {}", cache_dir.display()))?;

    let server = build_server(config, cache_dir, cli.save)?;
    let server = Arc::new(server);

    // Reconcile the in-memory model with whatever the cluster already has
    // before accepting requests. Foreign nodes come in scale-down protected.
    server.auto_discover_all(true);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to build tokio runtime")?;

    runtime.block_on(serve::serve(server))
}

/// Fresh server, or one restored from the snapshot when it exists. A fresh
/// server is persisted immediately so restarts are idempotent.
fn build_server(
    config: ServerConfig,
    cache_dir: PathBuf,
    snapshot_path: Option<PathBuf>,
) -> Result<Server> {
    match snapshot_path {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Restoring server from snapshot");
            let doc = snapshot::load(&path)?;
            let server = Server::from_document(doc, config, cache_dir, Some(path))?;
            Ok(server)
        }
        Some(path) => {
            info!(path = %path.display(), "No snapshot found, starting fresh");
            let server = Server::new(config, cache_dir, Some(path));
            server.save_snapshot();
            Ok(server)
        }
        None => Ok(Server::new(config, cache_dir, None)),
    }
}

/// User cache directory: `$XDG_CACHE_HOME/mpas`, else `$HOME/.cache/mpas`.
fn default_cache_dir() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME")
        && !xdg.is_empty()
    {
        return Ok(PathBuf::from(xdg).join("mpas"));
    }

    let home = std::env::var("HOME").with_context(|| "Neither XDG_CACHE_HOME nor HOME is set")?;
    Ok(PathBuf::from(home).join(".cache").join("mpas"))
}
