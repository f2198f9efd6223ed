use bookmarkd::{Config, Daemon, RpcServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Local bookmark daemon", long_about = None)]
struct Args {
    /// Profile directory holding config.toml, the database and the socket
    #[arg(short, long, default_value = ".")]
    profile: PathBuf,

    /// Config file to use instead of <profile>/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the socket path from the config
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_profile(&args.profile)?,
    };
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting bookmarkd for profile {:?}", config.profile_name);
    std::fs::create_dir_all(&config.profile_dir)?;

    let daemon = Arc::new(Daemon::open(&config)?);
    let tree = daemon.get_tree().await?;
    info!("Loaded {} nodes at version {}", tree.nodes.len(), tree.version);

    let mut server = RpcServer::new(config.server.max_frame_bytes);
    daemon.register_handlers(&server);
    server.start(config.socket_path()).await?;
    info!("bookmarkd running on {:?}", config.socket_path());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    server.stop().await;

    info!("Shutdown complete");
    Ok(())
}
