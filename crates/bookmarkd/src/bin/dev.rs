use bookmarkd::types::Tab;
use bookmarkd::{Config, Daemon, Operation, ROOT_ID, RpcServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a throwaway bookmarkd for development", long_about = None)]
struct Args {
    /// Profile directory (a temporary one is used when omitted)
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Populate the tree with sample folders and bookmarks
    #[arg(long)]
    seed: bool,

    /// Version the profile with git
    #[arg(long)]
    git: bool,
}

fn sample_ops() -> Vec<Operation> {
    vec![
        Operation::AddFolder {
            parent_id: ROOT_ID.to_string(),
            title: "Reading".to_string(),
            index: None,
        },
        Operation::AddBookmark {
            parent_id: ROOT_ID.to_string(),
            title: "Rust".to_string(),
            url: "https://www.rust-lang.org/".to_string(),
            index: None,
        },
        Operation::SaveSession {
            parent_id: ROOT_ID.to_string(),
            title: "Session".to_string(),
            tabs: vec![
                Tab {
                    title: "docs.rs".to_string(),
                    url: "https://docs.rs/".to_string(),
                },
                Tab {
                    title: "crates.io".to_string(),
                    url: "https://crates.io/".to_string(),
                },
            ],
            index: Some(0),
        },
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let args = Args::parse();

    // Keep alive to prevent cleanup
    let (profile_dir, _temp_dir) = match args.profile {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            (dir, None)
        }
        None => {
            let temp = TempDir::new()?;
            (temp.path().to_path_buf(), Some(temp))
        }
    };

    let mut config = Config::load_profile(&profile_dir)?;
    config.vcs.enabled |= args.git;
    info!("Profile directory: {:?}", config.profile_dir);

    let daemon = Arc::new(Daemon::open(&config)?);
    if args.seed {
        let outcome = daemon.apply_ops(sample_ops()).await?;
        info!(
            "Seeded {} nodes (version {}, pending {})",
            outcome.tree.nodes.len(),
            outcome.tree.version,
            outcome.vcs_status.pending
        );
    }

    let mut server = RpcServer::new(config.server.max_frame_bytes);
    daemon.register_handlers(&server);
    server.start(config.socket_path()).await?;
    info!("Listening on {:?}. Press Ctrl+C to stop.", config.socket_path());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    server.stop().await;

    info!("Shutdown complete");
    Ok(())
}
