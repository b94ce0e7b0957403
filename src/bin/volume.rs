use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use needlefs::directory::HttpDirectoryClient;
use needlefs::replication::HttpReplicaClient;
use needlefs::server::StorageNode;
use needlefs::{Config, DirectoryResolver, ReplicationCoordinator, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "needlefs-volume")]
#[command(about = "needlefs storage node - serves needle volumes over HTTP")]
#[command(version = needlefs::BUILD_INFO)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load local volumes and serve requests
    Serve {
        /// Path to the node configuration file (TOML)
        #[arg(short, long, default_value = "node.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Serve { config } => serve(&config).await,
    }
}

async fn serve(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting needlefs storage node {}", needlefs::VERSION);
    tracing::info!("node url: {}", config.node.url());
    tracing::info!("public url: {}", config.node.public_url());
    for dir in &config.store.dirs {
        tracing::info!("store dir: {} (max {} volumes)", dir.path.display(), dir.max_volumes);
    }

    let store = Arc::new(Store::from_config(&config)?);
    store.load_all();
    store.spawn_disk_space_monitors();

    let resolver = Arc::new(DirectoryResolver::new(
        Arc::new(HttpDirectoryClient::new(config.directory.endpoints.clone())),
        Duration::from_secs(config.directory.lookup_ttl_secs),
    ));
    let coordinator = Arc::new(ReplicationCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&resolver),
        Arc::new(HttpReplicaClient::new()),
    ));

    let node = StorageNode::new(&config, Arc::clone(&store), resolver, coordinator)?;
    let bind_addr = format!("0.0.0.0:{}", config.node.port);

    let result = needlefs::server::serve(node, &bind_addr).await;
    store.close();
    result?;
    Ok(())
}
