use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use network::Network;
use node::{ChainValidator, Node, NodeConfig, Storage, SyncContext, TcpConnector};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "btc-sync-node", about = "Headers-first Bitcoin block sync node")]
struct Cli {
    /// TOML config file. Flags override its values.
    #[arg(long, env = "BTC_SYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Peer to sync from, as ip:port. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long, env = "BTC_SYNC_NETWORK")]
    network: Option<Network>,
    #[arg(long, env = "BTC_SYNC_DB_PATH")]
    db_path: Option<PathBuf>,
    /// Used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if !cli.peers.is_empty() {
        config.peers = cli.peers;
    }
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    config.validate().context("invalid configuration")?;

    let storage = Arc::new(Storage::open(&config.db_path).context("failed to open block store")?);
    let genesis_hash = config.network.genesis_hash();
    let context = SyncContext {
        repository: storage.clone(),
        validator: Arc::new(ChainValidator::new(storage.clone(), genesis_hash)),
        genesis_hash,
        sync_wait: config.sync_wait(),
        channel_capacity: config.channel_capacity,
    };
    let connector = TcpConnector::new(config.handshake(), context);
    let node = Node::new(connector, &config).context("failed to create node")?;

    node.start().context("failed to start node")?;
    info!(network = %config.network, peers = config.peers.len(), "node online");
    signal::ctrl_c()
        .await
        .context("failed to install signal handler")?;
    info!("shutting down");
    node.stop().await;
    storage.flush().context("failed to flush block store")?;
    Ok(())
}
