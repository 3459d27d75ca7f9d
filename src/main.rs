//! gossipd: run a gossip node
//!
//! Starts a node with an in-memory chain and transaction pool, persists its
//! peers under the data directory and runs until Ctrl+C.

use clap::Parser;
use gossip_node::config::NodeConfig;
use gossip_node::core::{MemoryChain, MemoryTxPool};
use gossip_node::network::Node;
use gossip_node::storage::FileStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gossipd")]
#[command(author = "Darshan")]
#[command(version)]
#[command(about = "Gossip protocol node for a blockchain network", long_about = None)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Seed for a deterministic peer id
    #[arg(long)]
    seed: Option<u64>,

    /// Comma separated bootstrap nodes (<peer-id>@<ip>:<port>)
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Run on the development network
    #[arg(long)]
    dev: bool,

    /// Data directory for peer persistence
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(bootstrap) = &self.bootstrap {
            config.bootstrap_nodes = bootstrap
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if self.dev {
            config.dev_mode = true;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.node_config()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = FileStore::open(&config.data_dir)?;
        let node = Node::new(
            config,
            Arc::new(MemoryChain::new()),
            Arc::new(MemoryTxPool::new()),
            Arc::new(store),
        )
        .await?;

        node.start().await;
        log::info!("Node {} listening on {}", node.id(), node.address());

        tokio::signal::ctrl_c().await?;
        log::info!("Shutting down node...");
        node.stop().await;

        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}
