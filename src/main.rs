use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use librum::driver::{self, Mode};
use librum::{Contact, Node};

#[derive(Parser, Debug)]
#[command(name = "librum")]
#[command(author, version, about = "Peer-to-peer pub/sub chat", long_about = None)]
struct Args {
    /// UDP port to listen on.
    #[arg(long, default_value_t = librum::DEFAULT_PORT)]
    port: u16,

    /// Bootstrap peers, comma separated (format: IP:PORT/HEXID).
    #[arg(long, value_delimiter = ',', value_name = "PEERS")]
    peers: Vec<Contact>,

    #[arg(long, default_value = "librum")]
    topic: String,

    /// `pub`/`publish` reads stdin, `sub`/`subscribe` prints messages, anything else idles.
    #[arg(long, default_value = "")]
    mode: String,

    /// Seconds between rendezvous announcements.
    #[arg(long, value_name = "SECS")]
    announce_interval: Option<u64>,

    /// Seconds between multicast announcements.
    #[arg(long, value_name = "SECS")]
    local_discovery_interval: Option<u64>,

    #[arg(long)]
    no_local_discovery: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_from(driver::normalize_args(std::env::args()));
    driver::init_tracing();

    let mut config = driver::node_config(args.port, &args.topic);
    config.discovery.local_discovery = !args.no_local_discovery;
    if let Some(secs) = args.announce_interval {
        config.discovery.announce_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.local_discovery_interval {
        config.discovery.local_discovery_interval = Duration::from_secs(secs);
    }

    let node = Node::bind(config).context("failed to start node")?;
    driver::print_banner(&node);

    info!(peers = args.peers.len(), "bootstrapping");
    if let Err(e) = node.start(&args.peers).await {
        node.shutdown().await;
        return Err(e).context("bootstrap failed");
    }

    driver::run(&node, &args.topic, Mode::parse(&args.mode)).await
}
