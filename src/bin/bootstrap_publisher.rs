//! Seedless publisher: comes up on an ephemeral port, finds peers over local
//! multicast and the rendezvous, and publishes stdin lines.

use anyhow::{Context, Result};
use clap::Parser;

use librum::driver::{self, Mode};
use librum::Node;

#[derive(Parser, Debug)]
#[command(name = "bootstrap-publisher")]
#[command(author, version, about = "Publish stdin to a librum topic", long_about = None)]
struct Args {
    /// UDP port to listen on; 0 picks an ephemeral one.
    #[arg(long, default_value_t = 0)]
    port: u16,

    #[arg(long, default_value = "librum")]
    topic: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_from(driver::normalize_args(std::env::args()));
    driver::init_tracing();

    let mut config = driver::node_config(args.port, &args.topic);
    config.discovery.local_discovery = true;

    let node = Node::bind(config).context("failed to start node")?;
    driver::print_banner(&node);

    node.start(&[]).await.context("discovery failed")?;

    driver::run(&node, &args.topic, Mode::Publish).await
}
