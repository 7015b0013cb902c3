//! Console helpers shared by the `librum` and `bootstrap-publisher` binaries.
//!
//! stdout is the chat surface: the startup banner, the publish prompt and
//! received messages. Logs go to stderr.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::gossipsub::{Subscription, Topic};
use crate::messages::Message;
use crate::node::{Node, NodeConfig};
use crate::protocols::GossipSubRpc;

pub const PUBLISH_PROMPT: &str = "enter message to publish:";

/// What the peer does with its topic once it is up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Publish,
    Subscribe,
    Idle,
}

impl Mode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pub" | "publish" => Mode::Publish,
            "sub" | "subscribe" => Mode::Subscribe,
            _ => Mode::Idle,
        }
    }
}

/// Rewrite single-dash long flags (`-port 7654`, `-peers=a,b`) to their `--` form.
///
/// Short flags (`-h`) and everything after a bare `--` are left alone.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (i, arg) in args.into_iter().enumerate() {
        if i == 0 || passthrough {
            out.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        let name_len = arg.split('=').next().map_or(0, str::len);
        if arg.starts_with('-') && !arg.starts_with("--") && name_len > 2 {
            out.push(format!("-{arg}"));
        } else {
            out.push(arg);
        }
    }
    out
}

/// Listen on `0.0.0.0:port` and rendezvous on the chat topic itself.
pub fn node_config(port: u16, topic: &str) -> NodeConfig {
    let mut config = NodeConfig::default().with_listen_addr(format!("0.0.0.0:{port}"));
    config.discovery.rendezvous = topic.to_string();
    config
}

/// `fmt` subscriber on stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}

pub fn banner(node: &Node) -> Vec<String> {
    let mut lines = vec![format!("host ID {}", node.identity())];
    lines.extend(node.addresses().iter().cloned());
    if let Some(bootstrap) = node.bootstrap_string() {
        lines.push(bootstrap);
    }
    lines
}

pub fn print_banner(node: &Node) {
    for line in banner(node) {
        println!("{line}");
    }
}

pub fn format_received(msg: &Message) -> String {
    format!("{}, from: {}", msg.text(), msg.source)
}

/// Feed stdin lines into a channel from a plain thread.
///
/// A blocked stdin read can't be cancelled, so it lives outside the runtime
/// and the receiver side is what gets dropped on shutdown.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Publish each line verbatim, skipping empty ones, until the input ends or `cancel` fires.
pub async fn publish_loop<N: GossipSubRpc>(
    topic: &Topic<N>,
    mut lines: mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        prompt()?;
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            debug!("stdin closed");
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }
        if let Err(e) = topic.publish(line.into_bytes()).await {
            warn!(topic = topic.name(), error = %e, "publish failed");
        }
    }
}

/// Print every received message until the subscription ends.
pub async fn print_loop(mut sub: Subscription) {
    while let Some(msg) = sub.next().await {
        println!("{}", format_received(&msg));
    }
}

/// Join `topic`, run `mode` until Ctrl-C or stdin ends, then shut the node down.
pub async fn run(node: &Node, topic: &str, mode: Mode) -> Result<()> {
    let topic = node
        .join(topic)
        .await
        .with_context(|| format!("failed to join topic {topic:?}"))?;
    let cancel = node.cancel_token();

    let work = async {
        match mode {
            Mode::Publish => publish_loop(&topic, spawn_stdin_reader(), &cancel).await,
            Mode::Subscribe => {
                let sub = topic.subscribe().await.context("failed to subscribe")?;
                print_loop(sub).await;
                Ok(())
            }
            Mode::Idle => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    };

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
            Ok(())
        }
        r = work => r,
    };

    node.shutdown().await;
    result
}

fn prompt() -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{PUBLISH_PROMPT}").context("write prompt")?;
    out.flush().context("flush stdout")
}
