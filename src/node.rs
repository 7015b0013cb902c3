//! # Node
//!
//! A [`Node`] wires the transport, routing table, discovery and gossip layers
//! together and owns the cancellation token every background task listens to.
//!
//! ```ignore
//! let node = Node::bind(NodeConfig::default())?;
//! node.start(&seeds).await?;
//!
//! let topic = node.join("librum").await?;
//! let mut sub = topic.subscribe().await?;
//! topic.publish("hello").await?;
//! while let Some(msg) = sub.next().await {
//!     println!("{}, from: {}", msg.text(), msg.source);
//! }
//! node.shutdown().await;
//! ```
//!
//! Background tasks: QUIC listener, connection manager, DHT maintenance, gossip
//! heartbeat, rendezvous loop, multicast listener and announcer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::dht::{DhtConfig, DhtNode};
use crate::discovery::{Discovery, DiscoveryConfig, DiscoveryState, PeerFound};
use crate::error::{DiscoveryError, MessageRejection, StartupError};
use crate::gossipsub::{self, GossipSub, GossipSubConfig};
use crate::identity::{Contact, Identity, Keypair};
use crate::protocols::{DhtNodeRpc, PeerSource};
use crate::rpc::RpcNode;
use crate::transport::Transport;

pub type Topic = gossipsub::Topic<RpcNode>;

pub const DEFAULT_PORT: u16 = 7654;

/// A rediscovered peer is not dialed again within this window.
const REDIAL_AFTER: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// `IP:PORT` to bind.
    pub listen_addr: String,
    pub dht: DhtConfig,
    pub gossip: GossipSubConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT).to_string(),
            dht: DhtConfig::default(),
            gossip: GossipSubConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }
}

pub struct Node {
    keypair: Keypair,
    transport: Transport,
    contact: Contact,
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    gossip: GossipSub<RpcNode>,
    discovery: Discovery<RpcNode>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind with a fresh identity.
    pub fn bind(config: NodeConfig) -> Result<Self, StartupError> {
        Self::bind_with_keypair(config, Keypair::generate())
    }

    /// Must be called inside a tokio runtime.
    pub fn bind_with_keypair(config: NodeConfig, keypair: Keypair) -> Result<Self, StartupError> {
        let transport = Transport::listen(&keypair, &config.listen_addr)?;
        let local_addr = transport
            .local_addr()
            .map_err(|_| StartupError::InvalidListenAddress(config.listen_addr.clone()))?;
        let contact = keypair.contact(routable_addresses(local_addr));

        let cancel = CancellationToken::new();
        let rpc = RpcNode::new(transport.clone(), contact.clone());
        let dht = DhtNode::new(contact.clone(), rpc.clone(), config.dht);
        let peer_source: Arc<dyn PeerSource> = Arc::new(dht.clone());
        let gossip = GossipSub::spawn(
            Arc::new(rpc.clone()),
            keypair.clone(),
            config.gossip,
            Some(peer_source),
            cancel.child_token(),
        );
        let (discovery, peers_rx) = Discovery::new(dht.clone(), keypair.clone(), config.discovery);

        dht.spawn_maintenance(cancel.child_token());
        let tasks = vec![
            spawn_listener(transport.clone(), rpc.clone(), dht.clone(), gossip.clone(), cancel.clone()),
            spawn_connection_manager(peers_rx, rpc.clone(), dht.clone(), gossip.clone(), cancel.clone()),
        ];

        info!(id = %keypair.identity().short(), addr = %local_addr, "node bound");

        Ok(Self {
            keypair,
            transport,
            contact,
            rpc,
            dht,
            gossip,
            discovery,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Start local discovery, bootstrap from `seeds`, then keep announcing on the rendezvous.
    ///
    /// Fails only if seeds were given and none answered.
    pub async fn start(&self, seeds: &[Contact]) -> Result<(), DiscoveryError> {
        self.discovery
            .spawn_local(self.contact.addrs.clone(), self.cancel.child_token());
        self.discovery.bootstrap(seeds, &self.cancel).await?;
        self.discovery.spawn_rendezvous(self.cancel.child_token());
        Ok(())
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Addresses advertised to peers.
    pub fn addresses(&self) -> &[String] {
        &self.contact.addrs
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// `IP:PORT/HEXID` for the first advertised address.
    pub fn bootstrap_string(&self) -> Option<String> {
        self.contact.bootstrap_string()
    }

    pub async fn join(&self, topic: &str) -> Result<Topic, MessageRejection> {
        self.gossip.join(topic).await
    }

    pub fn discovery_state(&self) -> watch::Receiver<DiscoveryState> {
        self.discovery.state()
    }

    pub fn local_discovery_active(&self) -> bool {
        self.discovery.local_discovery_active()
    }

    /// Up to `count` routing-table entries closest to this node.
    pub fn known_peers(&self, count: usize) -> Vec<Contact> {
        self.dht.lookup(&self.identity(), count)
    }

    /// Dial `contact` directly and, on success, treat it as a discovered peer.
    pub async fn connect(&self, contact: &Contact) -> anyhow::Result<()> {
        connect_peer(&self.rpc, &self.dht, &self.gossip, contact.clone()).await
    }

    /// Token cancelled by [`Node::shutdown`]; hand it to tasks that should stop with the node.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        self.gossip.quit().await;
        self.rpc.quit().await;
        self.transport.close();
        debug!(id = %self.identity().short(), "node shut down");
    }
}

fn spawn_listener(
    transport: Transport,
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    gossip: GossipSub<RpcNode>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = transport.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            let rpc = rpc.clone();
            let dht = dht.clone();
            let gossip = gossip.clone();
            tokio::spawn(async move {
                if let Err(e) = rpc.serve(dht, gossip, incoming).await {
                    debug!(error = %e, "connection ended with error");
                }
            });
        }
        trace!("listener stopped");
    })
}

/// Dial every discovered peer; only peers that answer enter the routing table and gossip.
fn spawn_connection_manager(
    mut peers_rx: mpsc::Receiver<PeerFound>,
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    gossip: GossipSub<RpcNode>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cap = NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN);
        let mut recent: LruCache<Identity, Instant> = LruCache::new(cap);
        loop {
            let found = tokio::select! {
                _ = cancel.cancelled() => break,
                found = peers_rx.recv() => match found {
                    Some(found) => found,
                    None => break,
                },
            };

            let peer = found.contact.identity;
            if peer == rpc.self_contact().identity {
                continue;
            }
            if recent.peek(&peer).is_some_and(|at| at.elapsed() < REDIAL_AFTER) {
                trace!(peer = %peer.short(), "recently dialed, skipping");
                continue;
            }
            recent.put(peer, Instant::now());

            let rpc = rpc.clone();
            let dht = dht.clone();
            let gossip = gossip.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = connect_peer(&rpc, &dht, &gossip, found.contact) => {
                        if let Err(e) = result {
                            debug!(peer = %peer.short(), source = ?found.source, error = %e, "discovered peer unreachable");
                        }
                    }
                }
            });
        }
        trace!("connection manager stopped");
    })
}

async fn connect_peer(
    rpc: &RpcNode,
    dht: &DhtNode<RpcNode>,
    gossip: &GossipSub<RpcNode>,
    mut contact: Contact,
) -> anyhow::Result<()> {
    rpc.ping(&contact).await?;
    contact.touch();
    debug!(peer = %contact.identity.short(), "connected to peer");
    dht.observe_contact(contact.clone()).await;
    gossip.add_peer(contact).await;
    Ok(())
}

/// Addresses peers can reach us on. An unspecified bind expands to the
/// outbound interface address plus loopback.
pub fn routable_addresses(local: SocketAddr) -> Vec<String> {
    let ip = local.ip();
    let port = local.port();
    if !ip.is_unspecified() {
        return vec![local.to_string()];
    }

    let mut addresses = Vec::new();
    let probes: &[(&str, &str)] = if ip.is_ipv4() {
        &[("0.0.0.0:0", "8.8.8.8:53"), ("0.0.0.0:0", "1.1.1.1:53")]
    } else {
        &[("[::]:0", "[2001:4860:4860::8888]:53"), ("[::]:0", "[2606:4700:4700::1111]:53")]
    };
    // A connected UDP socket reveals the interface address without sending anything.
    for (bind, target) in probes {
        if let Ok(socket) = std::net::UdpSocket::bind(bind)
            && socket.connect(target).is_ok()
            && let Ok(probed) = socket.local_addr()
        {
            let probed_ip = probed.ip();
            if !probed_ip.is_loopback() && !probed_ip.is_unspecified() {
                let addr = SocketAddr::new(probed_ip, port).to_string();
                if !addresses.contains(&addr) {
                    addresses.push(addr);
                }
            }
        }
    }

    let loopback = if ip.is_ipv4() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
    };
    addresses.push(SocketAddr::new(loopback, port).to_string());
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_bind_is_advertised_as_is() {
        let addr: SocketAddr = "192.168.1.10:7654".parse().unwrap();
        assert_eq!(routable_addresses(addr), vec!["192.168.1.10:7654".to_string()]);
    }

    #[test]
    fn unspecified_bind_includes_loopback() {
        let addr: SocketAddr = "0.0.0.0:7654".parse().unwrap();
        let addrs = routable_addresses(addr);
        assert_eq!(addrs.last().map(String::as_str), Some("127.0.0.1:7654"));
        assert!(addrs.iter().all(|a| a.ends_with(":7654")));
        assert!(addrs.iter().all(|a| !a.starts_with("0.0.0.0")));
    }

    #[test]
    fn default_config_listens_on_default_port() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:7654");
        let custom = NodeConfig::default().with_listen_addr("127.0.0.1:0");
        assert_eq!(custom.listen_addr, "127.0.0.1:0");
    }

    #[tokio::test]
    async fn bind_reports_startup_errors() {
        let err = Node::bind(NodeConfig::default().with_listen_addr("not-an-addr"))
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::InvalidListenAddress(_)));
    }

    #[tokio::test]
    async fn node_without_seeds_reaches_steady() {
        let mut config = NodeConfig::default().with_listen_addr("127.0.0.1:0");
        config.discovery.local_discovery = false;
        let node = Node::bind(config).unwrap();

        assert_eq!(node.addresses().len(), 1);
        let bootstrap = node.bootstrap_string().unwrap();
        assert!(bootstrap.ends_with(&node.identity().to_hex()));

        node.start(&[]).await.unwrap();
        assert_eq!(*node.discovery_state().borrow(), DiscoveryState::Steady);
        assert!(!node.local_discovery_active());
        node.shutdown().await;
    }
}
