//! # Bootstrap and Discovery
//!
//! Three ways a node finds peers:
//!
//! | Source | Mechanism | Cadence |
//! |--------|-----------|---------|
//! | Seeds | ping each `-peers` entry, then a self-lookup | once at startup |
//! | Rendezvous | provider records under `blake3(rendezvous)` | announce hourly, look up every 30 s |
//! | Local network | signed UDP multicast announcements | on startup, hourly, and in reply to new peers |
//!
//! Every peer found is reported as a [`PeerFound`] on a channel. Discovery never
//! dials on its own behalf; the node's connection manager does.
//!
//! The bootstrap state is observable through a `watch` channel:
//! `Idle -> Bootstrapping -> Steady`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lru::LruCache;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::crypto::{ANNOUNCE_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::dht::{DhtNode, Key};
use crate::error::DiscoveryError;
use crate::identity::{Contact, Identity, Keypair, now_ms};
use crate::messages::{self, LocalAnnouncement};
use crate::protocols::DhtNodeRpc;

/// Default rendezvous; the drivers use the chat topic instead.
pub const DEFAULT_RENDEZVOUS: &str = "librum";
/// Tag carried in multicast announcements; peers with another tag are ignored.
pub const DEFAULT_SERVICE_TAG: &str = "librum-pubsub";
pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 77), 7655);

const PEER_CHANNEL_SIZE: usize = 256;
const MAX_DATAGRAM: usize = 2048;
const SEEN_LOCAL_PEERS: usize = 1024;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Rendezvous string; its blake3 hash is the provider key.
    pub rendezvous: String,
    /// Multicast service tag, independent of the rendezvous.
    pub service_tag: String,
    pub announce_interval: Duration,
    /// Provider lookups between announcements, so late joiners are found.
    pub provider_lookup_interval: Duration,
    pub local_discovery: bool,
    pub multicast_group: SocketAddrV4,
    /// Interface to join the group on; unspecified lets the OS choose.
    pub multicast_interface: Ipv4Addr,
    pub local_discovery_interval: Duration,
    /// Announcements whose timestamp is further than this from our clock are dropped.
    pub announcement_max_skew: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rendezvous: DEFAULT_RENDEZVOUS.to_string(),
            service_tag: DEFAULT_SERVICE_TAG.to_string(),
            announce_interval: Duration::from_secs(60 * 60),
            provider_lookup_interval: Duration::from_secs(30),
            local_discovery: true,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            local_discovery_interval: Duration::from_secs(60 * 60),
            announcement_max_skew: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Bootstrapping,
    Steady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoverySource {
    Seed,
    Rendezvous,
    Multicast,
}

#[derive(Clone, Debug)]
pub struct PeerFound {
    pub contact: Contact,
    pub source: DiscoverySource,
}

pub fn rendezvous_key(rendezvous: &str) -> Key {
    *blake3::hash(rendezvous.as_bytes()).as_bytes()
}

pub struct Discovery<N: DhtNodeRpc> {
    dht: DhtNode<N>,
    keypair: Keypair,
    config: DiscoveryConfig,
    state_tx: Arc<watch::Sender<DiscoveryState>>,
    peers_tx: mpsc::Sender<PeerFound>,
    local_active: Arc<AtomicBool>,
}

impl<N: DhtNodeRpc> Clone for Discovery<N> {
    fn clone(&self) -> Self {
        Self {
            dht: self.dht.clone(),
            keypair: self.keypair.clone(),
            config: self.config.clone(),
            state_tx: self.state_tx.clone(),
            peers_tx: self.peers_tx.clone(),
            local_active: self.local_active.clone(),
        }
    }
}

impl<N: DhtNodeRpc> Discovery<N> {
    /// Returns the discovery handle and the receiving end of the peer-found channel.
    pub fn new(dht: DhtNode<N>, keypair: Keypair, config: DiscoveryConfig) -> (Self, mpsc::Receiver<PeerFound>) {
        let (state_tx, _) = watch::channel(DiscoveryState::Idle);
        let (peers_tx, peers_rx) = mpsc::channel(PEER_CHANNEL_SIZE);
        (
            Self {
                dht,
                keypair,
                config,
                state_tx: Arc::new(state_tx),
                peers_tx,
                local_active: Arc::new(AtomicBool::new(false)),
            },
            peers_rx,
        )
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn state(&self) -> watch::Receiver<DiscoveryState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> DiscoveryState {
        *self.state_tx.borrow()
    }

    pub fn local_discovery_active(&self) -> bool {
        self.local_active.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: DiscoveryState) {
        self.state_tx.send_replace(state);
    }

    async fn emit(&self, contact: Contact, source: DiscoverySource) {
        if contact.identity == self.keypair.identity() || contact.addrs.is_empty() {
            return;
        }
        let _ = self.peers_tx.send(PeerFound { contact, source }).await;
    }

    /// Probe every seed, seed the routing table with the live ones and run a self-lookup.
    ///
    /// With no seeds this node is a bootstrap node and goes straight to `Steady`.
    pub async fn bootstrap(&self, seeds: &[Contact], cancel: &CancellationToken) -> Result<(), DiscoveryError> {
        self.set_state(DiscoveryState::Bootstrapping);
        if seeds.is_empty() {
            info!("no seeds given, acting as a bootstrap node");
            self.set_state(DiscoveryState::Steady);
            return Ok(());
        }

        let mut probes = JoinSet::new();
        for seed in seeds.iter().filter(|s| s.identity != self.keypair.identity()).cloned() {
            let dht = self.dht.clone();
            probes.spawn(async move {
                let alive = dht.probe(&seed).await;
                (seed, alive)
            });
        }

        let mut live = Vec::new();
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(DiscoveryState::Idle);
                    return Err(DiscoveryError::Cancelled);
                }
                joined = probes.join_next() => joined,
            };
            match joined {
                Some(Ok((seed, true))) => {
                    debug!(peer = %seed.identity.short(), "seed answered");
                    live.push(seed);
                }
                Some(Ok((seed, false))) => {
                    warn!(peer = %seed.identity.short(), addr = ?seed.primary_addr(), "seed unreachable");
                }
                Some(Err(_)) => {}
                None => break,
            }
        }

        if live.is_empty() {
            self.set_state(DiscoveryState::Idle);
            return Err(DiscoveryError::NoSeedReachable(seeds.len()));
        }

        for seed in &live {
            self.dht.observe_contact(seed.clone()).await;
            self.emit(seed.clone(), DiscoverySource::Seed).await;
        }

        let found = self.dht.lookup_with_seeds(live, cancel).await;
        if cancel.is_cancelled() {
            self.set_state(DiscoveryState::Idle);
            return Err(DiscoveryError::Cancelled);
        }
        info!(found = found.len(), table = self.dht.routing().len(), "bootstrap complete");
        self.set_state(DiscoveryState::Steady);
        Ok(())
    }

    /// Register under the rendezvous key, then report every other provider.
    pub async fn announce(&self, cancel: &CancellationToken) -> usize {
        let key = rendezvous_key(&self.config.rendezvous);
        let stored = self.dht.add_provider(key, cancel).await;
        debug!(rendezvous = %self.config.rendezvous, stored, "announced rendezvous");
        self.find_providers(cancel).await
    }

    pub async fn find_providers(&self, cancel: &CancellationToken) -> usize {
        let key = rendezvous_key(&self.config.rendezvous);
        let providers = self.dht.get_providers(key, cancel).await;
        let count = providers.len();
        for provider in providers {
            self.emit(provider, DiscoverySource::Rendezvous).await;
        }
        trace!(count, "rendezvous providers");
        count
    }

    /// Announce every `announce_interval` and look up providers in between.
    pub fn spawn_rendezvous(&self, cancel: CancellationToken) {
        let discovery = self.clone();
        tokio::spawn(async move {
            let mut announce = tokio::time::interval(discovery.config.announce_interval);
            let mut lookup = tokio::time::interval(discovery.config.provider_lookup_interval);
            // The first announce already looks up providers.
            lookup.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = announce.tick() => {
                        discovery.announce(&cancel).await;
                    }
                    _ = lookup.tick() => {
                        discovery.find_providers(&cancel).await;
                    }
                }
            }
            trace!("rendezvous loop stopped");
        });
    }

    fn signed_announcement(&self, addrs: &[String]) -> LocalAnnouncement {
        let mut announcement = LocalAnnouncement {
            service_tag: self.config.service_tag.clone(),
            identity: self.keypair.identity(),
            addrs: addrs.to_vec(),
            timestamp_ms: now_ms(),
            signature: Vec::new(),
        };
        announcement.signature =
            sign_with_domain(&self.keypair, ANNOUNCE_SIGNATURE_DOMAIN, &announcement.signing_bytes());
        announcement
    }

    /// Decode and check a datagram. `Ok(None)` for our own announcements.
    fn accept_announcement(&self, bytes: &[u8]) -> Result<Option<LocalAnnouncement>, DiscoveryError> {
        let announcement: LocalAnnouncement =
            messages::deserialize_bounded(bytes).map_err(|e| DiscoveryError::BadAnnouncement(e.to_string()))?;
        if announcement.service_tag != self.config.service_tag {
            return Err(DiscoveryError::BadAnnouncement(format!(
                "foreign service tag {:?}",
                announcement.service_tag
            )));
        }
        if announcement.identity == self.keypair.identity() {
            return Ok(None);
        }
        let skew = now_ms().abs_diff(announcement.timestamp_ms);
        if skew > self.config.announcement_max_skew.as_millis() as u64 {
            return Err(DiscoveryError::BadAnnouncement(format!("stale by {skew} ms")));
        }
        verify_with_domain(
            &announcement.identity,
            ANNOUNCE_SIGNATURE_DOMAIN,
            &announcement.signing_bytes(),
            &announcement.signature,
        )
        .map_err(|e| DiscoveryError::BadAnnouncement(e.to_string()))?;
        if announcement.addrs.is_empty() || !announcement.contact().validate_structure() {
            return Err(DiscoveryError::BadAnnouncement("unusable addresses".into()));
        }
        Ok(Some(announcement))
    }

    /// Start multicast discovery advertising `addrs`. Returns false if the
    /// socket could not be set up; the node carries on without it.
    pub fn spawn_local(&self, addrs: Vec<String>, cancel: CancellationToken) -> bool {
        if !self.config.local_discovery {
            return false;
        }
        let socket = match bind_multicast(self.config.multicast_group, self.config.multicast_interface) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(error = %e, "local discovery disabled");
                self.local_active.store(false, Ordering::Relaxed);
                return false;
            }
        };
        self.local_active.store(true, Ordering::Relaxed);
        info!(group = %self.config.multicast_group, "local discovery active");

        let group = SocketAddr::V4(self.config.multicast_group);

        let discovery = self.clone();
        let announcer_socket = socket.clone();
        let announcer_addrs = addrs.clone();
        let announcer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(discovery.config.local_discovery_interval);
            loop {
                tokio::select! {
                    _ = announcer_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        discovery.send_announcement(&announcer_socket, group, &announcer_addrs).await;
                    }
                }
            }
        });

        let discovery = self.clone();
        tokio::spawn(async move {
            let seen_cap = NonZeroUsize::new(SEEN_LOCAL_PEERS).unwrap_or(NonZeroUsize::MIN);
            let mut seen: LruCache<Identity, ()> = LruCache::new(seen_cap);
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!(error = %e, "multicast receive failed");
                            continue;
                        }
                    },
                };

                let announcement = match discovery.accept_announcement(&buf[..len]) {
                    Ok(Some(announcement)) => announcement,
                    Ok(None) => continue,
                    Err(e) => {
                        trace!(from = %from, error = %e, "ignoring datagram");
                        continue;
                    }
                };

                let peer = announcement.identity;
                let first_sight = seen.put(peer, ()).is_none();
                debug!(peer = %peer.short(), from = %from, first_sight, "local peer announced");
                discovery.emit(announcement.contact(), DiscoverySource::Multicast).await;
                if first_sight {
                    // Answer straight away so the newcomer learns us without waiting an interval.
                    discovery.send_announcement(&socket, group, &addrs).await;
                }
            }
            discovery.local_active.store(false, Ordering::Relaxed);
        });
        true
    }

    async fn send_announcement(&self, socket: &UdpSocket, group: SocketAddr, addrs: &[String]) {
        let announcement = self.signed_announcement(addrs);
        let bytes = match messages::serialize(&announcement) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode announcement");
                return;
            }
        };
        if let Err(e) = socket.send_to(&bytes, group).await {
            debug!(error = %e, "multicast send failed");
        }
    }
}

/// A UDP socket joined to `group`, shareable with other processes on the host.
fn bind_multicast(group: SocketAddrV4, interface: Ipv4Addr) -> Result<UdpSocket, DiscoveryError> {
    let err = |e: std::io::Error| DiscoveryError::Multicast(e.to_string());

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(err)?;
    socket.set_reuse_address(true).map_err(err)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(err)?;
    socket
        .bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())
        .map_err(err)?;
    socket.join_multicast_v4(group.ip(), &interface).map_err(err)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface).map_err(err)?;
    }
    socket.set_multicast_loop_v4(true).map_err(err)?;
    socket.set_multicast_ttl_v4(1).map_err(err)?;
    socket.set_nonblocking(true).map_err(err)?;

    UdpSocket::from_std(socket.into()).map_err(err)
}
