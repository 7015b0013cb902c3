//! # Gossip Topic Mesh
//!
//! Each joined topic keeps a bounded mesh of peers that receive every message
//! published or forwarded on it. Peers learn about each other's topics through
//! SUBSCRIBE announcements, and shape the mesh with GRAFT and PRUNE.
//!
//! ## Message Flow
//!
//! ```text
//! publish ──► SeenCache ──► mesh peers (or every known subscriber when the mesh is empty)
//! receive ──► verify ──► SeenCache ──► local subscribers
//!                                  └─► mesh peers except sender and source
//! ```
//!
//! ## Liveness
//!
//! Every heartbeat sends one HEARTBEAT to each mesh peer listing the topics
//! shared with it. Each heartbeat counts once when its result arrives: a
//! failure or send timeout is a miss, an ack or any inbound traffic from the
//! peer clears the count. A slow ack is not a miss. At `max_missed_heartbeats`
//! the peer leaves every mesh and the known set.
//!
//! ## Ordering
//!
//! Outbound requests to one peer go through that peer's own queue and are sent
//! one at a time, so they arrive in send order. Heartbeats skip the queue. The
//! actor never waits on the network.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::{GOSSIP_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::MessageRejection;
use crate::identity::{Contact, Identity, Keypair};
use crate::messages::{
    GossipSubRequest, MAX_PAYLOAD_SIZE, Message, MessageId, is_valid_topic, message_id,
};
use crate::protocols::{GossipSubRpc, PeerSource};

pub const DEFAULT_MESH_N: usize = 6;
pub const DEFAULT_MESH_N_LOW: usize = 4;
pub const DEFAULT_MESH_N_HIGH: usize = 12;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_SEEN_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_SEEN_CACHE_TTL: Duration = Duration::from_secs(120);

const MAX_KNOWN_PEERS: usize = 1000;
const MAX_TOPICS_PER_PEER: usize = 100;
const MAX_OUTBOUND_PER_PEER: usize = 256;
const SUBSCRIBER_BUFFER: usize = 1024;

/// Upper bound on a backoff a remote peer may ask for.
const MAX_PRUNE_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    /// Target mesh size.
    pub mesh_n: usize,
    /// Graft when the mesh drops below this.
    pub mesh_n_low: usize,
    /// Prune back to `mesh_n` above this.
    pub mesh_n_high: usize,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub prune_backoff: Duration,
    pub seen_cache_size: usize,
    pub seen_cache_ttl: Duration,
    pub max_payload_size: usize,
    /// Minimum gap between SUBSCRIBE announcements to the same candidate.
    pub announce_backoff: Duration,
    /// Budget for one outbound request, dial included.
    pub send_timeout: Duration,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
            seen_cache_ttl: DEFAULT_SEEN_CACHE_TTL,
            max_payload_size: MAX_PAYLOAD_SIZE,
            announce_backoff: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Message ids seen recently, bounded by count and age.
///
/// Hits never refresh an entry, so LRU order is first-seen order and expiry
/// only has to look at the oldest end.
pub struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Record `id`; false if it was already seen and has not expired.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if let Some(first_seen) = self.entries.peek(&id)
            && first_seen.elapsed() < self.ttl
        {
            return false;
        }
        self.entries.push(id, Instant::now());
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|first_seen| first_seen.elapsed() < self.ttl)
    }

    /// Drop expired entries; returns how many went.
    pub fn expire(&mut self) -> usize {
        let mut removed = 0;
        while let Some((_, first_seen)) = self.entries.peek_lru() {
            if first_seen.elapsed() < self.ttl {
                break;
            }
            self.entries.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
struct TopicState {
    mesh: HashSet<Identity>,
    subscribers: Vec<mpsc::Sender<Message>>,
    /// Candidates we sent SUBSCRIBE to, and when.
    announced: HashMap<Identity, Instant>,
}

impl TopicState {
    fn deliver(&mut self, message: &Message) {
        self.subscribers.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %message.topic, "subscriber lagging, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Heartbeat bookkeeping for one mesh peer, shared by every topic it meshes on.
///
/// Each heartbeat is counted once, when its result comes back: an ack resets
/// `missed`, a failure or timeout bumps it.
struct Liveness {
    missed: u32,
    in_flight: u32,
    /// Results from an earlier mesh membership of the same peer are ignored.
    epoch: u64,
}

struct Outbound {
    to: Contact,
    request: GossipSubRequest,
}

struct HeartbeatResult {
    peer: Identity,
    epoch: u64,
    ok: bool,
}

enum Command {
    Join(String, oneshot::Sender<Result<(), MessageRejection>>),
    Leave(String, oneshot::Sender<()>),
    Subscribe(String, oneshot::Sender<Result<mpsc::Receiver<Message>, MessageRejection>>),
    Publish(String, Vec<u8>, oneshot::Sender<Result<MessageId, MessageRejection>>),
    HandleMessage(Contact, GossipSubRequest, oneshot::Sender<Result<(), MessageRejection>>),
    AddPeer(Contact),
    MeshPeers(String, oneshot::Sender<Vec<Identity>>),
    KnownPeers(String, oneshot::Sender<Vec<Identity>>),
    Topics(oneshot::Sender<Vec<String>>),
    Quit,
}

/// Handle to the gossip actor; cheap to clone.
pub struct GossipSub<N: GossipSubRpc> {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    _network: PhantomData<fn() -> N>,
}

impl<N: GossipSubRpc> Clone for GossipSub<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            cancel: self.cancel.clone(),
            _network: PhantomData,
        }
    }
}

impl<N: GossipSubRpc> GossipSub<N> {
    /// Spawn the actor. It stops on [`GossipSub::quit`] or when `cancel` fires.
    pub fn spawn(
        network: Arc<N>,
        keypair: Keypair,
        config: GossipSubConfig,
        peer_source: Option<Arc<dyn PeerSource>>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1000);
        let (events_tx, events_rx) = mpsc::channel(1000);

        let actor = GossipSubActor::new(network, keypair, config, peer_source, events_tx, cancel.clone());
        tokio::spawn(actor.run(cmd_rx, events_rx));

        Self {
            cmd_tx,
            cancel,
            _network: PhantomData,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MessageRejection> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| MessageRejection::ShutDown)?;
        rx.await.map_err(|_| MessageRejection::ShutDown)
    }

    /// Join `topic` and start building its mesh.
    pub async fn join(&self, topic: &str) -> Result<Topic<N>, MessageRejection> {
        self.request(|tx| Command::Join(topic.to_string(), tx)).await??;
        Ok(Topic {
            name: topic.to_string(),
            gossip: self.clone(),
        })
    }

    /// Offer a peer we just connected to; it is told about every joined topic.
    pub async fn add_peer(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::AddPeer(contact)).await;
    }

    pub async fn handle_message(&self, from: &Contact, message: GossipSubRequest) -> Result<(), MessageRejection> {
        self.request(|tx| Command::HandleMessage(from.clone(), message, tx))
            .await?
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        self.request(|tx| Command::MeshPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    /// Peers known to subscribe to `topic`, in the mesh or not.
    pub async fn known_peers(&self, topic: &str) -> Vec<Identity> {
        self.request(|tx| Command::KnownPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.request(Command::Topics).await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

/// A joined topic.
pub struct Topic<N: GossipSubRpc> {
    name: String,
    gossip: GossipSub<N>,
}

impl<N: GossipSubRpc> Topic<N> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, data: impl Into<Vec<u8>>) -> Result<MessageId, MessageRejection> {
        let data = data.into();
        self.gossip
            .request(|tx| Command::Publish(self.name.clone(), data, tx))
            .await?
    }

    /// A new stream of messages other peers publish on this topic.
    pub async fn subscribe(&self) -> Result<Subscription, MessageRejection> {
        let rx = self
            .gossip
            .request(|tx| Command::Subscribe(self.name.clone(), tx))
            .await??;
        Ok(Subscription {
            rx,
            cancel: self.gossip.cancel.clone(),
        })
    }

    pub async fn mesh_peers(&self) -> Vec<Identity> {
        self.gossip.mesh_peers(&self.name).await
    }

    /// Leave the topic. Open subscriptions end.
    pub async fn leave(self) {
        let _ = self.gossip.request(|tx| Command::Leave(self.name.clone(), tx)).await;
    }
}

pub struct Subscription {
    rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Next message; `None` once the topic is left or the node shuts down.
    pub async fn next(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }
}

struct GossipSubActor<N: GossipSubRpc> {
    network: Arc<N>,
    keypair: Keypair,
    local: Identity,
    config: GossipSubConfig,
    peer_source: Option<Arc<dyn PeerSource>>,
    topics: HashMap<String, TopicState>,
    peer_topics: HashMap<Identity, HashSet<String>>,
    contacts: LruCache<Identity, Contact>,
    liveness: HashMap<Identity, Liveness>,
    next_epoch: u64,
    backoff: HashMap<(Identity, String), Instant>,
    /// Peers dropped for missed heartbeats; not offered again as candidates.
    ejected: LruCache<Identity, Instant>,
    seen: SeenCache,
    seqno: u64,
    outbound: HashMap<Identity, mpsc::Sender<Outbound>>,
    events_tx: mpsc::Sender<HeartbeatResult>,
    cancel: CancellationToken,
}

impl<N: GossipSubRpc> GossipSubActor<N> {
    fn new(
        network: Arc<N>,
        keypair: Keypair,
        config: GossipSubConfig,
        peer_source: Option<Arc<dyn PeerSource>>,
        events_tx: mpsc::Sender<HeartbeatResult>,
        cancel: CancellationToken,
    ) -> Self {
        let local = keypair.identity();
        let seen = SeenCache::new(config.seen_cache_size, config.seen_cache_ttl);
        let known_cap = NonZeroUsize::new(MAX_KNOWN_PEERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            network,
            keypair,
            local,
            config,
            peer_source,
            topics: HashMap::new(),
            peer_topics: HashMap::new(),
            contacts: LruCache::new(known_cap),
            liveness: HashMap::new(),
            next_epoch: 0,
            backoff: HashMap::new(),
            ejected: LruCache::new(known_cap),
            seen,
            seqno: 0,
            outbound: HashMap::new(),
            events_tx,
            cancel,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut events_rx: mpsc::Receiver<HeartbeatResult>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("gossip actor cancelled");
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Quit) | None => {
                        debug!("gossip actor quitting");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(result) = events_rx.recv() => self.on_heartbeat_result(result),
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }
        self.outbound.clear();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Join(topic, reply) => {
                let _ = reply.send(self.join(&topic));
            }
            Command::Leave(topic, reply) => {
                self.leave(&topic);
                let _ = reply.send(());
            }
            Command::Subscribe(topic, reply) => {
                let result = match self.topics.get_mut(&topic) {
                    Some(state) => {
                        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                        state.subscribers.push(tx);
                        Ok(rx)
                    }
                    None => Err(MessageRejection::NotSubscribed(topic)),
                };
                let _ = reply.send(result);
            }
            Command::Publish(topic, data, reply) => {
                let _ = reply.send(self.publish(&topic, data));
            }
            Command::HandleMessage(from, message, reply) => {
                let _ = reply.send(self.handle_message(from, message));
            }
            Command::AddPeer(contact) => self.add_peer(contact),
            Command::MeshPeers(topic, reply) => {
                let peers = self
                    .topics
                    .get(&topic)
                    .map(|s| s.mesh.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::KnownPeers(topic, reply) => {
                let _ = reply.send(self.known_subscribers(&topic));
            }
            Command::Topics(reply) => {
                let _ = reply.send(self.topics.keys().cloned().collect());
            }
            Command::Quit => {}
        }
    }

    fn store_contact(&mut self, contact: Contact) {
        if contact.identity == self.local || !contact.validate_structure() {
            return;
        }
        if let Some((evicted, _)) = self.contacts.push(contact.identity, contact)
            && !self.contacts.contains(&evicted)
        {
            self.forget_peer(&evicted);
        }
    }

    fn known_subscribers(&self, topic: &str) -> Vec<Identity> {
        self.peer_topics
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Returns true if `peer` was not yet known to subscribe to `topic`.
    fn record_peer_topic(&mut self, peer: Identity, topic: &str) -> bool {
        let topics = self.peer_topics.entry(peer).or_default();
        if topics.contains(topic) || topics.len() >= MAX_TOPICS_PER_PEER {
            return false;
        }
        topics.insert(topic.to_string())
    }

    fn in_backoff(&self, peer: &Identity, topic: &str) -> bool {
        self.backoff
            .get(&(*peer, topic.to_string()))
            .is_some_and(|until| *until > Instant::now())
    }

    fn graft(&mut self, topic: &str, peer: Identity) {
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        if state.mesh.insert(peer) {
            debug!(peer = %peer.short(), topic, "grafted mesh peer");
            self.track_liveness(peer);
        }
    }

    fn track_liveness(&mut self, peer: Identity) {
        if self.liveness.contains_key(&peer) {
            return;
        }
        self.next_epoch += 1;
        self.liveness.insert(
            peer,
            Liveness {
                missed: 0,
                in_flight: 0,
                epoch: self.next_epoch,
            },
        );
    }

    fn drop_from_mesh(&mut self, topic: &str, peer: &Identity) -> bool {
        let removed = self
            .topics
            .get_mut(topic)
            .is_some_and(|state| state.mesh.remove(peer));
        if removed && !self.topics.values().any(|s| s.mesh.contains(peer)) {
            self.liveness.remove(peer);
        }
        removed
    }

    /// Drop every trace of `peer`: meshes, known topics, queue and contact.
    fn forget_peer(&mut self, peer: &Identity) {
        for state in self.topics.values_mut() {
            state.mesh.remove(peer);
            state.announced.remove(peer);
        }
        self.peer_topics.remove(peer);
        self.liveness.remove(peer);
        self.outbound.remove(peer);
        self.contacts.pop(peer);
    }

    fn enqueue(&mut self, peer: &Identity, request: GossipSubRequest) {
        let Some(contact) = self.contacts.peek(peer).cloned() else {
            trace!(peer = %peer.short(), kind = request.kind(), "no contact for gossip peer");
            return;
        };

        if !self.outbound.contains_key(peer) {
            let (tx, rx) = mpsc::channel(MAX_OUTBOUND_PER_PEER);
            tokio::spawn(outbound_worker(
                self.network.clone(),
                rx,
                self.config.send_timeout,
                self.cancel.clone(),
            ));
            self.outbound.insert(*peer, tx);
        }
        let Some(queue) = self.outbound.get(peer) else {
            return;
        };

        match queue.try_send(Outbound { to: contact, request }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                debug!(peer = %peer.short(), kind = dropped.request.kind(), "outbound queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.outbound.remove(peer);
            }
        }
    }

    fn join(&mut self, topic: &str) -> Result<(), MessageRejection> {
        if !is_valid_topic(topic) {
            return Err(MessageRejection::InvalidTopic);
        }
        if self.topics.contains_key(topic) {
            return Ok(());
        }
        self.topics.insert(topic.to_string(), TopicState::default());

        let peers: Vec<Identity> = self.contacts.iter().map(|(id, _)| *id).collect();
        let now = Instant::now();
        for peer in &peers {
            self.enqueue(peer, GossipSubRequest::Subscribe { topic: topic.to_string() });
        }
        if let Some(state) = self.topics.get_mut(topic) {
            state.announced.extend(peers.into_iter().map(|p| (p, now)));
        }

        self.maintain_mesh(topic);
        debug!(topic, "joined topic");
        Ok(())
    }

    fn leave(&mut self, topic: &str) {
        let Some(state) = self.topics.remove(topic) else {
            return;
        };
        let mut notify: HashSet<Identity> = state.mesh.iter().copied().collect();
        notify.extend(state.announced.keys().copied());
        notify.extend(self.known_subscribers(topic));
        for peer in notify {
            self.enqueue(&peer, GossipSubRequest::Unsubscribe { topic: topic.to_string() });
        }
        for peer in &state.mesh {
            if !self.topics.values().any(|s| s.mesh.contains(peer)) {
                self.liveness.remove(peer);
            }
        }
        debug!(topic, "left topic");
    }

    fn add_peer(&mut self, contact: Contact) {
        let peer = contact.identity;
        if peer == self.local {
            return;
        }
        self.ejected.pop(&peer);
        self.store_contact(contact);

        let now = Instant::now();
        let backoff = self.config.announce_backoff;
        let due: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, s)| s.announced.get(&peer).is_none_or(|at| now.duration_since(*at) >= backoff))
            .map(|(t, _)| t.clone())
            .collect();
        for topic in due {
            self.enqueue(&peer, GossipSubRequest::Subscribe { topic: topic.clone() });
            if let Some(state) = self.topics.get_mut(&topic) {
                state.announced.insert(peer, now);
            }
        }
    }

    fn publish(&mut self, topic: &str, data: Vec<u8>) -> Result<MessageId, MessageRejection> {
        if !is_valid_topic(topic) {
            return Err(MessageRejection::InvalidTopic);
        }
        if data.len() > self.config.max_payload_size {
            return Err(MessageRejection::PayloadTooLarge(data.len()));
        }
        let Some(state) = self.topics.get(topic) else {
            return Err(MessageRejection::NotSubscribed(topic.to_string()));
        };

        self.seqno += 1;
        let seqno = self.seqno;
        let msg_id = message_id(topic, &self.local, seqno, &data);
        let signature = sign_with_domain(&self.keypair, GOSSIP_SIGNATURE_DOMAIN, &msg_id);
        self.seen.insert(msg_id);

        let mut targets: Vec<Identity> = state.mesh.iter().copied().collect();
        if targets.is_empty() {
            targets = self.known_subscribers(topic);
        }
        debug!(topic, seqno, targets = targets.len(), "publishing");

        let request = GossipSubRequest::Publish {
            topic: topic.to_string(),
            msg_id,
            source: self.local,
            seqno,
            data,
            signature,
        };
        for peer in targets {
            self.enqueue(&peer, request.clone());
        }
        Ok(msg_id)
    }

    fn handle_message(&mut self, from: Contact, message: GossipSubRequest) -> Result<(), MessageRejection> {
        let peer = from.identity;
        self.ejected.pop(&peer);
        self.store_contact(from);
        if let Some(liveness) = self.liveness.get_mut(&peer) {
            liveness.missed = 0;
        }

        match message {
            GossipSubRequest::Subscribe { topic } => {
                if !is_valid_topic(&topic) {
                    return Err(MessageRejection::InvalidTopic);
                }
                let is_new = self.record_peer_topic(peer, &topic);
                trace!(peer = %peer.short(), topic = %topic, is_new, "SUBSCRIBE");
                if !self.topics.contains_key(&topic) {
                    return Ok(());
                }
                if is_new {
                    // Let the peer know we share the topic.
                    self.enqueue(&peer, GossipSubRequest::Subscribe { topic: topic.clone() });
                    if let Some(state) = self.topics.get_mut(&topic) {
                        state.announced.insert(peer, Instant::now());
                    }
                }
                let mesh_len = self.topics.get(&topic).map_or(0, |s| s.mesh.len());
                let in_mesh = self.topics.get(&topic).is_some_and(|s| s.mesh.contains(&peer));
                if !in_mesh && mesh_len < self.config.mesh_n && !self.in_backoff(&peer, &topic) {
                    self.graft(&topic, peer);
                    self.enqueue(&peer, GossipSubRequest::Graft { topic });
                }
                Ok(())
            }
            GossipSubRequest::Unsubscribe { topic } => {
                trace!(peer = %peer.short(), topic = %topic, "UNSUBSCRIBE");
                if let Some(topics) = self.peer_topics.get_mut(&peer) {
                    topics.remove(&topic);
                }
                self.drop_from_mesh(&topic, &peer);
                Ok(())
            }
            GossipSubRequest::Graft { topic } => {
                if !self.topics.contains_key(&topic) {
                    self.enqueue(&peer, GossipSubRequest::Prune { topic, backoff_secs: None });
                    return Ok(());
                }
                self.record_peer_topic(peer, &topic);
                let mesh_len = self.topics.get(&topic).map_or(0, |s| s.mesh.len());
                let in_mesh = self.topics.get(&topic).is_some_and(|s| s.mesh.contains(&peer));
                if in_mesh {
                    return Ok(());
                }
                if self.in_backoff(&peer, &topic) || mesh_len >= self.config.mesh_n_high {
                    trace!(peer = %peer.short(), topic = %topic, "refusing GRAFT");
                    let backoff_secs = Some(self.config.prune_backoff.as_secs());
                    self.enqueue(&peer, GossipSubRequest::Prune { topic, backoff_secs });
                    return Ok(());
                }
                self.graft(&topic, peer);
                Ok(())
            }
            GossipSubRequest::Prune { topic, backoff_secs } => {
                if !is_valid_topic(&topic) {
                    return Err(MessageRejection::InvalidTopic);
                }
                if !self.topics.contains_key(&topic) {
                    trace!(peer = %peer.short(), topic = %topic, "PRUNE for topic we are not in");
                    return Ok(());
                }
                let held = self.backoff.keys().filter(|(p, _)| *p == peer).count();
                if held >= MAX_TOPICS_PER_PEER && !self.backoff.contains_key(&(peer, topic.clone())) {
                    self.drop_from_mesh(&topic, &peer);
                    return Ok(());
                }
                let backoff = backoff_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.prune_backoff)
                    .min(MAX_PRUNE_BACKOFF);
                self.backoff.insert((peer, topic.clone()), Instant::now() + backoff);
                if self.drop_from_mesh(&topic, &peer) {
                    debug!(peer = %peer.short(), topic = %topic, backoff_secs = backoff.as_secs(), "pruned from mesh");
                }
                Ok(())
            }
            GossipSubRequest::Publish {
                topic,
                msg_id,
                source,
                seqno,
                data,
                signature,
            } => self.handle_publish(peer, topic, msg_id, source, seqno, data, signature),
            GossipSubRequest::Heartbeat { topics } => {
                for topic in topics.iter().take(MAX_TOPICS_PER_PEER) {
                    if self.topics.contains_key(topic) {
                        self.record_peer_topic(peer, topic);
                    }
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_publish(
        &mut self,
        from: Identity,
        topic: String,
        msg_id: MessageId,
        source: Identity,
        seqno: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<(), MessageRejection> {
        if !is_valid_topic(&topic) {
            return Err(MessageRejection::InvalidTopic);
        }
        if data.len() > self.config.max_payload_size {
            return Err(MessageRejection::PayloadTooLarge(data.len()));
        }
        if message_id(&topic, &source, seqno, &data) != msg_id {
            return Err(MessageRejection::MessageIdMismatch);
        }
        verify_with_domain(&source, GOSSIP_SIGNATURE_DOMAIN, &msg_id, &signature)?;

        let Some(state) = self.topics.get_mut(&topic) else {
            return Err(MessageRejection::NotSubscribed(topic));
        };
        if source == self.local || !self.seen.insert(msg_id) {
            trace!(id = %hex::encode(&msg_id[..8]), "duplicate message");
            return Ok(());
        }

        let message = Message {
            topic: topic.clone(),
            source,
            seqno,
            msg_id,
            data,
        };
        state.deliver(&message);

        let forward: Vec<Identity> = state
            .mesh
            .iter()
            .filter(|p| **p != from && **p != source)
            .copied()
            .collect();
        trace!(
            id = %hex::encode(&msg_id[..8]),
            source = %source.short(),
            forward = forward.len(),
            "delivered message"
        );

        let request = GossipSubRequest::Publish {
            topic,
            msg_id,
            source,
            seqno,
            data: message.data,
            signature,
        };
        for peer in forward {
            self.enqueue(&peer, request.clone());
        }
        Ok(())
    }

    fn heartbeat(&mut self) {
        let expired = self.seen.expire();
        if expired > 0 {
            trace!(expired, "seen cache swept");
        }
        let now = Instant::now();
        self.backoff.retain(|_, until| *until > now);

        let topics: Vec<String> = self.topics.keys().cloned().collect();
        for topic in &topics {
            self.maintain_mesh(topic);
        }
        self.send_heartbeats();
    }

    fn maintain_mesh(&mut self, topic: &str) {
        let Some(state) = self.topics.get(topic) else {
            return;
        };
        let mut rng = rand::thread_rng();
        let mesh_len = state.mesh.len();

        if mesh_len < self.config.mesh_n_low {
            let mut spare: Vec<Identity> = self
                .known_subscribers(topic)
                .into_iter()
                .filter(|p| !state.mesh.contains(p) && !self.in_backoff(p, topic))
                .collect();
            spare.shuffle(&mut rng);
            let wanted = self.config.mesh_n.saturating_sub(mesh_len);
            let had_spare = !spare.is_empty();
            for peer in spare.into_iter().take(wanted) {
                self.graft(topic, peer);
                self.enqueue(&peer, GossipSubRequest::Graft { topic: topic.to_string() });
            }
            if !had_spare {
                self.announce_to_candidates(topic);
            }
        } else if mesh_len > self.config.mesh_n_high {
            let mut members: Vec<Identity> = state.mesh.iter().copied().collect();
            members.shuffle(&mut rng);
            let excess = mesh_len - self.config.mesh_n;
            let backoff_secs = Some(self.config.prune_backoff.as_secs());
            for peer in members.into_iter().take(excess) {
                self.drop_from_mesh(topic, &peer);
                self.enqueue(
                    &peer,
                    GossipSubRequest::Prune {
                        topic: topic.to_string(),
                        backoff_secs,
                    },
                );
            }
            debug!(topic, pruned = excess, "mesh over-populated");
        }
    }

    /// Tell routing-table candidates we have not heard from about `topic`.
    fn announce_to_candidates(&mut self, topic: &str) {
        let Some(source) = self.peer_source.clone() else {
            return;
        };
        let now = Instant::now();
        let backoff = self.config.announce_backoff;
        let known: HashSet<Identity> = self.known_subscribers(topic).into_iter().collect();
        let Some(state) = self.topics.get(topic) else {
            return;
        };

        let fresh: Vec<Contact> = source
            .candidates(self.config.mesh_n_high)
            .into_iter()
            .filter(|c| {
                c.identity != self.local
                    && !known.contains(&c.identity)
                    && !self.ejected.contains(&c.identity)
                    && state
                        .announced
                        .get(&c.identity)
                        .is_none_or(|at| now.duration_since(*at) >= backoff)
            })
            .collect();
        if fresh.is_empty() {
            return;
        }

        trace!(topic, count = fresh.len(), "announcing subscription to candidates");
        for contact in fresh {
            let peer = contact.identity;
            self.store_contact(contact);
            self.enqueue(&peer, GossipSubRequest::Subscribe { topic: topic.to_string() });
            if let Some(state) = self.topics.get_mut(topic) {
                state.announced.insert(peer, now);
            }
        }
    }

    /// One heartbeat per mesh peer, sent beside its outbound queue so a
    /// backlog of publishes can't delay it. At most `max_missed_heartbeats`
    /// are outstanding per peer.
    fn send_heartbeats(&mut self) {
        let mut shared: HashMap<Identity, Vec<String>> = HashMap::new();
        for (topic, state) in &self.topics {
            for peer in &state.mesh {
                shared.entry(*peer).or_default().push(topic.clone());
            }
        }

        let mut unreachable = Vec::new();
        for (peer, topics) in shared {
            self.track_liveness(peer);
            let Some(contact) = self.contacts.peek(&peer).cloned() else {
                unreachable.push(peer);
                continue;
            };
            let Some(liveness) = self.liveness.get_mut(&peer) else {
                continue;
            };
            if liveness.in_flight >= self.config.max_missed_heartbeats {
                trace!(peer = %peer.short(), in_flight = liveness.in_flight, "heartbeats outstanding, skipping tick");
                continue;
            }
            liveness.in_flight += 1;
            let epoch = liveness.epoch;

            let network = self.network.clone();
            let events = self.events_tx.clone();
            let send_timeout = self.config.send_timeout;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let request = GossipSubRequest::Heartbeat { topics };
                let ok = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tokio::time::timeout(send_timeout, network.send_gossipsub(&contact, request)) => {
                        match result {
                            Ok(Ok(())) => true,
                            Ok(Err(e)) => {
                                trace!(peer = %peer.short(), error = %e, "heartbeat failed");
                                false
                            }
                            Err(_) => {
                                trace!(peer = %peer.short(), "heartbeat timed out");
                                false
                            }
                        }
                    }
                };
                let _ = events.send(HeartbeatResult { peer, epoch, ok }).await;
            });
        }
        for peer in unreachable {
            self.record_miss(&peer);
        }
    }

    fn on_heartbeat_result(&mut self, result: HeartbeatResult) {
        let Some(liveness) = self.liveness.get_mut(&result.peer) else {
            return;
        };
        if liveness.epoch != result.epoch {
            return;
        }
        liveness.in_flight = liveness.in_flight.saturating_sub(1);
        if result.ok {
            liveness.missed = 0;
            return;
        }
        self.record_miss(&result.peer);
    }

    fn record_miss(&mut self, peer: &Identity) {
        let Some(liveness) = self.liveness.get_mut(peer) else {
            return;
        };
        liveness.missed += 1;
        if liveness.missed >= self.config.max_missed_heartbeats {
            self.eject(peer);
        }
    }

    fn eject(&mut self, peer: &Identity) {
        debug!(
            peer = %peer.short(),
            missed = self.config.max_missed_heartbeats,
            "ejecting unresponsive mesh peer"
        );
        self.forget_peer(peer);
        self.ejected.put(*peer, Instant::now());
    }
}

async fn outbound_worker<N: GossipSubRpc>(
    network: Arc<N>,
    mut rx: mpsc::Receiver<Outbound>,
    send_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let peer = item.to.identity;
        let kind = item.request.kind();
        match tokio::time::timeout(send_timeout, network.send_gossipsub(&item.to, item.request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!(peer = %peer.short(), kind, error = %e, "gossip send failed"),
            Err(_) => trace!(peer = %peer.short(), kind, "gossip send timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::RwLock;
    use tokio::time::{sleep, timeout};

    type Registry = Arc<RwLock<HashMap<Identity, GossipSub<TestNetwork>>>>;

    struct TestNetwork {
        registry: Registry,
        self_contact: Contact,
        failures: Mutex<HashSet<Identity>>,
        heartbeat_delay: Mutex<Option<Duration>>,
    }

    impl TestNetwork {
        fn fail(&self, peer: Identity) {
            self.failures.lock().unwrap().insert(peer);
        }

        fn delay_heartbeats(&self, delay: Duration) {
            *self.heartbeat_delay.lock().unwrap() = Some(delay);
        }
    }

    #[async_trait]
    impl GossipSubRpc for TestNetwork {
        async fn send_gossipsub(&self, to: &Contact, message: GossipSubRequest) -> anyhow::Result<()> {
            if self.failures.lock().unwrap().contains(&to.identity) {
                return Err(anyhow!("injected failure"));
            }
            let delay = *self.heartbeat_delay.lock().unwrap();
            if let (Some(delay), GossipSubRequest::Heartbeat { .. }) = (delay, &message) {
                sleep(delay).await;
            }
            let peer = self
                .registry
                .read()
                .await
                .get(&to.identity)
                .cloned()
                .ok_or_else(|| anyhow!("unknown peer"))?;
            peer.handle_message(&self.self_contact, message)
                .await
                .map_err(|e| anyhow!("{e}"))
        }
    }

    struct StaticPeers(Vec<Contact>);

    impl PeerSource for StaticPeers {
        fn candidates(&self, count: usize) -> Vec<Contact> {
            self.0.iter().take(count).cloned().collect()
        }
    }

    struct TestPeer {
        keypair: Keypair,
        gossip: GossipSub<TestNetwork>,
        network: Arc<TestNetwork>,
    }

    impl TestPeer {
        fn id(&self) -> Identity {
            self.keypair.identity()
        }

        fn contact(&self) -> Contact {
            Contact::single(self.id(), "127.0.0.1:1")
        }
    }

    fn fast_config() -> GossipSubConfig {
        GossipSubConfig {
            heartbeat_interval: Duration::from_millis(50),
            send_timeout: Duration::from_millis(500),
            ..GossipSubConfig::default()
        }
    }

    fn test_network(registry: &Registry, keypair: &Keypair) -> Arc<TestNetwork> {
        Arc::new(TestNetwork {
            registry: registry.clone(),
            self_contact: Contact::single(keypair.identity(), "127.0.0.1:1"),
            failures: Mutex::new(HashSet::new()),
            heartbeat_delay: Mutex::new(None),
        })
    }

    async fn spawn_peer(registry: &Registry, source: Option<Arc<dyn PeerSource>>) -> TestPeer {
        let keypair = Keypair::generate();
        let network = test_network(registry, &keypair);
        let gossip = GossipSub::spawn(
            network.clone(),
            keypair.clone(),
            fast_config(),
            source,
            CancellationToken::new(),
        );
        registry.write().await.insert(keypair.identity(), gossip.clone());
        TestPeer { keypair, gossip, network }
    }

    fn signed_publish(keypair: &Keypair, topic: &str, seqno: u64, data: &[u8]) -> GossipSubRequest {
        let source = keypair.identity();
        let msg_id = message_id(topic, &source, seqno, data);
        GossipSubRequest::Publish {
            topic: topic.into(),
            msg_id,
            source,
            seqno,
            data: data.to_vec(),
            signature: sign_with_domain(keypair, GOSSIP_SIGNATURE_DOMAIN, &msg_id),
        }
    }

    #[test]
    fn config_defaults() {
        let config = GossipSubConfig::default();
        assert_eq!(config.mesh_n_low, 4);
        assert_eq!(config.mesh_n, 6);
        assert_eq!(config.mesh_n_high, 12);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.max_missed_heartbeats, 3);
        assert_eq!(config.prune_backoff, Duration::from_secs(60));
        assert_eq!(config.seen_cache_size, 10_000);
        assert_eq!(config.seen_cache_ttl, Duration::from_secs(120));
        assert_eq!(config.max_payload_size, 64 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn seen_cache_dedups_until_expiry() {
        let mut cache = SeenCache::new(16, Duration::from_secs(120));
        assert!(cache.insert([1u8; 32]));
        assert!(!cache.insert([1u8; 32]));
        assert!(cache.contains(&[1u8; 32]));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.insert([2u8; 32]));
        assert_eq!(cache.expire(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cache.contains(&[1u8; 32]));
        assert_eq!(cache.expire(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.insert([1u8; 32]));
    }

    #[test]
    fn seen_cache_is_bounded() {
        let mut cache = SeenCache::new(3, Duration::from_secs(120));
        for i in 0..10u8 {
            cache.insert([i; 32]);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&[9u8; 32]));
        assert!(!cache.contains(&[0u8; 32]));
    }

    #[tokio::test]
    async fn publish_reaches_every_other_subscriber_once() {
        let registry = Registry::default();
        let a = spawn_peer(&registry, None).await;
        let b = spawn_peer(&registry, None).await;
        let c = spawn_peer(&registry, None).await;

        let topic_a = a.gossip.join("t").await.unwrap();
        let topic_b = b.gossip.join("t").await.unwrap();
        let topic_c = c.gossip.join("t").await.unwrap();
        let mut sub_a = topic_a.subscribe().await.unwrap();
        let mut sub_b = topic_b.subscribe().await.unwrap();
        let mut sub_c = topic_c.subscribe().await.unwrap();

        // B and C only know A, as after bootstrapping through it.
        b.gossip.add_peer(a.contact()).await;
        c.gossip.add_peer(a.contact()).await;
        sleep(Duration::from_millis(300)).await;

        topic_b.publish("hello").await.unwrap();

        let got_a = timeout(Duration::from_secs(2), sub_a.next()).await.unwrap().unwrap();
        let got_c = timeout(Duration::from_secs(2), sub_c.next()).await.unwrap().unwrap();
        assert_eq!(got_a.text(), "hello");
        assert_eq!(got_a.source, b.id());
        assert_eq!(got_c.text(), "hello");
        assert_eq!(got_c.source, b.id());

        sleep(Duration::from_millis(200)).await;
        assert!(timeout(Duration::from_millis(50), sub_a.next()).await.is_err());
        assert!(timeout(Duration::from_millis(50), sub_c.next()).await.is_err());
        assert!(timeout(Duration::from_millis(50), sub_b.next()).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_suppressed() {
        let registry = Registry::default();
        let receiver = spawn_peer(&registry, None).await;
        let author = Keypair::generate();
        let relay = Contact::single(Keypair::generate().identity(), "127.0.0.1:2");

        let topic = receiver.gossip.join("t").await.unwrap();
        let mut sub = topic.subscribe().await.unwrap();

        let message = signed_publish(&author, "t", 7, b"once");
        receiver.gossip.handle_message(&relay, message.clone()).await.unwrap();
        receiver.gossip.handle_message(&relay, message).await.unwrap();

        let first = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(first.text(), "once");
        assert_eq!(first.seqno, 7);
        assert!(timeout(Duration::from_millis(100), sub.next()).await.is_err());
    }

    #[tokio::test]
    async fn tampered_messages_rejected() {
        let registry = Registry::default();
        let receiver = spawn_peer(&registry, None).await;
        let author = Keypair::generate();
        let relay = Contact::single(Keypair::generate().identity(), "127.0.0.1:2");
        receiver.gossip.join("t").await.unwrap();

        let GossipSubRequest::Publish { topic, msg_id, source, seqno, signature, .. } =
            signed_publish(&author, "t", 1, b"original")
        else {
            unreachable!()
        };
        let altered = GossipSubRequest::Publish {
            topic: topic.clone(),
            msg_id,
            source,
            seqno,
            data: b"altered".to_vec(),
            signature: signature.clone(),
        };
        let err = receiver.gossip.handle_message(&relay, altered).await.unwrap_err();
        assert!(matches!(err, MessageRejection::MessageIdMismatch));

        let forged = GossipSubRequest::Publish {
            topic,
            msg_id,
            source,
            seqno,
            data: b"original".to_vec(),
            signature: vec![0u8; 64],
        };
        let err = receiver.gossip.handle_message(&relay, forged).await.unwrap_err();
        assert!(matches!(err, MessageRejection::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn publish_limits_enforced() {
        let registry = Registry::default();
        let peer = spawn_peer(&registry, None).await;

        assert!(matches!(peer.gossip.join("").await, Err(MessageRejection::InvalidTopic)));
        let long = "x".repeat(257);
        assert!(matches!(peer.gossip.join(&long).await, Err(MessageRejection::InvalidTopic)));

        let topic = peer.gossip.join("t").await.unwrap();
        let err = topic.publish(vec![0u8; MAX_PAYLOAD_SIZE + 1]).await.unwrap_err();
        assert!(matches!(err, MessageRejection::PayloadTooLarge(_)));
        assert!(topic.publish(vec![0u8; MAX_PAYLOAD_SIZE]).await.is_ok());
    }

    #[tokio::test]
    async fn silent_peer_is_ejected() {
        let registry = Registry::default();
        let a = spawn_peer(&registry, None).await;
        let b = spawn_peer(&registry, None).await;
        a.gossip.join("t").await.unwrap();
        b.gossip.join("t").await.unwrap();
        a.gossip.add_peer(b.contact()).await;

        sleep(Duration::from_millis(200)).await;
        assert_eq!(a.gossip.mesh_peers("t").await, vec![b.id()]);

        // B goes dark in both directions.
        a.network.fail(b.id());
        b.network.fail(a.id());
        sleep(Duration::from_millis(400)).await;
        assert!(a.gossip.mesh_peers("t").await.is_empty());
        assert!(a.gossip.known_peers("t").await.is_empty());
    }

    #[tokio::test]
    async fn slow_but_acked_heartbeats_keep_peer_in_mesh() {
        let registry = Registry::default();
        let a = spawn_peer(&registry, None).await;
        let b = spawn_peer(&registry, None).await;
        a.gossip.join("t").await.unwrap();
        b.gossip.join("t").await.unwrap();
        a.gossip.add_peer(b.contact()).await;
        sleep(Duration::from_millis(200)).await;
        assert!(a.gossip.mesh_peers("t").await.contains(&b.id()));

        // Every heartbeat succeeds, but only after several intervals.
        a.network.delay_heartbeats(Duration::from_millis(180));
        b.network.delay_heartbeats(Duration::from_millis(180));

        let mut absent = 0;
        for _ in 0..60 {
            sleep(Duration::from_millis(20)).await;
            if !a.gossip.mesh_peers("t").await.contains(&b.id()) {
                absent += 1;
            }
        }
        assert_eq!(absent, 0, "acking peer left the mesh");
    }

    #[tokio::test]
    async fn heartbeats_timing_out_eject_within_bound() {
        let registry = Registry::default();
        let a = spawn_peer(&registry, None).await;
        let b = spawn_peer(&registry, None).await;
        a.gossip.join("t").await.unwrap();
        b.gossip.join("t").await.unwrap();
        a.gossip.add_peer(b.contact()).await;
        sleep(Duration::from_millis(200)).await;
        assert!(a.gossip.mesh_peers("t").await.contains(&b.id()));

        // Longer than the send timeout: every heartbeat now times out.
        a.network.delay_heartbeats(Duration::from_secs(5));
        b.network.delay_heartbeats(Duration::from_secs(5));

        // 3 intervals of 50ms plus one 500ms send timeout, with slack.
        sleep(Duration::from_millis(1000)).await;
        assert!(!a.gossip.mesh_peers("t").await.contains(&b.id()));
    }

    #[tokio::test]
    async fn prune_only_records_backoff_for_joined_topics() {
        let registry = Registry::default();
        let keypair = Keypair::generate();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut actor = GossipSubActor::new(
            test_network(&registry, &keypair),
            keypair,
            fast_config(),
            None,
            events_tx,
            CancellationToken::new(),
        );
        actor.join("t").unwrap();
        let remote = Contact::single(Keypair::generate().identity(), "127.0.0.1:2");

        for i in 0..500 {
            let prune = GossipSubRequest::Prune {
                topic: format!("{i}-never-joined"),
                backoff_secs: Some(3600),
            };
            actor.handle_message(remote.clone(), prune).unwrap();
        }
        let oversized = GossipSubRequest::Prune {
            topic: "x".repeat(1000),
            backoff_secs: Some(3600),
        };
        assert!(matches!(
            actor.handle_message(remote.clone(), oversized),
            Err(MessageRejection::InvalidTopic)
        ));
        assert!(actor.backoff.is_empty());

        let joined = GossipSubRequest::Prune {
            topic: "t".into(),
            backoff_secs: Some(3600),
        };
        actor.handle_message(remote.clone(), joined).unwrap();
        assert_eq!(actor.backoff.len(), 1);
        assert!(actor.in_backoff(&remote.identity, "t"));
    }

    #[tokio::test]
    async fn cancelled_node_ends_subscriptions() {
        let registry = Registry::default();
        let keypair = Keypair::generate();
        let cancel = CancellationToken::new();
        let gossip = GossipSub::spawn(
            test_network(&registry, &keypair),
            keypair,
            fast_config(),
            None,
            cancel.clone(),
        );
        let topic = gossip.join("t").await.unwrap();
        let mut sub = topic.subscribe().await.unwrap();

        cancel.cancel();
        assert!(timeout(Duration::from_millis(200), sub.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pruned_peer_not_regrafted_during_backoff() {
        let registry = Registry::default();
        let a = spawn_peer(&registry, None).await;
        let b = spawn_peer(&registry, None).await;
        a.gossip.join("t").await.unwrap();
        b.gossip.join("t").await.unwrap();
        a.gossip.add_peer(b.contact()).await;
        sleep(Duration::from_millis(200)).await;
        assert!(a.gossip.mesh_peers("t").await.contains(&b.id()));

        a.gossip
            .handle_message(
                &b.contact(),
                GossipSubRequest::Prune {
                    topic: "t".into(),
                    backoff_secs: Some(60),
                },
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(300)).await;

        assert!(!a.gossip.mesh_peers("t").await.contains(&b.id()));
        assert!(a.gossip.known_peers("t").await.contains(&b.id()));
    }

    #[tokio::test]
    async fn candidates_from_peer_source_learn_subscription() {
        let registry = Registry::default();
        let b = spawn_peer(&registry, None).await;
        let source: Arc<dyn PeerSource> = Arc::new(StaticPeers(vec![b.contact()]));
        let a = spawn_peer(&registry, Some(source)).await;

        b.gossip.join("t").await.unwrap();
        a.gossip.join("t").await.unwrap();
        sleep(Duration::from_millis(300)).await;

        assert!(b.gossip.known_peers("t").await.contains(&a.id()));
        assert!(a.gossip.mesh_peers("t").await.contains(&b.id()));
    }

    #[tokio::test]
    async fn leave_ends_subscriptions() {
        let registry = Registry::default();
        let peer = spawn_peer(&registry, None).await;
        let topic = peer.gossip.join("t").await.unwrap();
        let mut sub = topic.subscribe().await.unwrap();

        topic.leave().await;
        assert!(timeout(Duration::from_secs(1), sub.next()).await.unwrap().is_none());
        assert!(peer.gossip.topics().await.is_empty());
    }

    #[tokio::test]
    async fn graft_for_unjoined_topic_is_answered_with_prune() {
        let registry = Registry::default();
        let a = spawn_peer(&registry, None).await;
        let b = spawn_peer(&registry, None).await;
        b.gossip.join("t").await.unwrap();

        a.gossip
            .handle_message(&b.contact(), GossipSubRequest::Graft { topic: "t".into() })
            .await
            .unwrap();
        assert!(a.gossip.mesh_peers("t").await.is_empty());
    }
}
