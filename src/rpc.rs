//! # RPC Layer
//!
//! Request/response plumbing on top of [`Transport`]:
//!
//! - [`RpcNode`]: cheap-to-clone handle implementing [`DhtNodeRpc`] and [`GossipSubRpc`]
//! - `RpcNodeActor`: owns the connection cache
//! - [`RpcNode::serve`]: per-connection inbound loop dispatching to the DHT and gossip layers
//!
//! ## Connection Cache
//!
//! Connections are kept in a bounded LRU keyed by NodeID, shared by both
//! directions: an inbound connection from a peer is reused for requests to it.
//! Dials happen outside the actor so a slow peer never stalls the cache.
//! A transport-level failure evicts the cached connection.
//!
//! ## Sender Authentication
//!
//! The NodeID of a request's sender is the one proven by its TLS certificate.
//! DHT requests also name a sender contact; a mismatch is refused.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use quinn::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::crypto::extract_verified_identity;
use crate::dht::{DhtNode, Key};
use crate::error::DialError;
use crate::gossipsub::GossipSub;
use crate::identity::{Contact, Identity};
use crate::messages::{
    self, DhtNodeRequest, DhtNodeResponse, GossipSubRequest, RpcRequest, RpcResponse,
};
use crate::protocols::{DhtNodeRpc, GossipSubRpc};
use crate::transport::{self, Transport};

/// Contacts accepted from a single FindNode/GetProviders answer.
const MAX_CONTACTS_PER_RESPONSE: usize = 64;

const MAX_CACHED_CONNECTIONS: usize = 512;

/// Connections idle longer than this are dropped by the cleanup sweep.
const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(120);

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(15);

/// A Publish with a maximal payload plus envelope fits comfortably.
const MAX_REQUEST_SIZE: usize = 128 * 1024;

enum RpcCommand {
    Lookup {
        peer: Identity,
        reply: oneshot::Sender<Option<Connection>>,
    },
    Insert {
        peer: Identity,
        connection: Connection,
    },
    Invalidate {
        peer: Identity,
    },
    MarkSuccess {
        peer: Identity,
    },
    Quit,
}

struct CachedConnection {
    connection: Connection,
    last_success: Instant,
}

impl CachedConnection {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            last_success: Instant::now(),
        }
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn is_stale(&self) -> bool {
        self.last_success.elapsed() > CONNECTION_STALE_TIMEOUT
    }
}

struct RpcNodeActor {
    connections: LruCache<Identity, CachedConnection>,
}

impl RpcNodeActor {
    fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            connections: LruCache::new(cap),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(RpcCommand::Lookup { peer, reply }) => {
                        let _ = reply.send(self.lookup(&peer));
                    }
                    Some(RpcCommand::Insert { peer, connection }) => {
                        if let Some((evicted, old)) = self.connections.push(peer, CachedConnection::new(connection))
                            && evicted != peer
                        {
                            trace!(peer = %evicted.short(), "connection evicted from cache");
                            old.connection.close(0u32.into(), b"evicted");
                        }
                    }
                    Some(RpcCommand::Invalidate { peer }) => {
                        if self.connections.pop(&peer).is_some() {
                            debug!(peer = %peer.short(), "invalidated cached connection");
                        }
                    }
                    Some(RpcCommand::MarkSuccess { peer }) => {
                        if let Some(cached) = self.connections.get_mut(&peer) {
                            cached.last_success = Instant::now();
                        }
                    }
                    Some(RpcCommand::Quit) | None => {
                        debug!("rpc actor shutting down");
                        break;
                    }
                },
                _ = cleanup.tick() => self.cleanup(),
            }
        }
    }

    fn lookup(&mut self, peer: &Identity) -> Option<Connection> {
        let cached = self.connections.get(peer)?;
        if cached.is_closed() {
            self.connections.pop(peer);
            return None;
        }
        Some(cached.connection.clone())
    }

    fn cleanup(&mut self) {
        let dead: Vec<Identity> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_closed() || c.is_stale())
            .map(|(id, _)| *id)
            .collect();
        for peer in dead {
            self.connections.pop(&peer);
            trace!(peer = %peer.short(), "dropped idle connection");
        }
    }
}

#[derive(Clone)]
pub struct RpcNode {
    transport: Transport,
    self_contact: Contact,
    cmd_tx: mpsc::Sender<RpcCommand>,
}

impl RpcNode {
    pub fn new(transport: Transport, self_contact: Contact) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        tokio::spawn(RpcNodeActor::new().run(cmd_rx));
        Self {
            transport,
            self_contact,
            cmd_tx,
        }
    }

    pub fn self_contact(&self) -> &Contact {
        &self.self_contact
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
    }

    /// Cached connection to `contact`, dialing if none is open.
    pub async fn connect(&self, contact: &Contact) -> Result<Connection, DialError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::Lookup {
                peer: contact.identity,
                reply,
            })
            .await
            .map_err(|_| DialError::Closed)?;
        if let Some(conn) = rx.await.map_err(|_| DialError::Closed)? {
            return Ok(conn);
        }

        let conn = self.transport.dial(contact).await?;
        self.remember(contact.identity, conn.clone()).await;
        Ok(conn)
    }

    async fn remember(&self, peer: Identity, connection: Connection) {
        let _ = self
            .cmd_tx
            .send(RpcCommand::Insert { peer, connection })
            .await;
    }

    async fn rpc_raw(&self, to: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        let conn = self.connect(to).await?;
        let bytes = messages::serialize(&request).context("failed to encode request")?;

        match self.transport.send(&conn, &bytes).await {
            Ok(reply) => {
                let _ = self
                    .cmd_tx
                    .send(RpcCommand::MarkSuccess { peer: to.identity })
                    .await;
                let response: RpcResponse = messages::deserialize_bounded(&reply)
                    .map_err(|e| DialError::Codec(e.to_string()))?;
                Ok(response)
            }
            Err(e) => {
                let _ = self
                    .cmd_tx
                    .send(RpcCommand::Invalidate { peer: to.identity })
                    .await;
                Err(e.into())
            }
        }
    }

    async fn rpc(&self, to: &Contact, request: DhtNodeRequest) -> Result<DhtNodeResponse> {
        match self.rpc_raw(to, RpcRequest::DhtNode(request)).await? {
            RpcResponse::DhtNode(DhtNodeResponse::Error { message }) | RpcResponse::Error { message } => {
                Err(DialError::Remote(message).into())
            }
            RpcResponse::DhtNode(response) => Ok(response),
            other => anyhow::bail!("unexpected response to DHT request: {other:?}"),
        }
    }

    /// Accept one inbound connection and serve its streams until it closes.
    pub async fn serve(
        &self,
        dht: DhtNode<RpcNode>,
        gossipsub: GossipSub<RpcNode>,
        incoming: quinn::Incoming,
    ) -> Result<()> {
        let connection = incoming.await.context("handshake failed")?;
        let remote = connection.remote_address();

        let Some(peer) = extract_verified_identity(&connection) else {
            warn!(remote = %remote, "rejecting connection without verifiable identity");
            connection.close(0u32.into(), b"unverified");
            anyhow::bail!("could not verify peer identity");
        };

        debug!(peer = %peer.short(), remote = %remote, "inbound connection");
        self.remember(peer, connection.clone()).await;
        let mut from = Contact::single(peer, remote.to_string());
        from.touch();
        dht.observe_contact(from.clone()).await;

        loop {
            let stream = match connection.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed)
                | Err(quinn::ConnectionError::TimedOut) => {
                    trace!(peer = %peer.short(), "connection closed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let dht = dht.clone();
            let gossipsub = gossipsub.clone();
            let from = from.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_stream(dht, gossipsub, stream, remote, from).await {
                    debug!(error = %e, "stream error");
                }
            });
        }
    }
}

async fn reply(send: &mut quinn::SendStream, response: &RpcResponse) -> Result<()> {
    let bytes = messages::serialize(response).context("failed to encode response")?;
    transport::write_frame(send, &bytes).await?;
    send.finish()?;
    Ok(())
}

async fn handle_stream<N: DhtNodeRpc + GossipSubRpc>(
    dht: DhtNode<N>,
    gossipsub: GossipSub<N>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    remote: SocketAddr,
    from: Contact,
) -> Result<()> {
    let body = match tokio::time::timeout(
        REQUEST_READ_TIMEOUT,
        transport::read_frame(&mut recv, MAX_REQUEST_SIZE),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(DialError::ResponseTooLarge(len))) => {
            warn!(remote = %remote, size = len, "rejecting oversized request");
            let message = format!("request of {len} bytes exceeds {MAX_REQUEST_SIZE}");
            return reply(&mut send, &RpcResponse::Error { message }).await;
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => anyhow::bail!("request read timed out"),
    };

    let request: RpcRequest =
        messages::deserialize_bounded(&body).context("failed to decode request")?;

    if let Some(claimed) = request.claimed_sender()
        && claimed != from.identity
    {
        warn!(
            remote = %remote,
            claimed = %claimed.short(),
            verified = %from.identity.short(),
            "rejecting request: sender does not match connection identity"
        );
        let message = "sender does not match connection identity".to_string();
        return reply(&mut send, &RpcResponse::Error { message }).await;
    }

    let response = match tokio::time::timeout(
        REQUEST_PROCESS_TIMEOUT,
        dispatch(&dht, &gossipsub, request, &from),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            RpcResponse::Error {
                message: "request processing timed out".to_string(),
            }
        }
    };

    reply(&mut send, &response).await
}

async fn dispatch<N: DhtNodeRpc + GossipSubRpc>(
    dht: &DhtNode<N>,
    gossipsub: &GossipSub<N>,
    request: RpcRequest,
    from: &Contact,
) -> RpcResponse {
    match request {
        RpcRequest::DhtNode(request) => RpcResponse::DhtNode(handle_dht_rpc(dht, request).await),
        RpcRequest::GossipSub(message) => {
            trace!(from = %from.identity.short(), kind = message.kind(), "gossip request");
            match gossipsub.handle_message(from, message).await {
                Ok(()) => RpcResponse::GossipSubAck,
                Err(e) => {
                    debug!(from = %from.identity.short(), error = %e, "gossip message refused");
                    RpcResponse::Error {
                        message: e.to_string(),
                    }
                }
            }
        }
    }
}

async fn handle_dht_rpc<N: DhtNodeRpc>(dht: &DhtNode<N>, request: DhtNodeRequest) -> DhtNodeResponse {
    match request {
        DhtNodeRequest::Ping { from } => {
            trace!(from = %from.identity.short(), "PING");
            dht.observe_contact(from).await;
            DhtNodeResponse::Ack
        }
        DhtNodeRequest::FindNode { from, target } => {
            let nodes = dht.handle_find_node_request(&from, target).await;
            trace!(from = %from.identity.short(), target = %target.short(), returned = nodes.len(), "FIND_NODE");
            DhtNodeResponse::Nodes(nodes)
        }
        DhtNodeRequest::AddProvider { from, key } => {
            debug!(from = %from.identity.short(), key = %hex::encode(&key[..8]), "ADD_PROVIDER");
            dht.handle_add_provider(&from, key).await;
            DhtNodeResponse::Ack
        }
        DhtNodeRequest::GetProviders { from, key } => {
            let (providers, closer) = dht.handle_get_providers(&from, key).await;
            trace!(
                from = %from.identity.short(),
                providers = providers.len(),
                closer = closer.len(),
                "GET_PROVIDERS"
            );
            DhtNodeResponse::Providers { providers, closer }
        }
    }
}

fn bound_contacts(to: &Contact, mut contacts: Vec<Contact>) -> Vec<Contact> {
    if contacts.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            peer = %to.identity.short(),
            count = contacts.len(),
            "peer returned too many contacts, truncating"
        );
        contacts.truncate(MAX_CONTACTS_PER_RESPONSE);
    }
    contacts.retain(|c| c.validate_structure() && c.identity.is_valid());
    contacts
}

#[async_trait]
impl DhtNodeRpc for RpcNode {
    async fn find_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>> {
        let request = DhtNodeRequest::FindNode {
            from: self.self_contact.clone(),
            target,
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Nodes(nodes) => Ok(bound_contacts(to, nodes)),
            other => anyhow::bail!("unexpected response to FindNode: {other:?}"),
        }
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        let request = DhtNodeRequest::Ping {
            from: self.self_contact.clone(),
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to Ping: {other:?}"),
        }
    }

    async fn add_provider(&self, to: &Contact, key: Key) -> Result<()> {
        let request = DhtNodeRequest::AddProvider {
            from: self.self_contact.clone(),
            key,
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to AddProvider: {other:?}"),
        }
    }

    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)> {
        let request = DhtNodeRequest::GetProviders {
            from: self.self_contact.clone(),
            key,
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Providers { providers, closer } => {
                Ok((bound_contacts(to, providers), bound_contacts(to, closer)))
            }
            other => anyhow::bail!("unexpected response to GetProviders: {other:?}"),
        }
    }
}

#[async_trait]
impl GossipSubRpc for RpcNode {
    async fn send_gossipsub(&self, to: &Contact, message: GossipSubRequest) -> Result<()> {
        match self.rpc_raw(to, RpcRequest::GossipSub(message)).await? {
            RpcResponse::GossipSubAck => Ok(()),
            RpcResponse::Error { message } => Err(DialError::Remote(message).into()),
            other => anyhow::bail!("unexpected response to gossip message: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn bound_contacts_truncates_and_filters() {
        let to = Contact::single(Keypair::generate().identity(), "127.0.0.1:1");
        let mut contacts: Vec<Contact> = (0..MAX_CONTACTS_PER_RESPONSE + 10)
            .map(|_| Contact::single(Keypair::generate().identity(), "127.0.0.1:2"))
            .collect();
        contacts[0] = Contact::single(Identity::from_bytes([0u8; 32]), "127.0.0.1:3");
        contacts[1] = Contact::single(Keypair::generate().identity(), "");

        let bounded = bound_contacts(&to, contacts);
        assert_eq!(bounded.len(), MAX_CONTACTS_PER_RESPONSE - 2);
        assert!(bounded.iter().all(|c| c.identity.is_valid()));
    }

    #[tokio::test]
    async fn connect_caches_connection() {
        let server_kp = Keypair::generate();
        let server = Transport::listen(&server_kp, "127.0.0.1:0").unwrap();
        tokio::spawn({
            let server = server.clone();
            async move {
                let mut held = Vec::new();
                while let Some(incoming) = server.accept().await {
                    if let Ok(conn) = incoming.await {
                        held.push(conn);
                    }
                }
            }
        });

        let client_kp = Keypair::generate();
        let transport = Transport::listen(&client_kp, "127.0.0.1:0").unwrap();
        let rpc = RpcNode::new(transport, client_kp.contact(vec![]));
        let contact = Contact::single(server_kp.identity(), server.local_addr().unwrap().to_string());

        let first = rpc.connect(&contact).await.unwrap();
        // Insert is asynchronous; give the actor a moment to record it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = rpc.connect(&contact).await.unwrap();
        assert_eq!(first.stable_id(), second.stable_id());
        rpc.quit().await;
    }
}
