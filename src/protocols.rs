//! RPC traits the routing table and gossip layer are written against.
//!
//! | Protocol | Trait | Used by |
//! |----------|-------|---------|
//! | DHT | [`DhtNodeRpc`] | `dht`, `discovery` |
//! | Gossip | [`GossipSubRpc`] | `gossipsub` |
//! | Candidates | [`PeerSource`] | `gossipsub` |
//!
//! `rpc::RpcNode` implements both over QUIC. Tests substitute in-memory networks.

use anyhow::Result;
use async_trait::async_trait;

use crate::dht::Key;
use crate::identity::{Contact, Identity};
use crate::messages::GossipSubRequest;

#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Ask `to` for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>>;

    /// Liveness probe.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Register the local node as a provider for `key` on `to`.
    async fn add_provider(&self, to: &Contact, key: Key) -> Result<()>;

    /// Providers `to` holds for `key`, plus contacts closer to the key.
    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)>;
}

#[async_trait]
pub trait GossipSubRpc: Send + Sync + 'static {
    /// Deliver one gossip message and wait for the peer's acknowledgement.
    async fn send_gossipsub(&self, to: &Contact, message: GossipSubRequest) -> Result<()>;
}

/// Supplies gossip candidates, normally the routing table.
pub trait PeerSource: Send + Sync + 'static {
    fn candidates(&self, count: usize) -> Vec<Contact>;
}
