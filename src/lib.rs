//! # Librum - Peer-to-peer pub/sub chat
//!
//! Librum nodes find each other through a Kademlia DHT and local multicast,
//! then exchange chat messages over a gossip mesh per topic:
//!
//! - **Identity**: Ed25519 public keys double as node ids
//! - **DHT**: XOR-metric routing table, iterative lookups and rendezvous provider records
//! - **Discovery**: seed bootstrap, rendezvous announce/lookup, signed multicast announcements
//! - **Gossip**: per-topic mesh with heartbeats, signed messages and duplicate suppression
//! - **Transport**: QUIC with mutual TLS pinned to the peer's id
//!
//! ## Architecture
//!
//! Stateful components follow a handle/actor split: cheap cloneable handles
//! talk to a task that owns the state over channels. The routing table is the
//! exception and locks per bucket, so lookups and inserts from different peers
//! don't contend.
//!
//! Everything long-running takes a `CancellationToken` derived from the one
//! owned by [`Node`]; [`Node::shutdown`] stops the lot.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Wires all components behind `bind`/`start`/`join`/`shutdown` |
//! | `identity` | Keypairs, identities, contacts |
//! | `crypto` | Self-signed certificates, TLS verification, domain-separated signatures |
//! | `dht` | Routing table, iterative lookup, provider records, maintenance |
//! | `discovery` | Bootstrap, rendezvous and multicast peer discovery |
//! | `gossipsub` | Topic mesh, seen cache, heartbeats |
//! | `transport` | QUIC endpoint and length-prefixed framing |
//! | `protocols` | Network traits (`DhtNodeRpc`, `GossipSubRpc`, `PeerSource`) |
//! | `rpc` | QUIC implementation of the network traits |
//! | `messages` | Wire types and bounded bincode codec |
//! | `error` | Error taxonomy |
//! | `driver` | Console helpers for the binaries |

mod crypto;
pub mod dht;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod gossipsub;
mod identity;
pub mod messages;
mod node;
pub mod protocols;
mod rpc;
mod transport;

pub use dht::{DhtConfig, RoutingTable};
pub use discovery::{DiscoveryConfig, DiscoveryState};
pub use error::{DialError, DiscoveryError, LookupTimeout, MessageRejection, StartupError};
pub use gossipsub::{GossipSubConfig, SeenCache, Subscription};
pub use identity::{Contact, Identity, Keypair};
pub use messages::{Message, MessageId};
pub use node::{routable_addresses, Node, NodeConfig, Topic, DEFAULT_PORT};
