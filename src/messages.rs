//! # Wire Messages
//!
//! Every exchange on a QUIC stream is one [`RpcRequest`] answered by one
//! [`RpcResponse`], both bincode-encoded with fixed-width integers and a hard
//! size limit. Local-discovery datagrams carry a [`LocalAnnouncement`] with the
//! same codec.
//!
//! | Protocol | Request | Response |
//! |----------|---------|----------|
//! | DHT | `DhtNodeRequest` | `DhtNodeResponse` |
//! | Gossip | `GossipSubRequest` | `GossipSubAck` |
//!
//! Gossip message ids are `blake3(topic || source || seqno_le || data)`.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::dht::Key;
use crate::identity::{Contact, Identity};

/// Upper bound on any encoded frame.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Upper bound on a gossip payload.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Upper bound on a topic name, in characters.
pub const MAX_TOPIC_LENGTH: usize = 256;

pub type MessageId = [u8; 32];

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Decode with the size limit enforced; never use raw `bincode::deserialize`.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// `blake3(topic || source || seqno_le || data)`.
pub fn message_id(topic: &str, source: &Identity, seqno: u64, data: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(topic.as_bytes());
    hasher.update(source.as_bytes());
    hasher.update(&seqno.to_le_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Topic names are 1..=256 characters.
pub fn is_valid_topic(topic: &str) -> bool {
    let len = topic.chars().count();
    (1..=MAX_TOPIC_LENGTH).contains(&len)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtNodeRequest {
    Ping { from: Contact },
    FindNode { from: Contact, target: Identity },
    /// Store `from` as a provider under a rendezvous key.
    AddProvider { from: Contact, key: Key },
    GetProviders { from: Contact, key: Key },
}

impl DhtNodeRequest {
    pub fn sender(&self) -> &Contact {
        match self {
            DhtNodeRequest::Ping { from }
            | DhtNodeRequest::FindNode { from, .. }
            | DhtNodeRequest::AddProvider { from, .. }
            | DhtNodeRequest::GetProviders { from, .. } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtNodeResponse {
    Ack,
    Nodes(Vec<Contact>),
    Providers {
        providers: Vec<Contact>,
        closer: Vec<Contact>,
    },
    Error {
        message: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GossipSubRequest {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Graft {
        topic: String,
    },
    /// Leave the sender's mesh. The receiver must not re-graft for `backoff_secs`.
    Prune {
        topic: String,
        backoff_secs: Option<u64>,
    },
    Publish {
        topic: String,
        msg_id: MessageId,
        source: Identity,
        seqno: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    },
    /// Liveness probe sent to mesh peers, listing the topics shared with them.
    Heartbeat {
        topics: Vec<String>,
    },
}

impl GossipSubRequest {
    pub fn topic(&self) -> Option<&str> {
        match self {
            GossipSubRequest::Subscribe { topic }
            | GossipSubRequest::Unsubscribe { topic }
            | GossipSubRequest::Graft { topic }
            | GossipSubRequest::Prune { topic, .. }
            | GossipSubRequest::Publish { topic, .. } => Some(topic),
            GossipSubRequest::Heartbeat { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GossipSubRequest::Subscribe { .. } => "subscribe",
            GossipSubRequest::Unsubscribe { .. } => "unsubscribe",
            GossipSubRequest::Graft { .. } => "graft",
            GossipSubRequest::Prune { .. } => "prune",
            GossipSubRequest::Publish { .. } => "publish",
            GossipSubRequest::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// A message delivered to local subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub source: Identity,
    pub seqno: u64,
    pub msg_id: MessageId,
    pub data: Vec<u8>,
}

impl Message {
    /// The payload as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    DhtNode(DhtNodeRequest),
    GossipSub(GossipSubRequest),
}

impl RpcRequest {
    /// Identity claimed inside the request body, checked against the TLS identity.
    /// Gossip requests carry none and rely on the connection alone.
    pub fn claimed_sender(&self) -> Option<Identity> {
        match self {
            RpcRequest::DhtNode(req) => Some(req.sender().identity),
            RpcRequest::GossipSub(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    DhtNode(DhtNodeResponse),
    GossipSubAck,
    Error { message: String },
}

/// Multicast datagram advertising a node on the local network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAnnouncement {
    pub service_tag: String,
    pub identity: Identity,
    pub addrs: Vec<String>,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl LocalAnnouncement {
    /// Bytes covered by the signature: every field but the signature itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&(self.service_tag.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.service_tag.as_bytes());
        buf.extend_from_slice(self.identity.as_bytes());
        buf.extend_from_slice(&(self.addrs.len() as u32).to_le_bytes());
        for addr in &self.addrs {
            buf.extend_from_slice(&(addr.len() as u32).to_le_bytes());
            buf.extend_from_slice(addr.as_bytes());
        }
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf
    }

    pub fn contact(&self) -> Contact {
        Contact::unsigned(self.identity, self.addrs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn contact(seed: u8) -> Contact {
        Contact::single(Identity::from_bytes([seed; 32]), "127.0.0.1:4433")
    }

    #[test]
    fn malformed_and_truncated_frames_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_bounded::<RpcRequest>(&garbage).is_err());

        let request = RpcRequest::DhtNode(DhtNodeRequest::Ping { from: contact(1) });
        let bytes = serialize(&request).unwrap();
        assert!(deserialize_bounded::<RpcRequest>(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn oversized_frames_rejected() {
        let request = RpcRequest::GossipSub(GossipSubRequest::Publish {
            topic: "t".into(),
            msg_id: [0u8; 32],
            source: Identity::from_bytes([1u8; 32]),
            seqno: 1,
            data: vec![0u8; MAX_MESSAGE_SIZE + 1],
            signature: vec![0u8; 64],
        });
        assert!(serialize(&request).is_err());

        // A forged length prefix must not trigger a huge allocation.
        let mut forged = serialize(&RpcRequest::GossipSub(GossipSubRequest::Heartbeat {
            topics: vec!["t".into()],
        }))
        .unwrap();
        let len_offset = 4 + 4 + 8;
        forged[4 + 4..len_offset].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(deserialize_bounded::<RpcRequest>(&forged).is_err());
    }

    #[test]
    fn provider_request_decodes_with_key() {
        let key = *blake3::hash(b"librum-pubsub").as_bytes();
        let request = RpcRequest::DhtNode(DhtNodeRequest::AddProvider { from: contact(7), key });
        let decoded: RpcRequest = deserialize_bounded(&serialize(&request).unwrap()).unwrap();

        match decoded {
            RpcRequest::DhtNode(DhtNodeRequest::AddProvider { from, key: k }) => {
                assert_eq!(from.identity, Identity::from_bytes([7u8; 32]));
                assert_eq!(k, key);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn claimed_sender_only_for_dht_requests() {
        let find = RpcRequest::DhtNode(DhtNodeRequest::FindNode {
            from: contact(42),
            target: Identity::from_bytes([1u8; 32]),
        });
        assert_eq!(find.claimed_sender(), Some(Identity::from_bytes([42u8; 32])));

        let graft = RpcRequest::GossipSub(GossipSubRequest::Graft { topic: "t".into() });
        assert_eq!(graft.claimed_sender(), None);
    }

    #[test]
    fn gossip_topic_accessor() {
        let prune = GossipSubRequest::Prune {
            topic: "baz".into(),
            backoff_secs: Some(60),
        };
        assert_eq!(prune.topic(), Some("baz"));
        assert_eq!(prune.kind(), "prune");

        let heartbeat = GossipSubRequest::Heartbeat {
            topics: vec!["a".into(), "b".into()],
        };
        assert_eq!(heartbeat.topic(), None);
    }

    #[test]
    fn announcement_signing_bytes_cover_every_field() {
        let keypair = Keypair::generate();
        let base = LocalAnnouncement {
            service_tag: "librum-pubsub".into(),
            identity: keypair.identity(),
            addrs: vec!["192.168.1.2:7654".into()],
            timestamp_ms: 1_000,
            signature: vec![],
        };

        let mut moved = base.clone();
        moved.addrs = vec!["192.168.1.3:7654".into()];
        assert_ne!(base.signing_bytes(), moved.signing_bytes());

        let mut later = base.clone();
        later.timestamp_ms += 1;
        assert_ne!(base.signing_bytes(), later.signing_bytes());

        let mut signed = base.clone();
        signed.signature = vec![1u8; 64];
        assert_eq!(base.signing_bytes(), signed.signing_bytes());
    }

    #[test]
    fn message_id_commits_to_every_field() {
        let source = Identity::from_bytes([3u8; 32]);
        let base = message_id("t", &source, 1, b"hello");
        assert_eq!(base, message_id("t", &source, 1, b"hello"));
        assert_ne!(base, message_id("u", &source, 1, b"hello"));
        assert_ne!(base, message_id("t", &Identity::from_bytes([4u8; 32]), 1, b"hello"));
        assert_ne!(base, message_id("t", &source, 2, b"hello"));
        assert_ne!(base, message_id("t", &source, 1, b"hellp"));
    }

    #[test]
    fn topic_length_bounds() {
        assert!(!is_valid_topic(""));
        assert!(is_valid_topic("librum"));
        assert!(is_valid_topic(&"é".repeat(MAX_TOPIC_LENGTH)));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
    }

    #[test]
    fn message_text_is_lossy() {
        let msg = Message {
            topic: "t".into(),
            source: Identity::from_bytes([1u8; 32]),
            seqno: 0,
            msg_id: [0u8; 32],
            data: b"hello".to_vec(),
        };
        assert_eq!(msg.text(), "hello");
    }
}
