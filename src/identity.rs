//! # Identity and Peer Records
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the local node
//! - [`Identity`]: 32-byte public key, the node's NodeID
//! - [`Contact`]: PeerRecord with reachable addresses and a last-seen stamp
//!
//! ## Identity Model
//!
//! **NodeID = Ed25519 public key.** The id is derived deterministically from
//! the keypair, is self-certifying (the TLS handshake proves possession of the
//! private key) and doubles as the Kademlia XOR metric.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - XOR distance is symmetric and zero only for identical ids
//! - `Contact` equality and hashing consider the identity only

use anyhow::Context;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// PeerRecord for this keypair, stamped as seen now.
    pub fn contact(&self, addrs: Vec<String>) -> Contact {
        let mut contact = Contact::unsigned(self.identity(), addrs);
        contact.touch();
        contact
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short form for log fields: the first 8 bytes in hex.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// True if the bytes form a usable Ed25519 public key.
    ///
    /// All-zero and all-0xFF ids are rejected before the curve check.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

/// Lexicographic comparison of two XOR distances (big-endian integers).
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.as_slice().cmp(b.as_slice())
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Identity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A PeerRecord: who a peer is, where to reach it, and when we last heard from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addrs: Vec<String>,
    /// Milliseconds since the epoch of the last successful exchange (0 = never).
    #[serde(default)]
    pub last_seen: u64,
}

impl Contact {
    const MAX_ADDRS: usize = 16;
    const MAX_ADDR_LEN: usize = 256;

    /// A record that has not been seen yet.
    pub fn unsigned(identity: Identity, addrs: Vec<String>) -> Self {
        Self {
            identity,
            addrs,
            last_seen: 0,
        }
    }

    pub fn single(identity: Identity, addr: impl Into<String>) -> Self {
        Self::unsigned(identity, vec![addr.into()])
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }

    /// Mark the record as seen now.
    pub fn touch(&mut self) {
        self.last_seen = now_ms();
    }

    /// Milliseconds since the record was last seen; `u64::MAX` if never.
    pub fn age_ms(&self) -> u64 {
        if self.last_seen == 0 {
            return u64::MAX;
        }
        now_ms().saturating_sub(self.last_seen)
    }

    /// Validate bounds on records received from the network.
    ///
    /// Checks address count and length, not reachability.
    pub fn validate_structure(&self) -> bool {
        if self.addrs.len() > Self::MAX_ADDRS {
            return false;
        }
        self.addrs
            .iter()
            .all(|addr| !addr.is_empty() && addr.len() <= Self::MAX_ADDR_LEN)
    }

    /// `IP:PORT/HEXID` form accepted by the `-peers` flag.
    pub fn bootstrap_string(&self) -> Option<String> {
        self.primary_addr()
            .map(|addr| format!("{}/{}", addr, self.identity))
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl std::str::FromStr for Contact {
    type Err = anyhow::Error;

    /// Parse the `IP:PORT/HEXID` bootstrap form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, id) = s
            .trim()
            .rsplit_once('/')
            .with_context(|| format!("peer {s:?} is not IP:PORT/HEXID"))?;
        let addr: std::net::SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address {addr:?}"))?;
        let identity = Identity::from_hex(id).with_context(|| format!("invalid peer id {id:?}"))?;
        if !identity.is_valid() {
            anyhow::bail!("peer id {id} is not an Ed25519 public key");
        }
        Ok(Contact::single(identity, addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keypair_generation() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.identity(), kp2.identity());
        assert_ne!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn test_identity_derived_from_secret_key() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(kp.identity(), restored.identity());
        assert_eq!(*kp.identity().as_bytes(), kp.public_key_bytes());
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate();
        let message = b"hello world";

        let signature = kp.sign(message);
        assert!(kp.verify(message, &signature));

        assert!(!kp.verify(b"wrong message", &signature));
    }

    #[test]
    fn test_identity_xor_distance() {
        let a = Identity::from_bytes([0xFF; 32]);
        let b = Identity::from_bytes([0x00; 32]);
        let c = Identity::from_bytes([0xFF; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; 32]);
        assert_eq!(a.xor_distance(&c), [0u8; 32]);
    }

    #[test]
    fn test_distance_cmp_is_big_endian() {
        let mut near = [0u8; 32];
        near[31] = 0xFF;
        let mut far = [0u8; 32];
        far[0] = 0x01;

        assert_eq!(distance_cmp(&near, &far), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&far, &near), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&far, &far), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_identity_hex_roundtrip() {
        let kp = Keypair::generate();
        let id = kp.identity();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Identity::from_hex(&hex).unwrap(), id);
        assert_eq!(hex.parse::<Identity>().unwrap(), id);

        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex("zz").is_err());
    }

    #[test]
    fn test_identity_validity() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
        assert!(Keypair::generate().identity().is_valid());
    }

    #[test]
    fn test_contact_identity_equality() {
        let id = Keypair::generate().identity();
        let a = Contact::single(id, "127.0.0.1:1000");
        let b = Contact::single(id, "10.0.0.1:2000");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_contact_touch_and_age() {
        let id = Keypair::generate().identity();
        let mut contact = Contact::single(id, "127.0.0.1:1000");
        assert_eq!(contact.age_ms(), u64::MAX);

        contact.touch();
        assert!(contact.last_seen > 0);
        assert!(contact.age_ms() < 10_000);
    }

    #[test]
    fn test_contact_validate_structure() {
        let id = Keypair::generate().identity();
        assert!(Contact::single(id, "127.0.0.1:1000").validate_structure());

        let too_many = Contact::unsigned(id, (0..17).map(|i| format!("10.0.0.{i}:1")).collect());
        assert!(!too_many.validate_structure());

        assert!(!Contact::single(id, "").validate_structure());
        assert!(!Contact::single(id, "x".repeat(257)).validate_structure());
    }

    #[test]
    fn test_bootstrap_string_format() {
        let kp = Keypair::generate();
        let contact = kp.contact(vec!["127.0.0.1:7654".to_string()]);
        let s = contact.bootstrap_string().unwrap();
        assert_eq!(s, format!("127.0.0.1:7654/{}", kp.identity().to_hex()));
        assert!(Contact::unsigned(kp.identity(), vec![]).bootstrap_string().is_none());
    }

    #[test]
    fn bootstrap_string_parses_back() {
        let kp = Keypair::generate();
        let contact = kp.contact(vec!["10.0.0.5:7654".to_string()]);
        let parsed: Contact = contact.bootstrap_string().unwrap().parse().unwrap();
        assert_eq!(parsed.identity, kp.identity());
        assert_eq!(parsed.addrs, vec!["10.0.0.5:7654".to_string()]);
        assert_eq!(parsed.last_seen, 0);

        assert!("10.0.0.5:7654".parse::<Contact>().is_err());
        assert!(format!("not-an-addr/{}", kp.identity()).parse::<Contact>().is_err());
        assert!("10.0.0.5:7654/zz".parse::<Contact>().is_err());
        assert!(format!("10.0.0.5:7654/{}", "00".repeat(32)).parse::<Contact>().is_err());
    }
}
