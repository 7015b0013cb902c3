//! Error types shared across the node.
//!
//! Only [`StartupError`] is fatal. Everything else is reported to the caller
//! or logged by the background task that hit it.

use std::net::SocketAddr;
use std::time::Duration;

use displaydoc::Display;
use thiserror::Error;

use crate::crypto::SignatureError;
use crate::identity::Identity;

/// Errors that abort node startup.
#[derive(Debug, Display, Error)]
pub enum StartupError {
    /// listen address {0} is already in use
    AddressInUse(SocketAddr),

    /// malformed listen address: {0}
    InvalidListenAddress(String),

    /// TLS setup failed: {0}
    Tls(String),

    /// could not open QUIC endpoint on {addr}: {reason}
    Endpoint { addr: SocketAddr, reason: String },
}

/// Errors reaching or talking to a single peer. Never fatal.
#[derive(Debug, Display, Error)]
pub enum DialError {
    /// malformed peer address: {0}
    InvalidAddress(String),

    /// peer {0:?} advertises no addresses
    NoAddresses(Identity),

    /// peer unreachable at {addr}: {reason}
    Unreachable { addr: String, reason: String },

    /// peer at {addr} presented identity {actual:?}, expected {expected:?}
    IdentityMismatch {
        addr: String,
        expected: Identity,
        actual: Identity,
    },

    /// timed out after {0:?}
    Timeout(Duration),

    /// stream error: {0}
    Stream(String),

    /// response of {0} bytes exceeds limit
    ResponseTooLarge(usize),

    /// codec error: {0}
    Codec(String),

    /// peer answered with an error: {0}
    Remote(String),

    /// transport is shut down
    Closed,
}

impl DialError {
    /// Whether the peer was reached at all. Used to decide if a peer is dead.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            DialError::Unreachable { .. }
                | DialError::Timeout(_)
                | DialError::NoAddresses(_)
                | DialError::InvalidAddress(_)
                | DialError::IdentityMismatch { .. }
        )
    }
}

/// lookup did not converge within {elapsed:?}; returning {partial} partial results
#[derive(Debug, Display, Error, Clone, Copy)]
pub struct LookupTimeout {
    pub elapsed: Duration,
    pub partial: usize,
}

/// Errors from bootstrap and discovery.
#[derive(Debug, Display, Error)]
pub enum DiscoveryError {
    /// none of the {0} seed peers answered
    NoSeedReachable(usize),

    /// discovery was cancelled
    Cancelled,

    /// local multicast unavailable: {0}
    Multicast(String),

    /// malformed announcement: {0}
    BadAnnouncement(String),
}

/// Reasons an inbound or outbound gossip message is refused.
#[derive(Debug, Display, Error)]
pub enum MessageRejection {
    /// invalid signature: {0}
    InvalidSignature(#[from] SignatureError),

    /// message id does not match content
    MessageIdMismatch,

    /// payload of {0} bytes exceeds limit
    PayloadTooLarge(usize),

    /// topic name must be 1 to 256 characters
    InvalidTopic,

    /// not subscribed to topic {0}
    NotSubscribed(String),

    /// gossip layer is shut down
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_readable() {
        let err = StartupError::AddressInUse("127.0.0.1:7654".parse().unwrap());
        assert_eq!(err.to_string(), "listen address 127.0.0.1:7654 is already in use");

        let err = DiscoveryError::NoSeedReachable(3);
        assert_eq!(err.to_string(), "none of the 3 seed peers answered");

        let err = MessageRejection::from(SignatureError::VerificationFailed);
        assert_eq!(err.to_string(), "invalid signature: signature does not verify");
    }

    #[test]
    fn unreachable_classification() {
        assert!(DialError::Timeout(Duration::from_secs(1)).is_unreachable());
        assert!(DialError::InvalidAddress("x".into()).is_unreachable());
        assert!(!DialError::Remote("busy".into()).is_unreachable());
        assert!(!DialError::Closed.is_unreachable());
    }
}
