//! # QUIC Transport
//!
//! A [`Transport`] owns one QUIC endpoint that both listens and dials. Every
//! connection is mutually authenticated: the certificate on each side carries
//! that side's NodeID, and the dialer pins the NodeID it expects through SNI.
//!
//! One request/response exchange uses one bidirectional stream:
//!
//! ```text
//! dialer                           listener
//!   | -- [len: u32 BE][request] -->  |
//!   | <-- [len: u32 BE][response] -- |
//! ```
//!
//! Frames above the configured limit are refused before the body is read.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tracing::{debug, trace};

use crate::crypto::{
    create_client_config, create_server_config, extract_verified_identity,
    generate_ed25519_cert, identity_to_sni,
};
use crate::error::{DialError, StartupError};
use crate::identity::{Contact, Identity, Keypair};

/// Per-address handshake budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for one request/response exchange on an open connection.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest response frame accepted from a peer.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

#[derive(Clone)]
pub struct Transport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    local_id: Identity,
}

impl Transport {
    /// Bind a QUIC endpoint on `addr` (`IP:PORT`).
    pub fn listen(keypair: &Keypair, addr: &str) -> Result<Self, StartupError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| StartupError::InvalidListenAddress(addr.to_string()))?;
        Self::listen_on(keypair, addr)
    }

    pub fn listen_on(keypair: &Keypair, addr: SocketAddr) -> Result<Self, StartupError> {
        let (server_certs, server_key) =
            generate_ed25519_cert(keypair).map_err(|e| StartupError::Tls(format!("{e:#}")))?;
        let (client_certs, client_key) =
            generate_ed25519_cert(keypair).map_err(|e| StartupError::Tls(format!("{e:#}")))?;

        let server_config = create_server_config(server_certs, server_key)
            .map_err(|e| StartupError::Tls(format!("{e:#}")))?;
        let client_config = create_client_config(client_certs, client_key)
            .map_err(|e| StartupError::Tls(format!("{e:#}")))?;

        let mut endpoint = Endpoint::server(server_config, addr).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => StartupError::AddressInUse(addr),
            io::ErrorKind::AddrNotAvailable => StartupError::InvalidListenAddress(addr.to_string()),
            _ => StartupError::Endpoint {
                addr,
                reason: e.to_string(),
            },
        })?;
        endpoint.set_default_client_config(client_config.clone());

        debug!(addr = %addr, id = %keypair.identity().short(), "QUIC endpoint bound");

        Ok(Self {
            endpoint,
            client_config,
            local_id: keypair.identity(),
        })
    }

    pub fn local_id(&self) -> Identity {
        self.local_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Next inbound connection attempt; `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Connect to `contact`, trying each advertised address in order.
    pub async fn dial(&self, contact: &Contact) -> Result<Connection, DialError> {
        if contact.addrs.is_empty() {
            return Err(DialError::NoAddresses(contact.identity));
        }

        let mut last_error = None;
        for addr_str in &contact.addrs {
            let Ok(addr) = addr_str.parse::<SocketAddr>() else {
                last_error = Some(DialError::InvalidAddress(addr_str.clone()));
                continue;
            };
            match self.dial_addr(addr, &contact.identity).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    trace!(peer = %contact.identity.short(), addr = %addr, error = %e, "dial attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(DialError::NoAddresses(contact.identity)))
    }

    async fn dial_addr(&self, addr: SocketAddr, expected: &Identity) -> Result<Connection, DialError> {
        let sni = identity_to_sni(expected);
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)
            .map_err(|e| DialError::Unreachable {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| DialError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| DialError::Unreachable {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        // The server verifier already pins the key; re-check what the session recorded.
        match extract_verified_identity(&conn) {
            Some(actual) if actual == *expected => Ok(conn),
            Some(actual) => {
                conn.close(0u32.into(), b"identity mismatch");
                Err(DialError::IdentityMismatch {
                    addr: addr.to_string(),
                    expected: *expected,
                    actual,
                })
            }
            None => {
                conn.close(0u32.into(), b"no certificate");
                Err(DialError::Unreachable {
                    addr: addr.to_string(),
                    reason: "peer presented no certificate".into(),
                })
            }
        }
    }

    /// One framed request/response exchange on a fresh bidirectional stream.
    pub async fn send(&self, conn: &Connection, request: &[u8]) -> Result<Vec<u8>, DialError> {
        tokio::time::timeout(EXCHANGE_TIMEOUT, async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| DialError::Stream(e.to_string()))?;
            write_frame(&mut send, request).await?;
            send.finish().map_err(|e| DialError::Stream(e.to_string()))?;
            read_frame(&mut recv, MAX_RESPONSE_SIZE).await
        })
        .await
        .map_err(|_| DialError::Timeout(EXCHANGE_TIMEOUT))?
    }

    /// Close every connection and stop accepting new ones.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

pub(crate) async fn write_frame(send: &mut SendStream, bytes: &[u8]) -> Result<(), DialError> {
    let len = u32::try_from(bytes.len()).map_err(|_| DialError::ResponseTooLarge(bytes.len()))?;
    send.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| DialError::Stream(e.to_string()))?;
    send.write_all(bytes)
        .await
        .map_err(|e| DialError::Stream(e.to_string()))
}

pub(crate) async fn read_frame(recv: &mut RecvStream, max: usize) -> Result<Vec<u8>, DialError> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| DialError::Stream(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(DialError::ResponseTooLarge(len));
    }
    let mut body = vec![0u8; len];
    recv.read_exact(&mut body)
        .await
        .map_err(|e| DialError::Stream(e.to_string()))?;
    Ok(body)
}
