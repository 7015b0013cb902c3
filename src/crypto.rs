//! # Signatures and TLS
//!
//! - **Signatures**: Ed25519 over a domain prefix, so a gossip signature can
//!   never be replayed as a local-discovery announcement and vice versa
//! - **TLS**: self-signed Ed25519 certificates whose public key is the NodeID,
//!   verified by custom rustls verifiers on both sides of the connection
//!
//! There is no CA. The dialer names the NodeID it expects in the SNI
//! (`<32 hex>.<32 hex>`) and the server certificate must carry exactly that key.
//! The listener accepts any well-formed Ed25519 client certificate and reads the
//! peer's identity out of it after the handshake.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use quinn::{ClientConfig, IdleTimeout, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use displaydoc::Display;
use thiserror::Error;

use crate::identity::{Identity, Keypair};

/// Why a domain-separated signature was rejected.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// signature is missing
    Missing,

    /// signature must be 64 bytes
    InvalidLength,

    /// signature does not verify
    VerificationFailed,

    /// signer id is not an Ed25519 point
    InvalidPublicKey,
}

/// Prefix for gossip Publish signatures.
pub const GOSSIP_SIGNATURE_DOMAIN: &[u8] = b"librum-gossip-v1:";

/// Prefix for local multicast announcements.
pub const ANNOUNCE_SIGNATURE_DOMAIN: &[u8] = b"librum-announce-v1:";

/// ALPN protocol id; peers speaking anything else fail the handshake.
pub const ALPN: &[u8] = b"librum";

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE: Duration = Duration::from_secs(15);
const MAX_BIDI_STREAMS: u32 = 128;

static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + data.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Strict Ed25519 verification of `signature` over `domain || data`.
pub fn verify_with_domain(
    signer: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let key = VerifyingKey::try_from(signer.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    key.verify_strict(&prefixed(domain, data), &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Wrap the raw 32-byte Ed25519 seed in a PKCS#8 v1 document.
fn ed25519_pkcs8(secret: &[u8; 32]) -> Vec<u8> {
    // SEQUENCE { INTEGER 0, SEQUENCE { OID 1.3.101.112 }, OCTET STRING { OCTET STRING seed } }
    const HEADER: [u8; 16] = [
        0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
        0x20,
    ];
    let mut der = Vec::with_capacity(HEADER.len() + secret.len());
    der.extend_from_slice(&HEADER);
    der.extend_from_slice(secret);
    der
}

/// Self-signed certificate carrying the keypair's public key.
pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let pkcs8 = ed25519_pkcs8(&keypair.secret_key_bytes());
    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let signing_key =
        rcgen::KeyPair::try_from(&pkcs8_der).context("Ed25519 key rejected by rcgen")?;

    let mut params = rcgen::CertificateParams::new(vec!["librum".to_string()])
        .context("invalid certificate parameters")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.identity().to_hex()),
    );

    let cert = params
        .self_signed(&signing_key)
        .context("self-signing certificate failed")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

fn transport_config() -> Result<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(IDLE_TIMEOUT).context("idle timeout out of range")?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    transport.max_concurrent_bidi_streams(MAX_BIDI_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    Ok(Arc::new(transport))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_client_cert_verifier(Arc::new(AnyEd25519ClientVerifier))
        .with_single_cert(certs, key)
        .context("server certificate rejected")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .context("TLS config unusable for QUIC")?;
    let mut config = ServerConfig::with_crypto(Arc::new(quic));
    config.transport_config(transport_config()?);
    Ok(config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut tls = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedIdentityVerifier))
        .with_client_auth_cert(certs, key)
        .context("client certificate rejected")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .context("TLS config unusable for QUIC")?;
    let mut config = ClientConfig::new(Arc::new(quic));
    config.transport_config(transport_config()?);
    Ok(config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    cert.public_key()
        .subject_public_key
        .data
        .as_ref()
        .try_into()
        .ok()
}

/// NodeID proven by the peer's certificate on an established connection.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let peer = connection.peer_identity()?;
    let certs: &Vec<CertificateDer<'static>> = peer.downcast_ref()?;
    let public_key = extract_public_key_from_cert(certs.first()?.as_ref())?;
    Some(Identity::from_bytes(public_key))
}

pub(crate) fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_identity_from_sni(sni: &str) -> Option<Identity> {
    let joined: String = sni.split('.').collect();
    Identity::from_hex(&joined).ok()
}

fn bad_cert(err: CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(err)
}

fn verify_tls13(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls13_signature(
        message,
        cert,
        dss,
        &CRYPTO_PROVIDER.signature_verification_algorithms,
    )
}

#[derive(Debug)]
struct AnyEd25519ClientVerifier;

impl rustls::server::danger::ClientCertVerifier for AnyEd25519ClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_cert(CertificateError::BadEncoding))?;
        if !Identity::from_bytes(public_key).is_valid() {
            return Err(bad_cert(CertificateError::ApplicationVerificationFailure));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Accepts a server certificate only if its key equals the NodeID in the SNI.
#[derive(Debug)]
struct PinnedIdentityVerifier;

impl rustls::client::danger::ServerCertVerifier for PinnedIdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let ServerName::DnsName(name) = server_name else {
            return Err(bad_cert(CertificateError::ApplicationVerificationFailure));
        };
        let expected = parse_identity_from_sni(name.as_ref())
            .ok_or(bad_cert(CertificateError::BadEncoding))?;
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_cert(CertificateError::BadEncoding))?;

        if Identity::from_bytes(public_key) != expected {
            return Err(bad_cert(CertificateError::NotValidForName));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}
