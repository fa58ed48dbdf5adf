//! # Cryptographic Infrastructure
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **Certificates**: self-signed Ed25519 transport certificate bound to the node key
//! - **Fingerprints**: BLAKE3 over the certificate DER, the value the pin store keeps
//! - **TLS**: QUIC client/server configs with custom verifiers
//!
//! ## Verification model
//!
//! There is no CA. Both sides present self-signed Ed25519 certificates (mutual TLS).
//! The client verifier supports two dial modes, selected by the SNI it was given:
//!
//! - **By peer id**: SNI is the peer id hex split into two labels. The certificate key
//!   must hash to that peer id or the handshake fails inside TLS.
//! - **By address**: SNI is [`GENERIC_SERVER_NAME`]. Any well-formed Ed25519 certificate
//!   passes TLS; trust is then decided by the TOFU pin on the certificate fingerprint.
//!
//! The `dangerous()` rustls APIs are how custom verification is plugged in; they are
//! not a bypass.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use quinn::{ClientConfig, IdleTimeout, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Keypair, PeerId};

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Peer descriptors published into the DHT.
pub const DESCRIPTOR_SIGNATURE_DOMAIN: &[u8] = b"hashmesh-descriptor-v1:";

/// Application handshake binding a peer id to a TLS channel.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"hashmesh-handshake-v1:";

pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify an Ed25519 signature made with [`sign_with_domain`].
///
/// Uses `verify_strict`, so malleable and small-order encodings are rejected.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Transport Certificate
// ============================================================================

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for every overlay connection.
pub const ALPN: &[u8] = b"hashmesh/1";

/// SNI used when dialing an address whose peer id is not known yet.
pub const GENERIC_SERVER_NAME: &str = "hashmesh";

const IDLE_TIMEOUT_MS: u32 = 60_000;
const KEEP_ALIVE: std::time::Duration = std::time::Duration::from_secs(15);
const MAX_CONCURRENT_STREAMS: u32 = 64;

/// DER certificate plus its PKCS#8 private key.
#[derive(Clone)]
pub struct TransportCertificate {
    pub cert_der: Vec<u8>,
    pub key_pkcs8: Vec<u8>,
}

impl TransportCertificate {
    pub fn fingerprint(&self) -> String {
        certificate_fingerprint(&self.cert_der)
    }

    fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.cert_der.clone())]
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()))
    }
}

impl std::fmt::Debug for TransportCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCertificate")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

pub fn generate_transport_certificate(
    secret_key: &[u8; 32],
    public_key: &[u8; 32],
) -> Result<TransportCertificate> {
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    // PKCS#8 v1: SEQ { version, AlgorithmIdentifier { ed25519 }, OCTET STRING { OCTET STRING key } }
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![GENERIC_SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(PeerId::from_public_key(public_key).to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    Ok(TransportCertificate {
        cert_der: cert.der().to_vec(),
        key_pkcs8: pkcs8,
    })
}

/// Lowercase hex BLAKE3 of the certificate DER.
pub fn certificate_fingerprint(cert_der: &[u8]) -> String {
    blake3::hash(cert_der).to_hex().to_string()
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// `true` when the certificate parses and the current time is inside its validity window.
pub fn certificate_is_current(cert_der: &[u8]) -> bool {
    use x509_parser::prelude::*;

    match X509Certificate::from_der(cert_der) {
        Ok((_, cert)) => cert.validity().is_valid(),
        Err(_) => false,
    }
}

/// The end-entity certificate the remote presented during the TLS handshake.
pub fn peer_certificate(connection: &quinn::Connection) -> Option<Vec<u8>> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer<'static>> = peer_identity.downcast_ref()?;
    certs.first().map(|c| c.as_ref().to_vec())
}

/// Authenticated remote: the peer id derived from its certificate key, the key
/// itself, and the certificate fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCertificate {
    pub peer_id: PeerId,
    pub public_key: [u8; 32],
    pub fingerprint: String,
}

pub fn remote_certificate(connection: &quinn::Connection) -> Option<RemoteCertificate> {
    let der = peer_certificate(connection)?;
    let public_key = extract_public_key_from_cert(&der)?;
    Some(RemoteCertificate {
        peer_id: PeerId::from_public_key(&public_key),
        public_key,
        fingerprint: certificate_fingerprint(&der),
    })
}

// ============================================================================
// QUIC / TLS Configuration
// ============================================================================

fn transport_config() -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(IDLE_TIMEOUT_MS))));
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    transport.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    transport
}

pub fn create_server_config(cert: &TransportCertificate) -> Result<quinn::ServerConfig> {
    let client_cert_verifier = Arc::new(Ed25519ClientCertVerifier);
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(cert.chain(), cert.private_key())
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()));

    Ok(server_config)
}

pub fn create_client_config(cert: &TransportCertificate) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519ServerCertVerifier))
        .with_client_auth_cert(cert.chain(), cert.private_key())
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()));

    Ok(client_config)
}

pub(crate) fn peer_id_to_sni(peer_id: &PeerId) -> String {
    let hex = peer_id.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_peer_id_from_sni(sni: &str) -> Option<PeerId> {
    let hex_str: String = sni.split('.').collect();
    PeerId::from_hex(&hex_str).ok()
}

fn is_valid_ed25519_key(public_key: &[u8; 32]) -> bool {
    VerifyingKey::from_bytes(public_key).is_ok()
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ))?;

        if !is_valid_ed25519_key(&public_key) {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519ServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        };

        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ))?;
        if !is_valid_ed25519_key(&public_key) {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        if sni == GENERIC_SERVER_NAME {
            // Address dial: the pin store decides.
            return Ok(rustls::client::danger::ServerCertVerified::assertion());
        }

        let expected = parse_peer_id_from_sni(sni).ok_or_else(|| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;
        if PeerId::from_public_key(&public_key) != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn cert_for(keypair: &Keypair) -> TransportCertificate {
        generate_transport_certificate(&keypair.secret_key_bytes(), &keypair.public_key_bytes())
            .expect("cert generation must succeed")
    }

    #[test]
    fn certificate_carries_identity_public_key() {
        for _ in 0..10 {
            let keypair = Keypair::generate();
            let cert = cert_for(&keypair);

            let extracted = extract_public_key_from_cert(&cert.cert_der)
                .expect("public key extraction must succeed");
            assert_eq!(extracted, keypair.public_key_bytes());
            assert_eq!(PeerId::from_public_key(&extracted), keypair.peer_id());
        }
    }

    #[test]
    fn fresh_certificate_is_current() {
        let cert = cert_for(&Keypair::generate());
        assert!(certificate_is_current(&cert.cert_der));
        assert!(!certificate_is_current(b"not a certificate"));
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let cert = cert_for(&Keypair::generate());
        let fp = cert.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, certificate_fingerprint(&cert.cert_der));
        assert_eq!(fp, fp.to_lowercase());
    }

    #[test]
    fn domain_separation_prevents_cross_use() {
        let kp = Keypair::generate();
        let pk = kp.public_key_bytes();
        let sig = sign_with_domain(&kp, DESCRIPTOR_SIGNATURE_DOMAIN, b"payload");

        assert!(verify_with_domain(&pk, DESCRIPTOR_SIGNATURE_DOMAIN, b"payload", &sig).is_ok());
        assert_eq!(
            verify_with_domain(&pk, HANDSHAKE_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_with_domain(&pk, DESCRIPTOR_SIGNATURE_DOMAIN, b"payload", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, DESCRIPTOR_SIGNATURE_DOMAIN, b"payload", &sig[..10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn sni_roundtrip() {
        let id = Keypair::generate().peer_id();
        let sni = peer_id_to_sni(&id);
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(parse_peer_id_from_sni(&sni), Some(id));
        assert_eq!(parse_peer_id_from_sni(GENERIC_SERVER_NAME), None);
    }

    #[test]
    fn configs_build_from_generated_certificate() {
        let cert = cert_for(&Keypair::generate());
        assert!(create_server_config(&cert).is_ok());
        assert!(create_client_config(&cert).is_ok());
    }
}
