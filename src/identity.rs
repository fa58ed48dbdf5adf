//! # Identity
//!
//! Every node owns one long-lived Ed25519 keypair. Its peer identifier is
//! derived, not chosen:
//!
//! ```text
//! PeerId = BLAKE3("hashmesh-peer-id-v1:" || ed25519_public_key)
//! ```
//!
//! - [`Keypair`]: signing key plus helpers
//! - [`PeerId`]: 32-byte identifier used as the DHT key and XOR-metric position
//! - [`IdentityManager`]: loads or generates the key on disk and produces the
//!   self-signed transport certificate bound to it
//!
//! ## Export policy
//!
//! The secret key only leaves the manager through [`IdentityManager::export_secret`],
//! which refuses unless the manager was opened with `exportable = true`. Persisting a
//! freshly generated key and deriving the TLS certificate both need the raw secret, so
//! a non-exportable manager without an existing key file cannot start.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{self, TransportCertificate};
use crate::error::MeshError;

const PEER_ID_DOMAIN: &[u8] = b"hashmesh-peer-id-v1:";

const IDENTITY_KEY_FILE: &str = "identity.key";
const TRANSPORT_CERT_FILE: &str = "transport.cert";
const TRANSPORT_KEY_FILE: &str = "transport.key";

/// Milliseconds since the Unix epoch.
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

    pub(crate) fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes())
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
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().short())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Deterministic: the same public key always yields the same identifier.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PEER_ID_DOMAIN);
        hasher.update(public_key);
        Self(*hasher.finalize().as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
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

    /// First 8 bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compares two XOR distances as big-endian integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Identity Manager
// ============================================================================

pub struct IdentityManager {
    keypair: Keypair,
    exportable: bool,
    dir: Option<PathBuf>,
}

impl IdentityManager {
    /// Load `identity.key` from `dir`, or generate and persist a new key.
    pub fn load_or_generate(dir: &Path, exportable: bool) -> Result<Self, MeshError> {
        fs::create_dir_all(dir)
            .map_err(|e| MeshError::fatal(format!("cannot create {}: {e}", dir.display())))?;

        let key_path = dir.join(IDENTITY_KEY_FILE);
        if key_path.exists() {
            let contents = fs::read_to_string(&key_path)
                .map_err(|e| MeshError::fatal(format!("cannot read identity key: {e}")))?;
            let bytes = hex::decode(contents.trim())
                .map_err(|_| MeshError::fatal("identity key file is not valid hex"))?;
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| MeshError::fatal("identity key must be 32 bytes"))?;
            let keypair = Keypair::from_secret_key_bytes(&secret);
            info!(peer_id = %keypair.peer_id().short(), "loaded identity");
            return Ok(Self {
                keypair,
                exportable,
                dir: Some(dir.to_path_buf()),
            });
        }

        if !exportable {
            return Err(MeshError::fatal(
                "no identity key on disk and key export is disabled; cannot persist a new identity",
            ));
        }

        let manager = Self {
            keypair: Keypair::generate(),
            exportable,
            dir: Some(dir.to_path_buf()),
        };
        let secret = manager.export_secret()?;
        fs::write(&key_path, hex::encode(secret))
            .map_err(|e| MeshError::fatal(format!("cannot write identity key: {e}")))?;
        info!(peer_id = %manager.peer_id().short(), "generated new identity");
        Ok(manager)
    }

    /// In-memory identity with nothing persisted.
    pub fn ephemeral(exportable: bool) -> Self {
        Self {
            keypair: Keypair::generate(),
            exportable,
            dir: None,
        }
    }

    pub fn from_keypair(keypair: Keypair, exportable: bool) -> Self {
        Self {
            keypair,
            exportable,
            dir: None,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn export_secret(&self) -> Result<[u8; 32], MeshError> {
        if !self.exportable {
            return Err(MeshError::fatal("identity key is not exportable"));
        }
        Ok(self.keypair.secret_key_bytes())
    }

    /// Self-signed certificate for the QUIC endpoint.
    ///
    /// A cached certificate is reused when it parses, carries this identity's public key
    /// and has not passed `notAfter`; anything else is regenerated and re-cached.
    pub fn transport_certificate(&self) -> Result<TransportCertificate, MeshError> {
        if let Some(dir) = &self.dir
            && let Some(cached) = self.load_cached_certificate(dir)
        {
            return Ok(cached);
        }

        let secret = self.export_secret()?;
        let cert = crypto::generate_transport_certificate(&secret, &self.keypair.public_key_bytes())
            .map_err(|e| MeshError::fatal(format!("certificate generation failed: {e:#}")))?;

        if let Some(dir) = &self.dir {
            let written = fs::write(dir.join(TRANSPORT_CERT_FILE), &cert.cert_der)
                .and_then(|_| fs::write(dir.join(TRANSPORT_KEY_FILE), &cert.key_pkcs8));
            if let Err(e) = written {
                warn!(error = %e, "failed to cache transport certificate");
            }
        }
        debug!(fingerprint = %cert.fingerprint(), "generated transport certificate");
        Ok(cert)
    }

    fn load_cached_certificate(&self, dir: &Path) -> Option<TransportCertificate> {
        let cert_der = fs::read(dir.join(TRANSPORT_CERT_FILE)).ok()?;
        let key_pkcs8 = fs::read(dir.join(TRANSPORT_KEY_FILE)).ok()?;

        let public_key = crypto::extract_public_key_from_cert(&cert_der)?;
        if public_key != self.keypair.public_key_bytes() {
            debug!("cached certificate belongs to another key; regenerating");
            return None;
        }
        if !crypto::certificate_is_current(&cert_der) {
            debug!("cached certificate expired; regenerating");
            return None;
        }
        Some(TransportCertificate {
            cert_der,
            key_pkcs8,
        })
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("peer_id", &self.peer_id().short())
            .field("exportable", &self.exportable)
            .field("dir", &self.dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_deterministic_hash_of_public_key() {
        let kp = Keypair::generate();
        let again = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());

        assert_eq!(kp.peer_id(), again.peer_id());
        assert_eq!(kp.peer_id(), PeerId::from_public_key(&kp.public_key_bytes()));
        assert_ne!(kp.peer_id().as_bytes(), &kp.public_key_bytes());
    }

    #[test]
    fn distinct_keys_give_distinct_ids() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let signature = kp.sign(b"hello world");
        assert!(kp.verify(b"hello world", &signature));
        assert!(!kp.verify(b"wrong message", &signature));
    }

    #[test]
    fn xor_distance_properties() {
        let a = PeerId::from_bytes([0xFF; 32]);
        let b = PeerId::from_bytes([0x00; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; 32]);
    }

    #[test]
    fn hex_roundtrip_and_rejects_bad_length() {
        let id = Keypair::generate().peer_id();
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("zz").is_err());
        assert_eq!(id.short().len(), 16);
    }

    #[test]
    fn load_or_generate_persists_identity() {
        let dir = tempfile::tempdir().unwrap();

        let first = IdentityManager::load_or_generate(dir.path(), true).unwrap();
        let second = IdentityManager::load_or_generate(dir.path(), true).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());

        // An existing key still loads when export is switched off afterwards.
        let locked = IdentityManager::load_or_generate(dir.path(), false).unwrap();
        assert_eq!(locked.peer_id(), first.peer_id());
    }

    #[test]
    fn non_exportable_without_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = IdentityManager::load_or_generate(dir.path(), false).unwrap_err();
        assert!(matches!(err, MeshError::Fatal(_)));
    }

    #[test]
    fn non_exportable_identity_cannot_mint_certificate() {
        let manager = IdentityManager::ephemeral(false);
        assert!(manager.export_secret().is_err());
        assert!(matches!(
            manager.transport_certificate(),
            Err(MeshError::Fatal(_))
        ));
    }

    #[test]
    fn certificate_is_cached_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = IdentityManager::load_or_generate(dir.path(), true).unwrap();

        let first = manager.transport_certificate().unwrap();
        let second = manager.transport_certificate().unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert!(dir.path().join(TRANSPORT_CERT_FILE).exists());
    }

    #[test]
    fn certificate_for_other_key_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let stale = IdentityManager::load_or_generate(dir.path(), true).unwrap();
        let stale_cert = stale.transport_certificate().unwrap();

        fs::remove_file(dir.path().join(IDENTITY_KEY_FILE)).unwrap();
        let fresh = IdentityManager::load_or_generate(dir.path(), true).unwrap();
        let fresh_cert = fresh.transport_certificate().unwrap();

        assert_ne!(stale_cert.fingerprint(), fresh_cert.fingerprint());
        assert_eq!(
            crypto::extract_public_key_from_cert(&fresh_cert.cert_der),
            Some(fresh.keypair().public_key_bytes())
        );
    }
}
