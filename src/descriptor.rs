//! # Peer Descriptors
//!
//! A [`PeerDescriptor`] is what the DHT stores under a peer id: how to reach the
//! peer, what it serves, and for how long the record is good. It is signed by the
//! peer's identity key and immutable once signed; republishing produces a new
//! descriptor with a later `issued_at` that replaces the old one wholesale.
//!
//! Verification checks three things:
//!
//! 1. `peer_id == PeerId::from_public_key(public_key)`
//! 2. the signature over the canonical payload under [`DESCRIPTOR_SIGNATURE_DOMAIN`]
//! 3. freshness: not expired, not issued implausibly far in the future

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, DESCRIPTOR_SIGNATURE_DOMAIN};
use crate::identity::{now_ms, Keypair, PeerId};

pub const CAP_DHT: u32 = 1 << 0;
pub const CAP_SYNC: u32 = 1 << 1;
pub const CAP_SEARCH: u32 = 1 << 2;
pub const CAP_GOSSIP: u32 = 1 << 3;
pub const CAP_CHUNKS: u32 = 1 << 4;

pub const CAP_ALL: u32 = CAP_DHT | CAP_SYNC | CAP_SEARCH | CAP_GOSSIP | CAP_CHUNKS;

/// Issued-at values this far ahead of the local clock are refused.
const MAX_CLOCK_SKEW_MS: u64 = 5 * 60 * 1000;

const MAX_ADDR_LEN: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoints {
    pub dht_addr: String,
    pub overlay_addr: String,
}

impl Endpoints {
    pub fn same(addr: SocketAddr) -> Self {
        Self {
            dht_addr: addr.to_string(),
            overlay_addr: addr.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    PeerIdMismatch,
    Signature(SignatureError),
    Expired,
    IssuedInFuture,
    Malformed(&'static str),
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorError::PeerIdMismatch => write!(f, "peer id does not match public key"),
            DescriptorError::Signature(e) => write!(f, "descriptor signature invalid: {e}"),
            DescriptorError::Expired => write!(f, "descriptor expired"),
            DescriptorError::IssuedInFuture => write!(f, "descriptor issued in the future"),
            DescriptorError::Malformed(what) => write!(f, "malformed descriptor: {what}"),
        }
    }
}

impl std::error::Error for DescriptorError {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub public_key: [u8; 32],
    pub endpoints: Endpoints,
    pub capabilities: u32,
    pub signature: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub issued_at: u64,
    pub expires_at: u64,
}

impl PeerDescriptor {
    pub fn sign(keypair: &Keypair, endpoints: Endpoints, capabilities: u32, ttl: Duration) -> Self {
        let issued_at = now_ms();
        Self::sign_at(keypair, endpoints, capabilities, issued_at, issued_at + ttl.as_millis() as u64)
    }

    pub(crate) fn sign_at(
        keypair: &Keypair,
        endpoints: Endpoints,
        capabilities: u32,
        issued_at: u64,
        expires_at: u64,
    ) -> Self {
        let mut descriptor = Self {
            peer_id: keypair.peer_id(),
            public_key: keypair.public_key_bytes(),
            endpoints,
            capabilities,
            signature: Vec::new(),
            issued_at,
            expires_at,
        };
        descriptor.signature =
            sign_with_domain(keypair, DESCRIPTOR_SIGNATURE_DOMAIN, &descriptor.signed_payload());
        descriptor
    }

    /// Length-prefixed fields, so no two distinct descriptors share a payload.
    pub fn signed_payload(&self) -> Vec<u8> {
        let dht = self.endpoints.dht_addr.as_bytes();
        let overlay = self.endpoints.overlay_addr.as_bytes();
        let mut data = Vec::with_capacity(32 + 32 + 8 + dht.len() + overlay.len() + 4 + 16);
        data.extend_from_slice(self.peer_id.as_bytes());
        data.extend_from_slice(&self.public_key);
        data.extend_from_slice(&(dht.len() as u32).to_be_bytes());
        data.extend_from_slice(dht);
        data.extend_from_slice(&(overlay.len() as u32).to_be_bytes());
        data.extend_from_slice(overlay);
        data.extend_from_slice(&self.capabilities.to_be_bytes());
        data.extend_from_slice(&self.issued_at.to_be_bytes());
        data.extend_from_slice(&self.expires_at.to_be_bytes());
        data
    }

    pub fn verify(&self) -> Result<(), DescriptorError> {
        self.verify_at(now_ms())
    }

    pub fn verify_at(&self, now_ms: u64) -> Result<(), DescriptorError> {
        if self.endpoints.overlay_addr.is_empty() || self.endpoints.overlay_addr.len() > MAX_ADDR_LEN {
            return Err(DescriptorError::Malformed("overlay address"));
        }
        if self.endpoints.dht_addr.len() > MAX_ADDR_LEN {
            return Err(DescriptorError::Malformed("dht address"));
        }
        if self.expires_at <= self.issued_at {
            return Err(DescriptorError::Malformed("expiry precedes issue time"));
        }
        if PeerId::from_public_key(&self.public_key) != self.peer_id {
            return Err(DescriptorError::PeerIdMismatch);
        }
        if self.is_expired_at(now_ms) {
            return Err(DescriptorError::Expired);
        }
        if self.issued_at > now_ms.saturating_add(MAX_CLOCK_SKEW_MS) {
            return Err(DescriptorError::IssuedInFuture);
        }
        verify_with_domain(
            &self.public_key,
            DESCRIPTOR_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
        .map_err(DescriptorError::Signature)
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    /// Whether `self` should replace `other` for the same peer.
    pub fn supersedes(&self, other: &PeerDescriptor) -> bool {
        self.peer_id == other.peer_id && self.issued_at > other.issued_at
    }

    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities & capability == capability
    }

    pub fn overlay_socket_addr(&self) -> Option<SocketAddr> {
        self.endpoints.overlay_addr.parse().ok()
    }
}

/// Where to dial a peer: an overlay address, plus the peer id when it is known.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub addr: String,
    pub peer_id: Option<PeerId>,
}

impl PeerAddr {
    pub fn new(addr: impl Into<String>, peer_id: Option<PeerId>) -> Self {
        Self {
            addr: addr.into(),
            peer_id,
        }
    }

    /// Peer id hex when known, else the address. Used as the pin identifier.
    pub fn identifier(&self) -> String {
        match &self.peer_id {
            Some(id) => id.to_hex(),
            None => self.addr.clone(),
        }
    }
}

impl From<&PeerDescriptor> for PeerAddr {
    fn from(descriptor: &PeerDescriptor) -> Self {
        Self {
            addr: descriptor.endpoints.overlay_addr.clone(),
            peer_id: Some(descriptor.peer_id),
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.peer_id {
            Some(id) => write!(f, "{}@{}", id.short(), self.addr),
            None => f.write_str(&self.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn descriptor(keypair: &Keypair) -> PeerDescriptor {
        PeerDescriptor::sign(
            keypair,
            Endpoints::same("192.168.1.10:50305".parse().unwrap()),
            CAP_ALL,
            HOUR,
        )
    }

    #[test]
    fn signed_descriptor_verifies() {
        let kp = Keypair::generate();
        let d = descriptor(&kp);
        assert_eq!(d.peer_id, kp.peer_id());
        assert!(d.verify().is_ok());
        assert!(d.has_capability(CAP_SYNC | CAP_GOSSIP));
    }

    #[test]
    fn tampered_endpoint_fails_signature() {
        let mut d = descriptor(&Keypair::generate());
        d.endpoints.overlay_addr = "6.6.6.6:50305".to_string();
        assert!(matches!(d.verify(), Err(DescriptorError::Signature(_))));
    }

    #[test]
    fn foreign_peer_id_rejected() {
        let mut d = descriptor(&Keypair::generate());
        d.peer_id = Keypair::generate().peer_id();
        assert_eq!(d.verify(), Err(DescriptorError::PeerIdMismatch));
    }

    #[test]
    fn swapped_key_rejected() {
        let victim = descriptor(&Keypair::generate());
        let attacker = Keypair::generate();
        let mut forged = descriptor(&attacker);
        forged.peer_id = victim.peer_id;
        assert_eq!(forged.verify(), Err(DescriptorError::PeerIdMismatch));
    }

    #[test]
    fn expiry_is_enforced() {
        let kp = Keypair::generate();
        let d = PeerDescriptor::sign_at(
            &kp,
            Endpoints::same("127.0.0.1:1".parse().unwrap()),
            CAP_DHT,
            1_000,
            2_000,
        );
        assert!(d.verify_at(1_500).is_ok());
        assert_eq!(d.verify_at(2_000), Err(DescriptorError::Expired));
    }

    #[test]
    fn future_issue_time_rejected() {
        let kp = Keypair::generate();
        let now = now_ms();
        let d = PeerDescriptor::sign_at(
            &kp,
            Endpoints::same("127.0.0.1:1".parse().unwrap()),
            CAP_DHT,
            now + MAX_CLOCK_SKEW_MS + 60_000,
            now + 10 * MAX_CLOCK_SKEW_MS,
        );
        assert_eq!(d.verify_at(now), Err(DescriptorError::IssuedInFuture));
    }

    #[test]
    fn newer_descriptor_supersedes() {
        let kp = Keypair::generate();
        let endpoints = Endpoints::same("127.0.0.1:1".parse().unwrap());
        let old = PeerDescriptor::sign_at(&kp, endpoints.clone(), CAP_DHT, 1_000, 9_000);
        let new = PeerDescriptor::sign_at(&kp, endpoints.clone(), CAP_DHT, 2_000, 9_000);
        let other = PeerDescriptor::sign_at(&Keypair::generate(), endpoints, CAP_DHT, 3_000, 9_000);

        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
        assert!(!other.supersedes(&old));
    }

    #[test]
    fn peer_addr_identifier_prefers_peer_id() {
        let d = descriptor(&Keypair::generate());
        let by_id = PeerAddr::from(&d);
        assert_eq!(by_id.identifier(), d.peer_id.to_hex());

        let by_addr = PeerAddr::new("10.0.0.5:50305", None);
        assert_eq!(by_addr.identifier(), "10.0.0.5:50305");
    }
}
