//! # HashMesh - Private Decentralized Mesh Overlay
//!
//! HashMesh lets a set of mutually distrustful peers find each other, open
//! authenticated channels, and replicate a content-hash index between them:
//!
//! - **Identity**: Ed25519 keypairs; a peer id is the BLAKE3 hash of the public key
//! - **DHT**: Kademlia-style routing of signed, expiring peer descriptors
//! - **Transport**: QUIC with mutual TLS, trust-on-first-use certificate pinning
//!   and an application handshake bound to the TLS channel
//! - **Admission**: replay cache, per-operation rate limits and a blocklist
//! - **Sync**: delta replication of the hash index with proof-of-possession
//! - **Gossip**: realm-scoped flooding with TTL and hop limits
//!
//! ## Architecture
//!
//! State owned by a task (DHT routing, gossip subscriptions) follows the actor
//! pattern: a cheap-to-clone handle sends commands to a private actor. State that
//! only needs a lock (pins, replay cache, rate limiter, hash index) is a plain
//! internally synchronized struct injected where it is needed.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | `MeshNode`, wiring every component onto one endpoint |
//! | `identity` | Keypairs, peer ids, key persistence |
//! | `crypto` | Domain-separated signatures, transport certificates, TLS configs |
//! | `store` | Key-value storage seam for persisted state |
//! | `pins` | Certificate pins (TOFU) |
//! | `replay` | Per-peer nonce cache |
//! | `ratelimit` | Rate limiter, blocklist, admission |
//! | `descriptor` | Signed peer descriptors |
//! | `dht` | Routing table and DHT node |
//! | `bootstrap` | Descriptor republish loop |
//! | `frame` | Length-prefixed typed frames |
//! | `messages` | Wire types |
//! | `transport` | Pinned connections and the application handshake |
//! | `rpc` | Overlay client and server |
//! | `protocols` | Protocol trait seams |
//! | `search` | Mesh search responder |
//! | `sync` | Hash index and delta sync |
//! | `gossip` | Realm gossip |
//! | `config` | Node configuration |
//! | `error` | Error taxonomy |

mod bootstrap;
mod config;
mod crypto;
mod descriptor;
mod dht;
mod error;
mod frame;
mod gossip;
mod identity;
mod messages;
mod node;
mod pins;
mod protocols;
mod ratelimit;
mod replay;
mod rpc;
mod search;
mod store;
mod sync;
mod transport;

pub use config::{
    DEFAULT_REALM, GossipConfig, MeshConfig, NatClass, ReplayConfig, SearchConfig, SyncConfig,
};
pub use descriptor::{
    CAP_ALL, CAP_CHUNKS, CAP_DHT, CAP_GOSSIP, CAP_SEARCH, CAP_SYNC, DescriptorError, Endpoints, PeerAddr,
    PeerDescriptor,
};
pub use error::{MeshError, MeshResult, SecurityViolation};
pub use gossip::{GossipMessage, IncomingOutcome, MSG_TYPE_HEALTH, MSG_TYPE_INVALIDATION};
pub use identity::{IdentityManager, Keypair, PeerId};
pub use messages::{MeshSearchFile, MeshSearchResponse};
pub use node::{DiagnosticsSnapshot, MeshNode};
pub use pins::{CertificatePin, PinCheck, PinStore};
pub use protocols::{ChunkSource, LocalSearch};
pub use ratelimit::{Admission, BlockKey, Blocklist, Operation, RateLimitConfig};
pub use search::{LocalFile, MediaKind};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{MergeReport, MeshHashEntry, ProofPolicy, SyncStats, byte_hash_of};
pub use transport::ConnectionState;
