//! Protocol trait seams.
//!
//! Services depend on these traits, never on the QUIC client directly. The
//! overlay client in `rpc` implements the outbound ones; tests substitute
//! in-memory fakes.
//!
//! | Trait | Direction | Used by |
//! |-------|-----------|---------|
//! | [`DhtRpc`] | outbound | `dht` |
//! | [`SyncRpc`] | outbound | `sync` |
//! | [`ChunkFetcher`] | outbound | `sync` proof-of-possession |
//! | [`GossipTransport`] | outbound | `gossip` |
//! | [`ChunkSource`] | inbound, provided by the host | `rpc` chunk responder |
//! | [`LocalSearch`] | inbound, provided by the host | `search` |

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::descriptor::{PeerAddr, PeerDescriptor};
use crate::gossip::GossipMessage;
use crate::identity::PeerId;
use crate::messages::{Hello, PushDelta, ReqDelta};
use crate::search::LocalFile;
use crate::sync::MeshHashEntry;

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Descriptors the remote knows closest to `target`.
    async fn find_node(&self, to: &PeerAddr, target: PeerId) -> Result<Vec<PeerDescriptor>>;

    /// The descriptor for `peer_id` if the remote holds it, else closer nodes.
    async fn find_value(
        &self,
        to: &PeerAddr,
        peer_id: PeerId,
    ) -> Result<(Option<PeerDescriptor>, Vec<PeerDescriptor>)>;

    /// Ask the remote to hold `descriptor`. `Ok(false)` means it refused.
    async fn store(&self, to: &PeerAddr, descriptor: PeerDescriptor) -> Result<bool>;

    async fn ping(&self, to: &PeerAddr) -> Result<PeerId>;
}

#[async_trait]
pub trait SyncRpc: Send + Sync + 'static {
    async fn hello(&self, to: &PeerAddr, hello: Hello) -> Result<Hello>;

    async fn request_delta(&self, to: &PeerAddr, request: ReqDelta) -> Result<PushDelta>;

    async fn request_key(&self, to: &PeerAddr, key: &str) -> Result<Option<MeshHashEntry>>;
}

#[async_trait]
pub trait ChunkFetcher: Send + Sync + 'static {
    /// `Ok(None)` when the peer answers that it does not hold `key`.
    async fn request_chunk(
        &self,
        peer: &PeerAddr,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait ChunkSource: Send + Sync + 'static {
    async fn read_chunk(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait GossipTransport: Send + Sync + 'static {
    async fn send_gossip(&self, to: &PeerAddr, message: GossipMessage) -> Result<()>;
}

#[async_trait]
pub trait LocalSearch: Send + Sync + 'static {
    /// Stream matches into `results` as they are found. The receiver may stop
    /// listening at any time; a failed send means the caller gave up.
    async fn search_local(&self, query: &str, results: mpsc::Sender<LocalFile>) -> Result<()>;
}
