//! # Overlay RPC
//!
//! Both directions of request/response traffic over [`OverlayConnection`]s.
//!
//! ## Outbound
//!
//! [`OverlayClient`] keeps a bounded cache of ready connections keyed by peer
//! identifier and implements the outbound protocol traits (`DhtRpc`, `SyncRpc`,
//! `ChunkFetcher`, `GossipTransport`) on top of them. A connection that fails
//! with a transient error is evicted and redialed on next use.
//!
//! ## Inbound
//!
//! One task per connection, one task per stream. Each request passes admission
//! in this order before it reaches a service:
//!
//! | Step | Check | On failure |
//! |------|-------|------------|
//! | 1 | endpoint blocklist (before TLS) | connection refused |
//! | 2 | peer blocklist | error reply |
//! | 3 | replay cache on the envelope nonce | error reply |
//! | 4 | per-operation rate limit | error reply (search gets a rejected response) |
//!
//! Rejected requests never reach a service and never count against a quota.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use quinn::Incoming;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bootstrap::DescriptorSlot;
use crate::descriptor::{PeerAddr, PeerDescriptor};
use crate::dht::DhtNode;
use crate::error::{MeshError, SecurityViolation};
use crate::frame::{read_message, write_message};
use crate::gossip::{GossipMessage, RealmGossip};
use crate::identity::PeerId;
use crate::messages::{
    ChunkRequest, ChunkResponse, DhtRequest, DhtResponse, Envelope, Hello, KeyResult, MAX_NODES_PER_REPLY,
    MeshSearchRequest, MeshSearchResponse, OverlayMessage, PushDelta, ReqDelta, ReqKey,
};
use crate::protocols::{ChunkFetcher, ChunkSource, DhtRpc, GossipTransport, SyncRpc};
use crate::ratelimit::{Admission, Operation};
use crate::replay::ReplayCache;
use crate::search::MeshSearchHandler;
use crate::sync::{MeshHashEntry, MeshSyncService, PROOF_CHUNK_LEN};
use crate::transport::{ConnectionCounter, OverlayConnection, OverlayTransport, accept_handshake};

/// Maximum cached outbound connections before LRU eviction.
const MAX_CACHED_CONNECTIONS: usize = 1_000;

/// A cached connection idle this long is redialed instead of reused.
const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(120);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the overlay needs from its transport, in one bound.
pub trait OverlayRpc: DhtRpc + SyncRpc + ChunkFetcher + GossipTransport {}

impl<T: DhtRpc + SyncRpc + ChunkFetcher + GossipTransport> OverlayRpc for T {}

// ============================================================================
// Outbound client
// ============================================================================

struct CachedConnection {
    connection: Arc<OverlayConnection>,
    last_used: tokio::time::Instant,
}

impl CachedConnection {
    fn new(connection: Arc<OverlayConnection>) -> Self {
        Self {
            connection,
            last_used: tokio::time::Instant::now(),
        }
    }

    fn is_reusable(&self) -> bool {
        self.connection.is_usable() && self.last_used.elapsed() < CONNECTION_STALE_TIMEOUT
    }
}

pub struct OverlayClient {
    transport: OverlayTransport,
    connections: Mutex<LruCache<String, CachedConnection>>,
}

impl OverlayClient {
    pub fn new(transport: OverlayTransport) -> Self {
        Self {
            transport,
            connections: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn transport(&self) -> &OverlayTransport {
        &self.transport
    }

    /// A ready connection to `peer`, reusing a cached one when it is still usable.
    pub async fn connect(&self, peer: &PeerAddr) -> Result<Arc<OverlayConnection>, MeshError> {
        let key = peer.identifier();
        {
            let mut cache = self.connections.lock();
            if let Some(cached) = cache.get_mut(&key) {
                if cached.is_reusable() {
                    cached.last_used = tokio::time::Instant::now();
                    return Ok(cached.connection.clone());
                }
                cached.connection.close();
                cache.pop(&key);
            }
        }

        let connection = Arc::new(self.transport.connect(peer).await?);
        let mut cache = self.connections.lock();
        let authenticated_key = connection.peer_addr().identifier();
        if authenticated_key != key {
            cache.put(authenticated_key, CachedConnection::new(connection.clone()));
        }
        cache.put(key, CachedConnection::new(connection.clone()));
        Ok(connection)
    }

    fn invalidate(&self, peer: &PeerAddr) {
        if let Some(cached) = self.connections.lock().pop(&peer.identifier()) {
            cached.connection.close();
        }
    }

    /// One request on a cached or fresh connection. Transient failures evict the
    /// connection so the next call redials.
    pub async fn request(&self, peer: &PeerAddr, body: OverlayMessage) -> Result<OverlayMessage, MeshError> {
        let connection = self.connect(peer).await?;
        let result = connection.request(body).await;
        if let Err(e) = &result
            && e.is_retryable()
        {
            debug!(peer = %peer, error = %e, "dropping failed connection");
            self.invalidate(peer);
        }
        result
    }

    pub async fn search(
        &self,
        peer: &PeerAddr,
        request: MeshSearchRequest,
    ) -> Result<MeshSearchResponse, MeshError> {
        match self.request(peer, OverlayMessage::MeshSearchRequest(request)).await? {
            OverlayMessage::MeshSearchResponse(response) => Ok(response),
            other => Err(unexpected_reply("search-response", &other)),
        }
    }

    pub fn cached_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn close_all(&self) {
        let mut cache = self.connections.lock();
        for (_, cached) in cache.iter() {
            cached.connection.close();
        }
        cache.clear();
    }

    async fn dht(&self, to: &PeerAddr, request: DhtRequest) -> Result<DhtResponse> {
        match self.request(to, OverlayMessage::Dht(request)).await? {
            OverlayMessage::DhtResponse(response) => Ok(response),
            other => Err(unexpected_reply("dht-response", &other).into()),
        }
    }
}

fn unexpected_reply(expected: &str, got: &OverlayMessage) -> MeshError {
    MeshError::protocol(format!("expected {expected}, got {}", got.kind()))
}

#[async_trait]
impl DhtRpc for OverlayClient {
    async fn find_node(&self, to: &PeerAddr, target: PeerId) -> Result<Vec<PeerDescriptor>> {
        match self.dht(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(mut nodes) => {
                nodes.truncate(MAX_NODES_PER_REPLY);
                Ok(nodes)
            }
            other => Err(anyhow!("unexpected find_node response: {other:?}")),
        }
    }

    async fn find_value(
        &self,
        to: &PeerAddr,
        peer_id: PeerId,
    ) -> Result<(Option<PeerDescriptor>, Vec<PeerDescriptor>)> {
        match self.dht(to, DhtRequest::FindValue { peer_id }).await? {
            DhtResponse::Value { descriptor, mut closer } => {
                closer.truncate(MAX_NODES_PER_REPLY);
                Ok((descriptor, closer))
            }
            other => Err(anyhow!("unexpected find_value response: {other:?}")),
        }
    }

    async fn store(&self, to: &PeerAddr, descriptor: PeerDescriptor) -> Result<bool> {
        match self.dht(to, DhtRequest::Store { descriptor }).await? {
            DhtResponse::Stored { accepted } => Ok(accepted),
            other => Err(anyhow!("unexpected store response: {other:?}")),
        }
    }

    async fn ping(&self, to: &PeerAddr) -> Result<PeerId> {
        match self.dht(to, DhtRequest::Ping).await? {
            DhtResponse::Pong { peer_id } => Ok(peer_id),
            other => Err(anyhow!("unexpected ping response: {other:?}")),
        }
    }
}

#[async_trait]
impl SyncRpc for OverlayClient {
    async fn hello(&self, to: &PeerAddr, hello: Hello) -> Result<Hello> {
        let authenticated = self.connect(to).await?.peer_id();
        match self.request(to, OverlayMessage::Hello(hello)).await? {
            OverlayMessage::Hello(reply) if reply.peer_id == authenticated => Ok(reply),
            OverlayMessage::Hello(_) => {
                warn!(event = "security", peer = %to, "hello identity differs from connection");
                Err(MeshError::from(SecurityViolation::IdentityMismatch).into())
            }
            other => Err(unexpected_reply("hello", &other).into()),
        }
    }

    async fn request_delta(&self, to: &PeerAddr, request: ReqDelta) -> Result<PushDelta> {
        match self.request(to, OverlayMessage::ReqDelta(request)).await? {
            OverlayMessage::PushDelta(delta) => Ok(delta),
            other => Err(unexpected_reply("push-delta", &other).into()),
        }
    }

    async fn request_key(&self, to: &PeerAddr, key: &str) -> Result<Option<MeshHashEntry>> {
        let request = OverlayMessage::ReqKey(ReqKey { key: key.to_string() });
        match self.request(to, request).await? {
            OverlayMessage::KeyResult(result) => Ok(result.entry),
            other => Err(unexpected_reply("key-result", &other).into()),
        }
    }
}

#[async_trait]
impl ChunkFetcher for OverlayClient {
    async fn request_chunk(
        &self,
        peer: &PeerAddr,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<Vec<u8>>> {
        let request = OverlayMessage::ChunkRequest(ChunkRequest {
            key: key.to_string(),
            offset,
            length,
        });
        match self.request(peer, request).await? {
            OverlayMessage::ChunkResponse(response) => Ok(response.data),
            other => Err(unexpected_reply("chunk-response", &other).into()),
        }
    }
}

#[async_trait]
impl GossipTransport for OverlayClient {
    async fn send_gossip(&self, to: &PeerAddr, message: GossipMessage) -> Result<()> {
        match self.request(to, OverlayMessage::Gossip(message)).await? {
            OverlayMessage::GossipAck => Ok(()),
            other => Err(unexpected_reply("gossip-ack", &other).into()),
        }
    }
}

// ============================================================================
// Inbound server
// ============================================================================

/// Services and guards an inbound request may touch.
pub struct OverlayServices<N: OverlayRpc> {
    pub local_id: PeerId,
    pub local_fingerprint: String,
    pub descriptor: DescriptorSlot,
    pub dht: DhtNode<N>,
    pub sync: Arc<MeshSyncService<N>>,
    pub gossip: RealmGossip<N>,
    pub search: Arc<MeshSearchHandler>,
    pub chunks: Arc<dyn ChunkSource>,
    pub replay: Arc<ReplayCache>,
    pub admission: Arc<Admission>,
    pub counter: ConnectionCounter,
    pub max_frame_len: usize,
    pub cancel: CancellationToken,
}

pub struct OverlayServer<N: OverlayRpc> {
    inner: Arc<OverlayServices<N>>,
}

impl<N: OverlayRpc> Clone for OverlayServer<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn operation_for(body: &OverlayMessage) -> Option<Operation> {
    match body {
        OverlayMessage::Dht(_) => Some(Operation::DhtRequest),
        OverlayMessage::Hello(_) | OverlayMessage::ReqDelta(_) | OverlayMessage::ReqKey(_) => {
            Some(Operation::SyncRequest)
        }
        OverlayMessage::ChunkRequest(_) => Some(Operation::ChunkRequest),
        OverlayMessage::MeshSearchRequest(_) => Some(Operation::MeshSearch),
        OverlayMessage::Gossip(_) => Some(Operation::Gossip),
        _ => None,
    }
}

fn rejection(body: &OverlayMessage, violation: &SecurityViolation) -> OverlayMessage {
    let reason = match violation {
        SecurityViolation::RateLimited { reason } => reason.clone(),
        other => other.to_string(),
    };
    match body {
        OverlayMessage::MeshSearchRequest(request) => {
            OverlayMessage::MeshSearchResponse(MeshSearchResponse::rejected(&request.request_id, reason))
        }
        _ => OverlayMessage::error(reason),
    }
}

impl<N: OverlayRpc> OverlayServer<N> {
    pub fn new(services: OverlayServices<N>) -> Self {
        Self {
            inner: Arc::new(services),
        }
    }

    pub fn services(&self) -> &OverlayServices<N> {
        &self.inner
    }

    fn admit(&self, peer: &PeerId, nonce: &str, op: Operation) -> Result<(), SecurityViolation> {
        let services = &self.inner;
        services.admission.admit_peer(peer)?;
        if services.replay.is_replay(&peer.to_hex(), nonce) {
            warn!(event = "security", peer = %peer.short(), op = %op, "replayed request nonce");
            return Err(SecurityViolation::Replay { peer: peer.to_hex() });
        }
        services.admission.admit(peer, op)
    }

    /// Admission plus dispatch for one request from an authenticated peer.
    pub async fn handle_request(&self, peer: PeerId, envelope: Envelope) -> Envelope {
        let Envelope { nonce, body } = envelope;
        let Some(op) = operation_for(&body) else {
            debug!(peer = %peer.short(), kind = body.kind(), "unexpected inbound message");
            return Envelope::reply_to(&nonce, OverlayMessage::error(format!("unexpected {}", body.kind())));
        };

        let reply = match self.admit(&peer, &nonce, op) {
            Ok(()) => tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, self.dispatch(peer, body))
                .await
                .unwrap_or_else(|_| {
                    warn!(peer = %peer.short(), op = %op, "request processing timed out");
                    OverlayMessage::error("request timed out")
                }),
            Err(violation) => rejection(&body, &violation),
        };
        Envelope::reply_to(&nonce, reply)
    }

    async fn dispatch(&self, peer: PeerId, body: OverlayMessage) -> OverlayMessage {
        let services = &self.inner;
        match body {
            OverlayMessage::Dht(request) => OverlayMessage::DhtResponse(self.handle_dht(request).await),
            OverlayMessage::Hello(hello) => {
                if hello.peer_id != peer {
                    return OverlayMessage::error(SecurityViolation::IdentityMismatch.to_string());
                }
                OverlayMessage::Hello(services.sync.handle_hello(&hello))
            }
            OverlayMessage::ReqDelta(request) => OverlayMessage::PushDelta(services.sync.handle_req_delta(&request)),
            OverlayMessage::ReqKey(request) => OverlayMessage::KeyResult(KeyResult {
                entry: services.sync.lookup_key(&request.key),
            }),
            OverlayMessage::ChunkRequest(request) => {
                let length = request.length.min(PROOF_CHUNK_LEN);
                let data = match services.chunks.read_chunk(&request.key, request.offset, length).await {
                    Ok(data) => data.map(|mut bytes| {
                        bytes.truncate(length as usize);
                        bytes
                    }),
                    Err(e) => {
                        debug!(key = %request.key, error = %e, "chunk source failed");
                        None
                    }
                };
                OverlayMessage::ChunkResponse(ChunkResponse { data })
            }
            OverlayMessage::MeshSearchRequest(request) => {
                OverlayMessage::MeshSearchResponse(services.search.handle(request, &services.cancel).await)
            }
            OverlayMessage::Gossip(message) => {
                let outcome = services.gossip.handle_incoming(message, Some(peer)).await;
                trace!(peer = %peer.short(), ?outcome, "gossip received");
                OverlayMessage::GossipAck
            }
            other => OverlayMessage::error(format!("unexpected {}", other.kind())),
        }
    }

    async fn handle_dht(&self, request: DhtRequest) -> DhtResponse {
        let dht = &self.inner.dht;
        match request {
            DhtRequest::Ping => DhtResponse::Pong {
                peer_id: self.inner.local_id,
            },
            DhtRequest::FindNode { target } => {
                let mut nodes = dht.handle_find_node(target).await;
                nodes.truncate(MAX_NODES_PER_REPLY);
                DhtResponse::Nodes(nodes)
            }
            DhtRequest::FindValue { peer_id } => {
                let (descriptor, mut closer) = dht.handle_find_value(peer_id).await;
                closer.truncate(MAX_NODES_PER_REPLY);
                DhtResponse::Value { descriptor, closer }
            }
            DhtRequest::Store { descriptor } => DhtResponse::Stored {
                accepted: dht.handle_store(descriptor).await,
            },
        }
    }

    /// Run the accept loop until cancelled.
    pub async fn serve(self, endpoint: quinn::Endpoint) {
        let cancel = self.inner.cancel.clone();
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(incoming).await {
                    debug!(error = %e, "inbound connection ended");
                }
            });
        }
        debug!("accept loop stopped");
    }

    pub async fn handle_connection(self, incoming: Incoming) -> Result<()> {
        let services = &self.inner;
        let remote: SocketAddr = incoming.remote_address();
        if let Err(violation) = services.admission.admit_endpoint(remote.ip()) {
            incoming.refuse();
            return Err(violation.into());
        }

        let connection = incoming.await.context("failed to accept connection")?;
        let local_descriptor = services.descriptor.read().clone();
        let accepted = accept_handshake(
            &connection,
            services.local_id,
            &services.local_fingerprint,
            local_descriptor,
            services.max_frame_len,
        )
        .await?;
        let peer = accepted.remote.peer_id;

        if let Err(violation) = services.admission.admit_peer(&peer) {
            connection.close(3u32.into(), b"blocklisted");
            return Err(violation.into());
        }
        let _guard = services.counter.guard();

        if let Some(descriptor) = accepted.descriptor {
            services.gossip.add_peer(PeerAddr::from(&descriptor)).await;
            services.dht.observe_direct_peer(descriptor).await;
        }
        info!(peer = %peer.short(), addr = %remote, "inbound overlay connection");

        loop {
            let stream = tokio::select! {
                _ = services.cancel.cancelled() => {
                    connection.close(0u32.into(), b"shutting down");
                    break Ok(());
                }
                stream = connection.accept_bi() => stream,
            };
            let stream = match stream {
                Ok(s) => s,
                Err(quinn::ConnectionError::ApplicationClosed(_)) | Err(quinn::ConnectionError::LocallyClosed) => {
                    debug!(remote = %remote, "connection closed");
                    break Ok(());
                }
                Err(quinn::ConnectionError::TimedOut) => {
                    debug!(remote = %remote, "connection idle timeout");
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_stream(peer, stream).await {
                    debug!(error = ?e, "stream error");
                }
            });
        }
    }

    async fn handle_stream(
        &self,
        peer: PeerId,
        (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    ) -> Result<()> {
        let envelope = tokio::time::timeout(
            REQUEST_READ_TIMEOUT,
            read_message::<_, Envelope>(&mut recv, self.inner.max_frame_len),
        )
        .await
        .map_err(|_| anyhow!("request read timed out"))?;
        let Some(envelope) = envelope else {
            debug!(peer = %peer.short(), "dropping stream with unreadable request");
            return Ok(());
        };

        let reply = self.handle_request(peer, envelope).await;
        write_message(&mut send, &reply).await?;
        send.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::config::{GossipConfig, SearchConfig, SyncConfig};
    use crate::identity::Keypair;
    use crate::messages::new_nonce;
    use crate::protocols::LocalSearch;
    use crate::ratelimit::{BlockKey, RateLimitConfig};
    use crate::search::LocalFile;
    use crate::sync::HashIndex;
    use tokio::sync::mpsc;

    struct Unreachable;

    #[async_trait]
    impl DhtRpc for Unreachable {
        async fn find_node(&self, _to: &PeerAddr, _target: PeerId) -> Result<Vec<PeerDescriptor>> {
            Err(anyhow!("offline"))
        }
        async fn find_value(
            &self,
            _to: &PeerAddr,
            _peer_id: PeerId,
        ) -> Result<(Option<PeerDescriptor>, Vec<PeerDescriptor>)> {
            Err(anyhow!("offline"))
        }
        async fn store(&self, _to: &PeerAddr, _descriptor: PeerDescriptor) -> Result<bool> {
            Err(anyhow!("offline"))
        }
        async fn ping(&self, _to: &PeerAddr) -> Result<PeerId> {
            Err(anyhow!("offline"))
        }
    }

    #[async_trait]
    impl SyncRpc for Unreachable {
        async fn hello(&self, _to: &PeerAddr, _hello: Hello) -> Result<Hello> {
            Err(anyhow!("offline"))
        }
        async fn request_delta(&self, _to: &PeerAddr, _request: ReqDelta) -> Result<PushDelta> {
            Err(anyhow!("offline"))
        }
        async fn request_key(&self, _to: &PeerAddr, _key: &str) -> Result<Option<MeshHashEntry>> {
            Err(anyhow!("offline"))
        }
    }

    #[async_trait]
    impl ChunkFetcher for Unreachable {
        async fn request_chunk(&self, _peer: &PeerAddr, _key: &str, _offset: u64, _length: u64) -> Result<Option<Vec<u8>>> {
            Err(anyhow!("offline"))
        }
    }

    #[async_trait]
    impl GossipTransport for Unreachable {
        async fn send_gossip(&self, _to: &PeerAddr, _message: GossipMessage) -> Result<()> {
            Err(anyhow!("offline"))
        }
    }

    struct NoFiles;

    #[async_trait]
    impl LocalSearch for NoFiles {
        async fn search_local(&self, _query: &str, _results: mpsc::Sender<LocalFile>) -> Result<()> {
            Ok(())
        }
    }

    /// Serves zeros and remembers the largest length asked of it.
    #[derive(Default)]
    struct ZeroChunks {
        largest_request: AtomicU64,
    }

    #[async_trait]
    impl ChunkSource for ZeroChunks {
        async fn read_chunk(&self, key: &str, _offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
            self.largest_request.fetch_max(length, Ordering::SeqCst);
            Ok((key == "song:1").then(|| vec![0u8; length as usize]))
        }
    }

    struct Fixture {
        server: OverlayServer<Unreachable>,
        chunks: Arc<ZeroChunks>,
        local_id: PeerId,
    }

    fn fixture(limits: RateLimitConfig) -> Fixture {
        let keypair = Keypair::generate();
        let local_id = keypair.peer_id();
        let network = Arc::new(Unreachable);
        let chunks = Arc::new(ZeroChunks::default());
        let sync = Arc::new(MeshSyncService::new(
            local_id,
            Arc::new(HashIndex::new()),
            network.clone(),
            SyncConfig::default(),
        ));
        let server = OverlayServer::new(OverlayServices {
            local_id,
            local_fingerprint: "fp".into(),
            descriptor: crate::bootstrap::descriptor_slot(),
            dht: DhtNode::new(local_id, network.clone(), 20, 3),
            sync,
            gossip: RealmGossip::spawn(network, local_id, "home", &GossipConfig::default()),
            search: Arc::new(MeshSearchHandler::new(Arc::new(NoFiles), SearchConfig::default())),
            chunks: chunks.clone(),
            replay: Arc::new(ReplayCache::new(Duration::from_secs(600), 128)),
            admission: Arc::new(Admission::new(limits)),
            counter: ConnectionCounter::new(),
            max_frame_len: crate::frame::DEFAULT_MAX_FRAME_LEN,
            cancel: CancellationToken::new(),
        });
        Fixture {
            server,
            chunks,
            local_id,
        }
    }

    fn search(text: &str) -> OverlayMessage {
        OverlayMessage::MeshSearchRequest(MeshSearchRequest {
            request_id: "r".into(),
            search_text: text.into(),
            max_results: 10,
        })
    }

    #[tokio::test]
    async fn ping_answers_with_local_id_and_echoes_nonce() {
        let f = fixture(RateLimitConfig::default());
        let peer = Keypair::generate().peer_id();
        let request = Envelope::new(OverlayMessage::Dht(DhtRequest::Ping));
        let nonce = request.nonce.clone();

        let reply = f.server.handle_request(peer, request).await;
        assert_eq!(reply.nonce, nonce);
        assert_eq!(
            reply.body,
            OverlayMessage::DhtResponse(DhtResponse::Pong { peer_id: f.local_id })
        );
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let f = fixture(RateLimitConfig::default());
        let peer = Keypair::generate().peer_id();
        let nonce = new_nonce();

        let first = f
            .server
            .handle_request(peer, Envelope::reply_to(&nonce, OverlayMessage::Dht(DhtRequest::Ping)))
            .await;
        assert!(matches!(first.body, OverlayMessage::DhtResponse(_)));

        let second = f
            .server
            .handle_request(peer, Envelope::reply_to(&nonce, OverlayMessage::Dht(DhtRequest::Ping)))
            .await;
        assert!(matches!(second.body, OverlayMessage::Error(e) if e.message.contains("nonce already seen")));

        // Same nonce from a different peer is fine.
        let other = Keypair::generate().peer_id();
        let third = f
            .server
            .handle_request(other, Envelope::reply_to(&nonce, OverlayMessage::Dht(DhtRequest::Ping)))
            .await;
        assert!(matches!(third.body, OverlayMessage::DhtResponse(_)));
    }

    #[tokio::test]
    async fn search_over_quota_gets_rejected_response() {
        let f = fixture(RateLimitConfig {
            mesh_search_per_minute: 2,
            ..RateLimitConfig::default()
        });
        let peer = Keypair::generate().peer_id();

        for _ in 0..2 {
            let reply = f.server.handle_request(peer, Envelope::new(search("song"))).await;
            let OverlayMessage::MeshSearchResponse(response) = reply.body else {
                panic!("expected search response");
            };
            assert_eq!(response.error, None);
        }

        let reply = f.server.handle_request(peer, Envelope::new(search("song"))).await;
        let OverlayMessage::MeshSearchResponse(response) = reply.body else {
            panic!("expected search response");
        };
        assert_eq!(response.request_id, "r");
        assert!(response.error.is_some());

        // Other operations keep their own quota.
        let reply = f
            .server
            .handle_request(peer, Envelope::new(OverlayMessage::Dht(DhtRequest::Ping)))
            .await;
        assert!(matches!(reply.body, OverlayMessage::DhtResponse(_)));
    }

    #[tokio::test]
    async fn blocklist_runs_before_replay_tracking() {
        let f = fixture(RateLimitConfig::default());
        let peer = Keypair::generate().peer_id();
        let admission = &f.server.services().admission;
        admission.blocklist().block(BlockKey::Peer(peer), "abuse", None);

        let nonce = new_nonce();
        let reply = f
            .server
            .handle_request(peer, Envelope::reply_to(&nonce, OverlayMessage::Dht(DhtRequest::Ping)))
            .await;
        assert!(matches!(reply.body, OverlayMessage::Error(e) if e.message.contains("blocklisted")));

        // The rejected request never recorded its nonce.
        admission.blocklist().unblock(&BlockKey::Peer(peer));
        let reply = f
            .server
            .handle_request(peer, Envelope::reply_to(&nonce, OverlayMessage::Dht(DhtRequest::Ping)))
            .await;
        assert!(matches!(reply.body, OverlayMessage::DhtResponse(_)));
    }

    #[tokio::test]
    async fn delta_and_key_requests_served_from_index() {
        let f = fixture(RateLimitConfig::default());
        let hash = "ab".repeat(32);
        f.server.services().sync.publish_hash("song:1", &hash, 4096, 0).unwrap();
        let peer = Keypair::generate().peer_id();

        let reply = f
            .server
            .handle_request(
                peer,
                Envelope::new(OverlayMessage::ReqDelta(ReqDelta {
                    since_seq: 0,
                    max_entries: 10,
                })),
            )
            .await;
        let OverlayMessage::PushDelta(delta) = reply.body else {
            panic!("expected push-delta");
        };
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(delta.latest_sequence, 1);

        let reply = f
            .server
            .handle_request(peer, Envelope::new(OverlayMessage::ReqKey(ReqKey { key: "song:1".into() })))
            .await;
        assert!(matches!(reply.body, OverlayMessage::KeyResult(KeyResult { entry: Some(e) }) if e.byte_hash == hash));
    }

    #[tokio::test]
    async fn chunk_length_is_capped() {
        let f = fixture(RateLimitConfig::default());
        let peer = Keypair::generate().peer_id();

        let reply = f
            .server
            .handle_request(
                peer,
                Envelope::new(OverlayMessage::ChunkRequest(ChunkRequest {
                    key: "song:1".into(),
                    offset: 0,
                    length: 10 * 1024 * 1024,
                })),
            )
            .await;
        let OverlayMessage::ChunkResponse(ChunkResponse { data: Some(data) }) = reply.body else {
            panic!("expected chunk data");
        };
        assert_eq!(data.len() as u64, PROOF_CHUNK_LEN);
        assert_eq!(f.chunks.largest_request.load(Ordering::SeqCst), PROOF_CHUNK_LEN);

        let reply = f
            .server
            .handle_request(
                peer,
                Envelope::new(OverlayMessage::ChunkRequest(ChunkRequest {
                    key: "missing".into(),
                    offset: 0,
                    length: 16,
                })),
            )
            .await;
        assert_eq!(reply.body, OverlayMessage::ChunkResponse(ChunkResponse { data: None }));
    }

    #[tokio::test]
    async fn hello_must_come_from_its_sender() {
        let f = fixture(RateLimitConfig::default());
        let peer = Keypair::generate().peer_id();
        let impostor = Keypair::generate().peer_id();

        let reply = f
            .server
            .handle_request(
                peer,
                Envelope::new(OverlayMessage::Hello(Hello {
                    peer_id: impostor,
                    latest_sequence: 3,
                })),
            )
            .await;
        assert!(matches!(reply.body, OverlayMessage::Error(_)));

        let reply = f
            .server
            .handle_request(
                peer,
                Envelope::new(OverlayMessage::Hello(Hello {
                    peer_id: peer,
                    latest_sequence: 3,
                })),
            )
            .await;
        assert!(matches!(reply.body, OverlayMessage::Hello(h) if h.peer_id == f.local_id));
    }

    #[tokio::test]
    async fn replies_are_not_accepted_as_requests() {
        let f = fixture(RateLimitConfig::default());
        let peer = Keypair::generate().peer_id();
        let reply = f
            .server
            .handle_request(
                peer,
                Envelope::new(OverlayMessage::PushDelta(PushDelta {
                    entries: Vec::new(),
                    latest_sequence: 0,
                })),
            )
            .await;
        assert!(matches!(reply.body, OverlayMessage::Error(e) if e.message.contains("push-delta")));
    }
}
