//! # Mesh Node
//!
//! [`MeshNode`] wires every component onto one QUIC endpoint and exposes the
//! operations a host application needs.
//!
//! ```ignore
//! let node = MeshNode::start(MeshConfig::default(), local_search, chunk_source).await?;
//! node.bootstrap(&[PeerAddr::new("203.0.113.7:50305", None)]).await?;
//!
//! node.publish_hash("song:1", &byte_hash, size, 0)?;
//! let report = node.sync_with(&peer).await?;
//! ```
//!
//! ## Component Integration
//!
//! | Component | Role |
//! |-----------|------|
//! | `OverlayClient` | outbound pinned connections, implements every outbound protocol trait |
//! | `OverlayServer` | accept loop, handshake, admission, dispatch |
//! | `DhtNode` | descriptor routing and lookup |
//! | `DescriptorPublisher` | republishes the self descriptor |
//! | `MeshSyncService` | hash index replication |
//! | `RealmGossip` | realm-scoped control messages |
//!
//! Background work (republish, replay cleanup, anti-entropy, accept loop) hangs
//! off one `CancellationToken` that [`MeshNode::shutdown`] fires.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use quinn::Endpoint;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::{DescriptorPublisher, DescriptorSlot, descriptor_slot};
use crate::config::{MeshConfig, NatClass};
use crate::crypto::{create_client_config, create_server_config};
use crate::descriptor::{CAP_ALL, CAP_GOSSIP, CAP_SYNC, Endpoints, PeerAddr, PeerDescriptor};
use crate::dht::DhtNode;
use crate::error::MeshError;
use crate::gossip::{GossipMessage, RealmGossip};
use crate::identity::{IdentityManager, PeerId};
use crate::messages::{MeshSearchRequest, MeshSearchResponse, new_nonce};
use crate::pins::PinStore;
use crate::protocols::{ChunkSource, LocalSearch};
use crate::ratelimit::Admission;
use crate::replay::ReplayCache;
use crate::rpc::{OverlayClient, OverlayServer, OverlayServices};
use crate::search::MeshSearchHandler;
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::sync::{HashIndex, MergeReport, MeshHashEntry, MeshSyncService, SyncStats};
use crate::transport::{ConnectionCounter, OverlayTransport};

const PIN_STORE_DIR: &str = "pins";

/// Read-only counters for external monitoring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub dht_nodes: usize,
    pub active_connections: usize,
    pub nat_class: NatClass,
    pub hash_entries: usize,
    pub sync_peers: usize,
}

pub struct MeshNode {
    identity: IdentityManager,
    config: MeshConfig,
    endpoint: Endpoint,
    advertised: SocketAddr,
    client: Arc<OverlayClient>,
    dht: DhtNode<OverlayClient>,
    sync: Arc<MeshSyncService<OverlayClient>>,
    gossip: RealmGossip<OverlayClient>,
    publisher: Arc<DescriptorPublisher<OverlayClient>>,
    descriptor: DescriptorSlot,
    pins: Arc<PinStore>,
    admission: Arc<Admission>,
    counter: ConnectionCounter,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Start a node with storage under `config.data_dir`, or in memory when unset.
    pub async fn start(
        config: MeshConfig,
        local_search: Arc<dyn LocalSearch>,
        chunks: Arc<dyn ChunkSource>,
    ) -> Result<Self, MeshError> {
        let store: Arc<dyn KeyValueStore> = match &config.data_dir {
            Some(dir) => Arc::new(
                FileStore::open(dir.join(PIN_STORE_DIR))
                    .map_err(|e| MeshError::fatal(format!("pin store unusable: {e:#}")))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        Self::start_with_store(config, store, local_search, chunks).await
    }

    pub async fn start_with_store(
        config: MeshConfig,
        store: Arc<dyn KeyValueStore>,
        local_search: Arc<dyn LocalSearch>,
        chunks: Arc<dyn ChunkSource>,
    ) -> Result<Self, MeshError> {
        config.validate()?;

        let identity = match &config.data_dir {
            Some(dir) => IdentityManager::load_or_generate(dir, config.key_exportable)?,
            None => IdentityManager::ephemeral(config.key_exportable),
        };
        let keypair = identity.keypair().clone();
        let peer_id = identity.peer_id();

        let certificate = identity.transport_certificate()?;
        let server_config =
            create_server_config(&certificate).map_err(|e| MeshError::fatal(format!("{e:#}")))?;
        let client_config =
            create_client_config(&certificate).map_err(|e| MeshError::fatal(format!("{e:#}")))?;

        let endpoint = Endpoint::server(server_config, config.bind)
            .map_err(|e| MeshError::fatal(format!("cannot bind {}: {e}", config.bind)))?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| MeshError::fatal(format!("no local address: {e}")))?;
        let advertised = advertised_addr(config.advertise_addr, local_addr);

        let cancel = CancellationToken::new();
        let descriptor = descriptor_slot();
        let counter = ConnectionCounter::new();
        let pins = Arc::new(PinStore::new(store));

        let transport = OverlayTransport::new(
            endpoint.clone(),
            client_config,
            keypair.clone(),
            descriptor.clone(),
            pins.clone(),
            counter.clone(),
            config.max_frame_len,
            config.request_timeout(),
        );
        let client = Arc::new(OverlayClient::new(transport));

        let dht = DhtNode::new(peer_id, client.clone(), config.dht_k, config.dht_alpha);
        let sync = Arc::new(MeshSyncService::new(
            peer_id,
            Arc::new(HashIndex::new()),
            client.clone(),
            config.sync.clone(),
        ));
        let gossip = RealmGossip::spawn(client.clone(), peer_id, &config.realm, &config.gossip);
        let replay = Arc::new(ReplayCache::new(config.replay.ttl(), config.replay.max_per_peer));
        let admission = Arc::new(Admission::new(config.rate_limits.clone()));

        let publisher = Arc::new(DescriptorPublisher::new(
            dht.clone(),
            keypair,
            Endpoints::same(advertised),
            CAP_ALL,
            config.descriptor_ttl(),
            config.republish_interval(),
            descriptor.clone(),
        ));
        // Handshakes present the descriptor from the first connection on.
        publisher.sign_descriptor();

        let server = OverlayServer::new(OverlayServices {
            local_id: peer_id,
            local_fingerprint: certificate.fingerprint(),
            descriptor: descriptor.clone(),
            dht: dht.clone(),
            sync: sync.clone(),
            gossip: gossip.clone(),
            search: Arc::new(MeshSearchHandler::new(local_search, config.search.clone())),
            chunks,
            replay: replay.clone(),
            admission: admission.clone(),
            counter: counter.clone(),
            max_frame_len: config.max_frame_len,
            cancel: cancel.clone(),
        });

        let tasks = vec![
            tokio::spawn(server.serve(endpoint.clone())),
            publisher.clone().spawn(cancel.clone()),
            replay.spawn_cleanup(config.replay.cleanup_interval(), cancel.clone()),
            spawn_anti_entropy(
                dht.clone(),
                gossip.clone(),
                sync.clone(),
                config.sync.interval(),
                cancel.clone(),
            ),
        ];

        info!(
            peer = %peer_id.short(),
            addr = %local_addr,
            advertised = %advertised,
            realm = %config.realm,
            "mesh node started"
        );

        Ok(Self {
            identity,
            config,
            endpoint,
            advertised,
            client,
            dht,
            sync,
            gossip,
            publisher,
            descriptor,
            pins,
            admission,
            counter,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &IdentityManager {
        &self.identity
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MeshError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// How other peers should dial this node.
    pub fn peer_addr(&self) -> PeerAddr {
        PeerAddr::new(self.advertised.to_string(), Some(self.peer_id()))
    }

    pub fn descriptor(&self) -> Option<PeerDescriptor> {
        self.descriptor.read().clone()
    }

    pub fn pins(&self) -> &Arc<PinStore> {
        &self.pins
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    pub fn dht(&self) -> &DhtNode<OverlayClient> {
        &self.dht
    }

    pub fn hash_index(&self) -> &Arc<HashIndex> {
        self.sync.index()
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Dial `addr`, pinning it on first contact, and learn its descriptor.
    pub async fn connect_peer(&self, addr: &PeerAddr) -> Result<PeerId, MeshError> {
        let connection = self.client.connect(addr).await?;
        match connection.remote_descriptor() {
            Some(descriptor) => {
                self.gossip.add_peer(PeerAddr::from(descriptor)).await;
                self.dht.observe_direct_peer(descriptor.clone()).await;
            }
            None => {
                self.gossip.add_peer(connection.peer_addr().clone()).await;
                self.dht.add_seed(connection.peer_addr().clone()).await;
            }
        }
        Ok(connection.peer_id())
    }

    /// Join the mesh through `seeds`, populate the routing table and publish our
    /// descriptor. Returns how many seeds answered.
    pub async fn bootstrap(&self, seeds: &[PeerAddr]) -> Result<usize, MeshError> {
        let mut reached = 0;
        for seed in seeds {
            match self.connect_peer(seed).await {
                Ok(peer) => {
                    debug!(peer = %peer.short(), seed = %seed, "bootstrap peer reached");
                    reached += 1;
                }
                Err(e) if e.is_security() => {
                    warn!(event = "security", seed = %seed, error = %e, "bootstrap peer rejected");
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "bootstrap peer unreachable");
                    self.dht.add_seed(seed.clone()).await;
                }
            }
        }

        if let Err(e) = self.dht.bootstrap().await {
            debug!(error = %e, "routing table bootstrap incomplete");
        }
        self.refresh_gossip_peers().await;
        if let Err(e) = self.publisher.publish_once().await {
            warn!(error = %e, "initial descriptor publish failed");
        }
        info!(seeds = seeds.len(), reached, dht_nodes = self.dht.node_count().await, "bootstrap finished");
        Ok(reached)
    }

    pub async fn lookup(&self, peer_id: &PeerId) -> Result<Option<PeerDescriptor>, MeshError> {
        self.dht
            .lookup(peer_id)
            .await
            .map_err(|e| MeshError::transient(format!("lookup failed: {e:#}")))
    }

    /// Sign and publish a fresh descriptor now, outside the republish schedule.
    pub async fn publish_descriptor(&self) -> Result<usize, MeshError> {
        self.publisher
            .publish_once()
            .await
            .map_err(|e| MeshError::transient(format!("publish failed: {e:#}")))
    }

    async fn refresh_gossip_peers(&self) {
        refresh_gossip_peers(&self.dht, &self.gossip).await;
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub fn publish_hash(
        &self,
        key: &str,
        byte_hash: &str,
        size: u64,
        meta_flags: u32,
    ) -> Result<MeshHashEntry, MeshError> {
        self.sync.publish_hash(key, byte_hash, size, meta_flags)
    }

    pub fn lookup_key(&self, key: &str) -> Option<MeshHashEntry> {
        self.sync.lookup_key(key)
    }

    pub async fn sync_with(&self, peer: &PeerAddr) -> Result<MergeReport, MeshError> {
        self.sync
            .sync_with(peer, &self.cancel)
            .await
            .map_err(|e| MeshError::transient(format!("sync with {peer} failed: {e:#}")))
    }

    /// One anti-entropy pass over every known peer, as the background loop does.
    pub async fn sync_round(&self) -> MergeReport {
        anti_entropy_round(&self.dht, &self.gossip, &self.sync, &self.cancel).await
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    // ========================================================================
    // Search
    // ========================================================================

    pub async fn search_peer(
        &self,
        peer: &PeerAddr,
        search_text: &str,
        max_results: u32,
    ) -> Result<MeshSearchResponse, MeshError> {
        let request = MeshSearchRequest {
            request_id: new_nonce(),
            search_text: search_text.to_string(),
            max_results,
        };
        self.client.search(peer, request).await
    }

    // ========================================================================
    // Gossip
    // ========================================================================

    pub async fn subscribe(
        &self,
        message_type: &str,
        handler: mpsc::Sender<GossipMessage>,
    ) -> Result<(), MeshError> {
        self.gossip.subscribe(message_type, handler).await
    }

    pub async fn subscribe_for_realm(
        &self,
        message_type: &str,
        realm: &str,
        handler: mpsc::Sender<GossipMessage>,
    ) -> Result<(), MeshError> {
        self.gossip.subscribe_for_realm(message_type, realm, handler).await
    }

    /// Publish into this node's realm. Returns how many peers it was sent to.
    pub async fn publish_gossip(&self, message_type: &str, payload: Vec<u8>) -> Result<usize, MeshError> {
        self.gossip.publish(self.gossip.message(message_type, payload)).await
    }

    pub async fn publish_gossip_for_realm(
        &self,
        message_type: &str,
        realm: &str,
        payload: Vec<u8>,
    ) -> Result<usize, MeshError> {
        self.gossip
            .publish_for_realm(self.gossip.message(message_type, payload), realm)
            .await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        let stats = self.sync.stats();
        DiagnosticsSnapshot {
            dht_nodes: self.dht.node_count().await,
            active_connections: self.counter.count(),
            nat_class: self.config.nat_class,
            hash_entries: stats.entries,
            sync_peers: stats.peers,
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.client.close_all();
        self.endpoint.close(0u32.into(), b"shutdown");

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.gossip.quit().await;
        self.dht.quit().await;
        info!(peer = %self.peer_id().short(), "mesh node stopped");
    }
}

async fn refresh_gossip_peers(dht: &DhtNode<OverlayClient>, gossip: &RealmGossip<OverlayClient>) {
    let peers: Vec<PeerAddr> = dht
        .known_peers()
        .await
        .iter()
        .filter(|d| d.has_capability(CAP_GOSSIP))
        .map(PeerAddr::from)
        .collect();
    gossip.set_peers(peers).await;
}

async fn anti_entropy_round(
    dht: &DhtNode<OverlayClient>,
    gossip: &RealmGossip<OverlayClient>,
    sync: &Arc<MeshSyncService<OverlayClient>>,
    cancel: &CancellationToken,
) -> MergeReport {
    refresh_gossip_peers(dht, gossip).await;

    let mut rounds = JoinSet::new();
    for descriptor in dht.known_peers().await {
        if !descriptor.has_capability(CAP_SYNC) {
            continue;
        }
        let sync = sync.clone();
        let cancel = cancel.clone();
        rounds.spawn(async move {
            let peer = PeerAddr::from(&descriptor);
            let result = sync.sync_with(&peer, &cancel).await;
            (peer, result)
        });
    }

    let mut total = MergeReport::default();
    while let Some(joined) = rounds.join_next().await {
        match joined {
            Ok((_, Ok(report))) => total.absorb(report),
            Ok((peer, Err(e))) => debug!(peer = %peer, error = %e, "anti-entropy sync failed"),
            Err(e) => debug!(error = %e, "anti-entropy task failed"),
        }
    }
    total
}

fn spawn_anti_entropy(
    dht: DhtNode<OverlayClient>,
    gossip: RealmGossip<OverlayClient>,
    sync: Arc<MeshSyncService<OverlayClient>>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = anti_entropy_round(&dht, &gossip, &sync, &cancel).await;
            if report.merged > 0 || report.rejected > 0 {
                info!(
                    merged = report.merged,
                    rejected = report.rejected,
                    conflicts = report.conflicts,
                    "anti-entropy round"
                );
            }
        }
        debug!("anti-entropy loop stopped");
    })
}

/// The overlay address to advertise for a socket bound at `local`.
///
/// A wildcard bind is resolved to the interface the OS would route public
/// traffic through; nothing is sent by the probe. Loopback is the fallback.
fn advertised_addr(configured: Option<SocketAddr>, local: SocketAddr) -> SocketAddr {
    if let Some(addr) = configured {
        return addr;
    }
    if !local.ip().is_unspecified() {
        return local;
    }

    let (bind, target, loopback) = if local.is_ipv4() {
        ("0.0.0.0:0", "8.8.8.8:53", IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        ("[::]:0", "[2001:4860:4860::8888]:53", IpAddr::V6(Ipv6Addr::LOCALHOST))
    };
    if let Ok(socket) = std::net::UdpSocket::bind(bind)
        && socket.connect(target).is_ok()
        && let Ok(probed) = socket.local_addr()
        && !probed.ip().is_unspecified()
    {
        return SocketAddr::new(probed.ip(), local.port());
    }
    SocketAddr::new(loopback, local.port())
}
