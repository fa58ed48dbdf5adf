//! # Kademlia-style Peer Directory
//!
//! Maps `PeerId -> PeerDescriptor`. Two structures live inside the actor:
//!
//! - **Routing table**: 256 buckets indexed by the XOR-distance prefix from the
//!   local peer id. Each bucket holds at most `k` entries ordered by last-seen;
//!   inserting into a full bucket evicts the least-recently-seen entry.
//! - **Descriptor store**: descriptors other peers asked us to hold (`Store`),
//!   bounded LRU, newest `issued_at` wins.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `lookup(peer_id)` | Local hit, else iterative `FindValue` toward the target |
//! | `iterative_find_node(target)` | α-parallel Kademlia walk |
//! | `publish(descriptor)` | Store locally and at the k closest peers |
//! | `bootstrap()` | Walk toward our own id, starting from the seeds |
//! | `node_count()` | Routing table size, for diagnostics |
//!
//! Every descriptor entering either structure is verified (peer id binding,
//! signature, expiry). Expired descriptors are never returned.
//!
//! Unreachable peers are skipped: a lookup returns whatever the reachable part of
//! the network produced rather than failing.

use std::collections::{BinaryHeap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::descriptor::{PeerAddr, PeerDescriptor};
use crate::identity::{PeerId, distance_cmp, now_ms};
use crate::protocols::DhtRpc;

/// Interval between bucket refresh passes.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A bucket untouched for this long gets a random-target lookup.
const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Descriptors one peer may push into our routing table per window.
const ROUTING_INSERTION_PER_PEER_LIMIT: usize = 50;

const ROUTING_INSERTION_RATE_WINDOW: Duration = Duration::from_secs(60);

const MAX_ROUTING_INSERTION_TRACKED_PEERS: usize = 1_000;

/// Descriptors held on behalf of other peers.
const DESCRIPTOR_STORE_CAPACITY: usize = 10_000;

const MAX_LOOKUP_ITERATIONS: usize = 20;

const PER_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

const LOOKUP_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_K: usize = 20;

pub const DEFAULT_ALPHA: usize = 3;

// ============================================================================
// Routing Insertion Limiter
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RoutingInsertionBucket {
    tokens: f64,
    last_update: Instant,
}

impl RoutingInsertionBucket {
    fn new() -> Self {
        Self {
            tokens: ROUTING_INSERTION_PER_PEER_LIMIT as f64,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let window_secs = ROUTING_INSERTION_RATE_WINDOW.as_secs_f64();

        let rate = ROUTING_INSERTION_PER_PEER_LIMIT as f64 / window_secs;
        self.tokens = (self.tokens + elapsed * rate).min(ROUTING_INSERTION_PER_PEER_LIMIT as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Bounds how fast any single responder can fill our routing table with
/// third-party descriptors (eclipse resistance).
struct RoutingInsertionLimiter {
    buckets: LruCache<String, RoutingInsertionBucket>,
}

impl RoutingInsertionLimiter {
    fn new() -> Self {
        Self {
            buckets: LruCache::new(
                NonZeroUsize::new(MAX_ROUTING_INSERTION_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    fn allow_insertion(&mut self, from_peer: &str) -> bool {
        let bucket = self
            .buckets
            .get_or_insert_mut(from_peer.to_string(), RoutingInsertionBucket::new);
        bucket.try_consume()
    }
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Debug, Clone)]
pub struct RoutingTableEntry {
    pub descriptor: PeerDescriptor,
    pub last_seen: Instant,
}

/// Entries ordered least-recently-seen first.
#[derive(Debug, Clone)]
struct RoutingBucket {
    entries: Vec<RoutingTableEntry>,
    last_refresh: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Evicted(Box<PeerDescriptor>),
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn touch(&mut self, descriptor: PeerDescriptor, k: usize) -> BucketTouchOutcome {
        let now = Instant::now();
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.descriptor.peer_id == descriptor.peer_id)
        {
            let mut existing = self.entries.remove(pos);
            if descriptor.supersedes(&existing.descriptor) {
                existing.descriptor = descriptor;
            }
            existing.last_seen = now;
            self.entries.push(existing);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        let entry = RoutingTableEntry {
            descriptor,
            last_seen: now,
        };
        self.mark_refreshed();
        if self.entries.len() < k {
            self.entries.push(entry);
            return BucketTouchOutcome::Inserted;
        }

        // Full: the front entry is the least recently seen.
        let evicted = self.entries.remove(0);
        self.entries.push(entry);
        BucketTouchOutcome::Evicted(Box::new(evicted.descriptor))
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.descriptor.peer_id == id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return byte_idx * 8 + leading;
        }
    }
    255
}

/// A random id that falls into `bucket_idx` relative to `self_id`.
fn random_id_for_bucket(self_id: &PeerId, bucket_idx: usize) -> PeerId {
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }

    PeerId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(256);
        for _ in 0..256 {
            buckets.push(RoutingBucket::new());
        }
        Self {
            self_id,
            k: k.max(1),
            buckets,
        }
    }

    /// Insert or refresh. Returns `None` for our own id.
    pub fn update(&mut self, descriptor: PeerDescriptor) -> Option<BucketTouchOutcome> {
        if descriptor.peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &descriptor.peer_id);
        Some(self.buckets[idx].touch(descriptor, self.k))
    }

    /// Up to `k` unexpired descriptors, closest to `target` first.
    pub fn closest(&self, target: &PeerId, k: usize, now_ms: u64) -> Vec<PeerDescriptor> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistEntry {
            dist: [u8; 32],
            peer_id: PeerId,
        }

        impl Ord for DistEntry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistEntry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistEntry> = BinaryHeap::with_capacity(k + 1);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                if entry.descriptor.is_expired_at(now_ms) {
                    continue;
                }
                let dist = entry.descriptor.peer_id.xor_distance(target);
                if heap.len() < k {
                    heap.push(DistEntry { dist, peer_id: entry.descriptor.peer_id });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(DistEntry { dist, peer_id: entry.descriptor.peer_id });
                    heap.pop();
                }
            }
        }

        let mut ranked = heap.into_sorted_vec();
        ranked.truncate(k);
        ranked
            .into_iter()
            .filter_map(|d| self.lookup(&d.peer_id))
            .collect()
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        if *peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, peer_id);
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| e.descriptor.peer_id == *peer_id)
            .map(|e| e.descriptor.clone())
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        if *peer_id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, peer_id);
        self.buckets[idx].remove(peer_id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptors(&self, now_ms: u64) -> Vec<PeerDescriptor> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| !e.descriptor.is_expired_at(now_ms))
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Drop expired descriptors. Returns how many were removed.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.entries.len();
            bucket.entries.retain(|e| !e.descriptor.is_expired_at(now_ms));
            removed += before - bucket.entries.len();
        }
        removed
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if bucket_idx < self.buckets.len() {
            self.buckets[bucket_idx].mark_refreshed();
        }
    }
}

// ============================================================================
// Descriptor Store
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum StoreOutcome {
    Stored,
    Replaced,
    /// An equal or newer descriptor is already held.
    Kept,
}

struct DescriptorStore {
    entries: LruCache<PeerId, PeerDescriptor>,
}

impl DescriptorStore {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Caller has verified the descriptor.
    fn store(&mut self, descriptor: PeerDescriptor) -> StoreOutcome {
        match self.entries.peek(&descriptor.peer_id) {
            Some(existing) if !descriptor.supersedes(existing) => StoreOutcome::Kept,
            Some(_) => {
                self.entries.put(descriptor.peer_id, descriptor);
                StoreOutcome::Replaced
            }
            None => {
                self.entries.put(descriptor.peer_id, descriptor);
                StoreOutcome::Stored
            }
        }
    }

    fn get(&mut self, peer_id: &PeerId, now_ms: u64) -> Option<PeerDescriptor> {
        let expired = self.entries.peek(peer_id)?.is_expired_at(now_ms);
        if expired {
            self.entries.pop(peer_id);
            return None;
        }
        self.entries.get(peer_id).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// DHT Node (handle + actor)
// ============================================================================

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: PeerId,
    network: Arc<N>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            network: self.network.clone(),
        }
    }
}

struct DhtNodeActor {
    id: PeerId,
    k: usize,
    alpha: usize,
    routing: RoutingTable,
    store: DescriptorStore,
    routing_limiter: RoutingInsertionLimiter,
    seeds: Vec<PeerAddr>,
    cmd_rx: mpsc::Receiver<Command>,
}

enum Command {
    /// Verified descriptor from an authenticated direct connection.
    ObserveDirectPeer(PeerDescriptor),
    /// Descriptor relayed by `from` (identifier), subject to the insertion limiter.
    ObserveFromPeer(PeerDescriptor, String, oneshot::Sender<bool>),
    RemovePeer(PeerId),
    AddSeed(PeerAddr),

    GetLookupParams(PeerId, oneshot::Sender<(usize, usize, Vec<PeerDescriptor>, Vec<PeerAddr>)>),
    LookupLocal(PeerId, oneshot::Sender<Option<PeerDescriptor>>),
    StoreLocal(PeerDescriptor, oneshot::Sender<bool>),
    NodeCount(oneshot::Sender<usize>),
    KnownPeers(oneshot::Sender<Vec<PeerDescriptor>>),

    HandleFindNode(PeerId, oneshot::Sender<Vec<PeerDescriptor>>),
    HandleFindValue(PeerId, oneshot::Sender<(Option<PeerDescriptor>, Vec<PeerDescriptor>)>),

    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    PurgeExpired,

    Quit,
}

fn verified(descriptor: &PeerDescriptor) -> bool {
    match descriptor.verify() {
        Ok(()) => true,
        Err(e) => {
            trace!(peer = %descriptor.peer_id.short(), error = %e, "dropping unverifiable descriptor");
            false
        }
    }
}

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(id: PeerId, network: Arc<N>, k: usize, alpha: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);

        let actor = DhtNodeActor {
            id,
            k: k.max(1),
            alpha: alpha.max(1),
            routing: RoutingTable::new(id, k),
            store: DescriptorStore::new(DESCRIPTOR_STORE_CAPACITY),
            routing_limiter: RoutingInsertionLimiter::new(),
            seeds: Vec::new(),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        let node = Self { cmd_tx, id, network };
        node.spawn_periodic_bucket_refresh();
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Bootstrap contact, used by lookups before the routing table has entries.
    pub async fn add_seed(&self, seed: PeerAddr) {
        let _ = self.cmd_tx.send(Command::AddSeed(seed)).await;
    }

    /// A peer we hold an authenticated connection with.
    pub async fn observe_direct_peer(&self, descriptor: PeerDescriptor) {
        let _ = self.cmd_tx.send(Command::ObserveDirectPeer(descriptor)).await;
    }

    pub async fn observe_from_peer(&self, descriptor: PeerDescriptor, from: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ObserveFromPeer(descriptor, from.to_string(), tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(*peer_id)).await;
    }

    pub async fn node_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::NodeCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Unexpired routing table entries.
    pub async fn known_peers(&self) -> Vec<PeerDescriptor> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::KnownPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn lookup_local(&self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::LookupLocal(*peer_id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    async fn store_local(&self, descriptor: PeerDescriptor) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StoreLocal(descriptor, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;

                if node.cmd_tx.send(Command::PurgeExpired).await.is_err() {
                    break;
                }

                let (tx, rx) = oneshot::channel();
                if node
                    .cmd_tx
                    .send(Command::GetStaleBuckets(BUCKET_STALE_THRESHOLD, tx))
                    .await
                    .is_err()
                {
                    break;
                }
                let stale_buckets = match rx.await {
                    Ok(buckets) => buckets,
                    Err(_) => break,
                };
                if stale_buckets.is_empty() {
                    continue;
                }

                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");
                for bucket_idx in stale_buckets {
                    let target = random_id_for_bucket(&node.id, bucket_idx);
                    if let Err(e) = node.iterative_find_node(target).await {
                        debug!(bucket = bucket_idx, error = ?e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Inbound RPC handlers
    // ------------------------------------------------------------------------

    pub async fn handle_find_node(&self, target: PeerId) -> Vec<PeerDescriptor> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HandleFindNode(target, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn handle_find_value(
        &self,
        peer_id: PeerId,
    ) -> (Option<PeerDescriptor>, Vec<PeerDescriptor>) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HandleFindValue(peer_id, tx)).await.is_err() {
            return (None, Vec::new());
        }
        rx.await.unwrap_or((None, Vec::new()))
    }

    /// Returns whether the descriptor was accepted.
    pub async fn handle_store(&self, descriptor: PeerDescriptor) -> bool {
        self.store_local(descriptor).await
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub async fn iterative_find_node(&self, target: PeerId) -> Result<Vec<PeerDescriptor>> {
        let lookup_start = Instant::now();

        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLookupParams(target, tx)).await.is_err() {
            return Err(anyhow!("DHT actor closed"));
        }
        let (k, alpha, mut shortlist, seeds) = rx.await.map_err(|_| anyhow!("DHT actor closed"))?;

        let mut seen: HashSet<PeerId> = shortlist.iter().map(|d| d.peer_id).collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut pending_seeds: Vec<PeerAddr> = seeds
            .into_iter()
            .filter(|s| s.peer_id.is_none_or(|id| id != self.id && !seen.contains(&id)))
            .collect();

        let mut best_distance = shortlist
            .first()
            .map(|d| d.peer_id.xor_distance(&target))
            .unwrap_or([0xff; 32]);
        let mut iteration = 0;

        loop {
            iteration += 1;
            if iteration > MAX_LOOKUP_ITERATIONS {
                warn!(target = %target.short(), iterations = iteration, "iterative lookup exceeded max iterations");
                break;
            }
            if lookup_start.elapsed() > LOOKUP_TOTAL_TIMEOUT {
                debug!(
                    target = %target.short(),
                    elapsed_ms = lookup_start.elapsed().as_millis(),
                    found = shortlist.len(),
                    "iterative lookup timeout, returning current results"
                );
                break;
            }

            let mut candidates: Vec<PeerAddr> = shortlist
                .iter()
                .filter(|d| !queried.contains(&d.peer_id) && d.peer_id != self.id)
                .take(alpha)
                .map(PeerAddr::from)
                .collect();
            candidates.append(&mut pending_seeds);

            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                if let Some(id) = c.peer_id {
                    queried.insert(id);
                }
            }

            let mut join_set = JoinSet::new();
            for addr in candidates {
                let net = self.network.clone();
                join_set.spawn(async move {
                    let result = match tokio::time::timeout(PER_QUERY_TIMEOUT, net.find_node(&addr, target)).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow!("query timeout")),
                    };
                    (addr, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((addr, result)) = joined else { continue };
                match result {
                    Ok(nodes) => {
                        let from = addr.identifier();
                        for n in nodes.into_iter().take(crate::messages::MAX_NODES_PER_REPLY) {
                            if n.peer_id == self.id || !verified(&n) {
                                continue;
                            }
                            self.observe_from_peer(n.clone(), &from).await;
                            if seen.insert(n.peer_id) {
                                shortlist.push(n);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %addr, error = %e, "find_node query failed; skipping");
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                distance_cmp(&a.peer_id.xor_distance(&target), &b.peer_id.xor_distance(&target))
            });
            shortlist.truncate(k);

            let mut any_closer = false;
            if let Some(first) = shortlist.first() {
                let new_best = first.peer_id.xor_distance(&target);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    any_closer = true;
                }
            }
            let unqueried_remaining = shortlist.iter().any(|d| !queried.contains(&d.peer_id));
            if !any_closer && !unqueried_remaining {
                break;
            }
        }

        debug!(
            target = %target.short(),
            found = shortlist.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );
        Ok(shortlist)
    }

    /// Walk toward our own id so that nearby peers learn about us and we about them.
    pub async fn bootstrap(&self) -> Result<Vec<PeerDescriptor>> {
        self.iterative_find_node(self.id).await
    }

    /// Resolve a descriptor. Local knowledge first, then the network.
    ///
    /// `Ok(None)` when nothing reachable knows the peer.
    pub async fn lookup(&self, peer_id: &PeerId) -> Result<Option<PeerDescriptor>> {
        if let Some(descriptor) = self.lookup_local(peer_id).await {
            return Ok(Some(descriptor));
        }

        let closest = self.iterative_find_node(*peer_id).await?;
        if let Some(hit) = closest.iter().find(|d| d.peer_id == *peer_id) {
            return Ok(Some(hit.clone()));
        }

        let target = *peer_id;
        let mut join_set = JoinSet::new();
        for descriptor in closest {
            let net = self.network.clone();
            join_set.spawn(async move {
                let addr = PeerAddr::from(&descriptor);
                match tokio::time::timeout(PER_QUERY_TIMEOUT, net.find_value(&addr, target)).await {
                    Ok(Ok((Some(found), _))) => Some(found),
                    _ => None,
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(found)) = joined
                && found.peer_id == target
                && verified(&found)
            {
                join_set.abort_all();
                self.store_local(found.clone()).await;
                return Ok(Some(found));
            }
        }

        Ok(None)
    }

    /// Store `descriptor` locally and at the closest peers to its id.
    /// Returns how many remote peers accepted it.
    pub async fn publish(&self, descriptor: PeerDescriptor) -> Result<usize> {
        if !self.store_local(descriptor.clone()).await {
            return Err(anyhow!("descriptor rejected locally"));
        }

        let closest = self.iterative_find_node(descriptor.peer_id).await?;
        if closest.is_empty() {
            debug!("no peers known yet; descriptor held locally only");
            return Ok(0);
        }

        let mut join_set = JoinSet::new();
        for peer in closest {
            let net = self.network.clone();
            let d = descriptor.clone();
            join_set.spawn(async move {
                let addr = PeerAddr::from(&peer);
                matches!(
                    tokio::time::timeout(PER_QUERY_TIMEOUT, net.store(&addr, d)).await,
                    Ok(Ok(true))
                )
            });
        }

        let mut accepted = 0;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl DhtNodeActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveDirectPeer(descriptor) => {
                    if verified(&descriptor) {
                        self.insert(descriptor);
                    }
                }
                Command::ObserveFromPeer(descriptor, from, reply) => {
                    let allowed = self.handle_observe_from_peer(descriptor, &from);
                    let _ = reply.send(allowed);
                }
                Command::RemovePeer(peer_id) => {
                    self.routing.remove(&peer_id);
                }
                Command::AddSeed(seed) => {
                    if !self.seeds.contains(&seed) {
                        self.seeds.push(seed);
                    }
                }
                Command::GetLookupParams(target, reply) => {
                    let closest = self.routing.closest(&target, self.k, now_ms());
                    let _ = reply.send((self.k, self.alpha, closest, self.seeds.clone()));
                }
                Command::LookupLocal(peer_id, reply) => {
                    let found = self.freshest(&peer_id, now_ms());
                    let _ = reply.send(found);
                }
                Command::StoreLocal(descriptor, reply) => {
                    let accepted = self.handle_store(descriptor);
                    let _ = reply.send(accepted);
                }
                Command::NodeCount(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::KnownPeers(reply) => {
                    let _ = reply.send(self.routing.descriptors(now_ms()));
                }
                Command::HandleFindNode(target, reply) => {
                    let closest = self.routing.closest(&target, self.k, now_ms());
                    let _ = reply.send(closest);
                }
                Command::HandleFindValue(peer_id, reply) => {
                    let now = now_ms();
                    let found = self.freshest(&peer_id, now);
                    let closer = if found.is_some() {
                        Vec::new()
                    } else {
                        self.routing.closest(&peer_id, self.k, now)
                    };
                    let _ = reply.send((found, closer));
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::PurgeExpired => {
                    let removed = self.routing.purge_expired(now_ms());
                    if removed > 0 {
                        debug!(removed, remaining = self.routing.len(), "purged expired routing entries");
                    }
                }
                Command::Quit => break,
            }
        }
    }

    fn insert(&mut self, descriptor: PeerDescriptor) {
        if descriptor.peer_id == self.id {
            return;
        }
        if let Some(BucketTouchOutcome::Evicted(old)) = self.routing.update(descriptor) {
            trace!(evicted = %old.peer_id.short(), "bucket full; evicted least-recently-seen peer");
        }
    }

    /// The newest unexpired descriptor held for `peer_id`, from the store or the
    /// routing table.
    fn freshest(&mut self, peer_id: &PeerId, now: u64) -> Option<PeerDescriptor> {
        let stored = self.store.get(peer_id, now);
        let routed = self.routing.lookup(peer_id).filter(|d| !d.is_expired_at(now));
        match (stored, routed) {
            (Some(stored), Some(routed)) if routed.supersedes(&stored) => Some(routed),
            (Some(stored), _) => Some(stored),
            (None, routed) => routed,
        }
    }

    fn handle_observe_from_peer(&mut self, descriptor: PeerDescriptor, from: &str) -> bool {
        if !verified(&descriptor) {
            return false;
        }
        if !self.routing_limiter.allow_insertion(from) {
            trace!(from = %from, "routing insertion rate limited");
            return false;
        }
        self.insert(descriptor);
        true
    }

    fn handle_store(&mut self, descriptor: PeerDescriptor) -> bool {
        if !verified(&descriptor) {
            return false;
        }
        let outcome = self.store.store(descriptor.clone());
        trace!(
            peer = %descriptor.peer_id.short(),
            outcome = ?outcome,
            held = self.store.len(),
            "descriptor store"
        );
        if descriptor.peer_id != self.id {
            self.insert(descriptor);
        }
        true
    }
}
