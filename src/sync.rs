//! # Mesh Sync
//!
//! Replicates the shared hash index between peers by sequence-numbered deltas.
//!
//! ## Index
//!
//! [`HashIndex`] keeps one [`MeshHashEntry`] per key. Every local change (a local
//! publish or an absorbed remote entry) takes the next local sequence number, so
//! `get_delta(since)` is a range scan over sequences. Remote sequence numbers are
//! never reused locally.
//!
//! Conflicts are last-writer-wins on `timestamp`. On a timestamp tie the entry
//! already held is kept and the tie is counted as a conflict. Peer entries
//! stamped more than five minutes past the local clock are rejected.
//!
//! ## Protocol
//!
//! ```text
//!   B                                   A
//!   |--- Hello { latest_sequence } ---->|
//!   |<-- Hello { latest_sequence } -----|
//!   |--- ReqDelta { since, max } ------>|
//!   |<-- PushDelta { entries } ---------|   repeat while pages are full
//!   |--- ChunkRequest (first 32 KiB) -->|   per new entry, when proofs are required
//!   |<-- ChunkResponse { data } --------|
//! ```
//!
//! `since` is B's watermark for A: the highest A-side sequence B has already
//! processed. It advances past every entry in a page, accepted or not.
//!
//! ## Proof of possession
//!
//! Before absorbing an entry from a peer, B fetches `min(size, 32 KiB)` bytes of
//! the content from that peer and compares their BLAKE3 hash with `byte_hash`. A
//! mismatch, a missing chunk, or a fetch that times out rejects the entry for
//! this round.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SyncConfig;
use crate::descriptor::PeerAddr;
use crate::error::MeshError;
use crate::identity::{PeerId, now_ms};
use crate::messages::{Hello, PushDelta, ReqDelta};
use crate::protocols::{ChunkFetcher, SyncRpc};

/// Bytes hashed into `byte_hash`, and fetched for a proof of possession.
pub const PROOF_CHUNK_LEN: u64 = 32 * 1024;

/// Upper bound on delta pages pulled from one peer in a single round.
const MAX_PAGES_PER_ROUND: usize = 64;

const MAX_KEY_LEN: usize = 1024;

/// How far ahead of the local clock a peer's entry timestamp may be.
const MAX_CLOCK_SKEW_MS: u64 = 5 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshHashEntry {
    pub key: String,
    /// Lowercase hex BLAKE3 of the first `min(size, 32 KiB)` bytes.
    pub byte_hash: String,
    pub size: u64,
    pub meta_flags: u32,
    pub origin_peer: PeerId,
    /// Sequence in the index of whoever sent the entry.
    pub sequence: u64,
    /// Milliseconds since the Unix epoch, set by the origin.
    pub timestamp: u64,
}

/// Hash of the proof prefix of some content.
pub fn byte_hash_of(prefix: &[u8]) -> String {
    blake3::hash(prefix).to_hex().to_string()
}

/// How many leading bytes back an entry of `size` bytes.
pub fn proof_len(size: u64, chunk_len: u64) -> u64 {
    size.min(chunk_len)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofPolicy {
    /// Absorb peer entries without checking content.
    Disabled,
    #[default]
    Required,
}

// ============================================================================
// Hash Index
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(u64),
    Updated(u64),
    /// Held entry is newer.
    Stale,
    /// Same timestamp, different content; the held entry stays.
    Conflict,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Inserted(_) | MergeOutcome::Updated(_))
    }
}

#[derive(Default)]
struct IndexInner {
    by_key: HashMap<String, MeshHashEntry>,
    by_sequence: BTreeMap<u64, String>,
    latest_sequence: u64,
}

impl IndexInner {
    fn assign(&mut self, mut entry: MeshHashEntry) -> u64 {
        if let Some(old) = self.by_key.get(&entry.key) {
            self.by_sequence.remove(&old.sequence);
        }
        self.latest_sequence += 1;
        let sequence = self.latest_sequence;
        entry.sequence = sequence;
        self.by_sequence.insert(sequence, entry.key.clone());
        self.by_key.insert(entry.key.clone(), entry);
        sequence
    }
}

/// The local replica. Shared by the sync service and the inbound RPC handlers.
#[derive(Default)]
pub struct HashIndex {
    inner: RwLock<IndexInner>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the entry for `key` as a local change.
    pub fn publish(
        &self,
        origin: PeerId,
        key: &str,
        byte_hash: &str,
        size: u64,
        meta_flags: u32,
    ) -> MeshHashEntry {
        let mut inner = self.inner.write();
        // A local publish always wins over what is held, even with a lagging clock.
        let timestamp = match inner.by_key.get(key) {
            Some(existing) => now_ms().max(existing.timestamp.saturating_add(1)),
            None => now_ms(),
        };
        let entry = MeshHashEntry {
            key: key.to_string(),
            byte_hash: byte_hash.to_ascii_lowercase(),
            size,
            meta_flags,
            origin_peer: origin,
            sequence: 0,
            timestamp,
        };
        let sequence = inner.assign(entry.clone());
        MeshHashEntry { sequence, ..entry }
    }

    /// What `merge` would do with `incoming`, without changing anything.
    pub fn classify(&self, incoming: &MeshHashEntry) -> MergeOutcome {
        let inner = self.inner.read();
        Self::classify_locked(&inner, incoming)
    }

    fn classify_locked(inner: &IndexInner, incoming: &MeshHashEntry) -> MergeOutcome {
        match inner.by_key.get(&incoming.key) {
            None => MergeOutcome::Inserted(0),
            Some(held) if incoming.timestamp > held.timestamp => MergeOutcome::Updated(0),
            Some(held) if incoming.timestamp == held.timestamp && !same_content(held, incoming) => {
                MergeOutcome::Conflict
            }
            Some(_) => MergeOutcome::Stale,
        }
    }

    /// Absorb a remote entry under last-writer-wins.
    pub fn merge(&self, incoming: MeshHashEntry) -> MergeOutcome {
        let mut inner = self.inner.write();
        match Self::classify_locked(&inner, &incoming) {
            MergeOutcome::Inserted(_) => MergeOutcome::Inserted(inner.assign(incoming)),
            MergeOutcome::Updated(_) => MergeOutcome::Updated(inner.assign(incoming)),
            other => other,
        }
    }

    /// Entries with `sequence > since`, ascending, at most `max`.
    pub fn get_delta(&self, since: u64, max: usize) -> Vec<MeshHashEntry> {
        let inner = self.inner.read();
        inner
            .by_sequence
            .range(since.saturating_add(1)..)
            .take(max)
            .filter_map(|(_, key)| inner.by_key.get(key).cloned())
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<MeshHashEntry> {
        self.inner.read().by_key.get(key).cloned()
    }

    pub fn latest_sequence(&self) -> u64 {
        self.inner.read().latest_sequence
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same_content(a: &MeshHashEntry, b: &MeshHashEntry) -> bool {
    a.byte_hash.eq_ignore_ascii_case(&b.byte_hash) && a.size == b.size && a.meta_flags == b.meta_flags
}

// ============================================================================
// Sync Service
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub entries: usize,
    pub peers: usize,
    pub merged: u64,
    pub rejected_proofs: u64,
    pub conflicts: u64,
    pub latest_sequence: u64,
}

/// Result of absorbing one batch of peer entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    pub rejected: usize,
    pub conflicts: usize,
    pub stale: usize,
}

impl MergeReport {
    pub(crate) fn absorb(&mut self, other: MergeReport) {
        self.merged += other.merged;
        self.rejected += other.rejected;
        self.conflicts += other.conflicts;
        self.stale += other.stale;
    }
}

#[derive(Default)]
struct PeerState {
    /// Remote sequence already processed.
    watermark: u64,
    /// Remote latest sequence as last announced.
    announced: u64,
}

#[derive(Default)]
struct Counters {
    merged: u64,
    rejected_proofs: u64,
    conflicts: u64,
}

pub struct MeshSyncService<C> {
    local_id: PeerId,
    index: Arc<HashIndex>,
    client: Arc<C>,
    config: SyncConfig,
    peers: Mutex<HashMap<String, PeerState>>,
    counters: Mutex<Counters>,
}

impl<C: SyncRpc + ChunkFetcher> MeshSyncService<C> {
    pub fn new(local_id: PeerId, index: Arc<HashIndex>, client: Arc<C>, config: SyncConfig) -> Self {
        Self {
            local_id,
            index,
            client,
            config,
            peers: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn index(&self) -> &Arc<HashIndex> {
        &self.index
    }

    pub fn publish_hash(
        &self,
        key: &str,
        byte_hash: &str,
        size: u64,
        meta_flags: u32,
    ) -> Result<MeshHashEntry, MeshError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(MeshError::invalid("key must be 1..=1024 bytes"));
        }
        if byte_hash.len() != 64 || !byte_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MeshError::invalid("byte hash must be 64 hex characters"));
        }
        let entry = self.index.publish(self.local_id, key, byte_hash, size, meta_flags);
        debug!(key = %entry.key, sequence = entry.sequence, "published hash");
        Ok(entry)
    }

    /// Delta for a peer; `max` is capped at the configured page size.
    pub fn get_delta(&self, since: u64, max: usize) -> Vec<MeshHashEntry> {
        let max = max.min(self.config.max_delta_entries);
        if max == 0 {
            return Vec::new();
        }
        self.index.get_delta(since, max)
    }

    pub fn handle_req_delta(&self, request: &ReqDelta) -> PushDelta {
        PushDelta {
            entries: self.get_delta(request.since_seq, request.max_entries as usize),
            latest_sequence: self.index.latest_sequence(),
        }
    }

    pub fn lookup_key(&self, key: &str) -> Option<MeshHashEntry> {
        self.index.get(key)
    }

    pub fn hello(&self) -> Hello {
        Hello {
            peer_id: self.local_id,
            latest_sequence: self.index.latest_sequence(),
        }
    }

    /// Record a peer's announcement and answer with ours.
    pub fn handle_hello(&self, remote: &Hello) -> Hello {
        self.peers
            .lock()
            .entry(remote.peer_id.to_hex())
            .or_default()
            .announced = remote.latest_sequence;
        self.hello()
    }

    /// Fetch the proof prefix of `entry` from `peer` and check it against `byte_hash`.
    pub async fn verify_possession(
        &self,
        peer: &PeerAddr,
        entry: &MeshHashEntry,
        cancel: &CancellationToken,
    ) -> bool {
        let length = proof_len(entry.size, PROOF_CHUNK_LEN);
        let fetch = self.client.request_chunk(peer, &entry.key, 0, length);

        let data = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = tokio::time::timeout(self.config.proof_timeout(), fetch) => match result {
                Ok(Ok(Some(data))) => data,
                Ok(Ok(None)) => {
                    debug!(peer = %peer, key = %entry.key, "peer does not hold claimed content");
                    return false;
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer, key = %entry.key, error = %e, "proof chunk fetch failed");
                    return false;
                }
                Err(_) => {
                    debug!(peer = %peer, key = %entry.key, "proof chunk fetch timed out");
                    return false;
                }
            },
        };

        data.len() as u64 == length && byte_hash_of(&data).eq_ignore_ascii_case(&entry.byte_hash)
    }

    /// Absorb entries received from `peer`, checking possession first when required.
    pub async fn merge_from_peer(
        &self,
        peer: &PeerAddr,
        entries: Vec<MeshHashEntry>,
        cancel: &CancellationToken,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        for entry in entries {
            if cancel.is_cancelled() {
                break;
            }
            if entry.key.is_empty() || entry.key.len() > MAX_KEY_LEN {
                report.rejected += 1;
                continue;
            }
            // A far-future timestamp would pin the key against every later writer.
            if entry.timestamp > now_ms().saturating_add(MAX_CLOCK_SKEW_MS) {
                warn!(
                    event = "security",
                    peer = %peer,
                    key = %entry.key,
                    timestamp = entry.timestamp,
                    "entry timestamp ahead of local clock; rejected"
                );
                report.rejected += 1;
                continue;
            }
            // Skip the proof for entries that would not change anything.
            match self.index.classify(&entry) {
                MergeOutcome::Stale => {
                    report.stale += 1;
                    continue;
                }
                MergeOutcome::Conflict => {
                    report.conflicts += 1;
                    self.counters.lock().conflicts += 1;
                    continue;
                }
                _ => {}
            }

            if self.config.proof_policy == ProofPolicy::Required
                && !self.verify_possession(peer, &entry, cancel).await
            {
                warn!(
                    event = "security",
                    peer = %peer,
                    key = %entry.key,
                    "proof of possession failed; entry rejected"
                );
                report.rejected += 1;
                self.counters.lock().rejected_proofs += 1;
                continue;
            }

            let key = entry.key.clone();
            match self.index.merge(entry) {
                outcome @ (MergeOutcome::Inserted(_) | MergeOutcome::Updated(_)) => {
                    trace!(key = %key, outcome = ?outcome, "merged entry");
                    report.merged += 1;
                    self.counters.lock().merged += 1;
                }
                MergeOutcome::Conflict => {
                    report.conflicts += 1;
                    self.counters.lock().conflicts += 1;
                }
                MergeOutcome::Stale => report.stale += 1,
            }
        }
        report
    }

    /// One sync round with `peer`: exchange hellos, then pull pages from our
    /// watermark until the peer has nothing newer.
    pub async fn sync_with(&self, peer: &PeerAddr, cancel: &CancellationToken) -> Result<MergeReport> {
        let remote = self
            .client
            .hello(peer, self.hello())
            .await
            .with_context(|| format!("hello to {peer}"))?;
        if let Some(expected) = peer.peer_id
            && remote.peer_id != expected
        {
            anyhow::bail!("hello from {peer} claims identity {}", remote.peer_id.short());
        }
        let peer_key = peer.peer_id.unwrap_or(remote.peer_id).to_hex();

        let mut since = {
            let mut peers = self.peers.lock();
            let state = peers.entry(peer_key.clone()).or_default();
            state.announced = remote.latest_sequence;
            state.watermark
        };
        // The peer's index restarted from scratch.
        if since > remote.latest_sequence {
            since = 0;
        }

        let page = self.config.max_delta_entries.max(1);
        let mut report = MergeReport::default();
        for _ in 0..MAX_PAGES_PER_ROUND {
            if cancel.is_cancelled() || since >= remote.latest_sequence {
                break;
            }
            let delta = self
                .client
                .request_delta(
                    peer,
                    ReqDelta {
                        since_seq: since,
                        max_entries: page as u32,
                    },
                )
                .await
                .with_context(|| format!("delta from {peer}"))?;

            let page_len = delta.entries.len();
            let next = delta
                .entries
                .iter()
                .map(|e| e.sequence)
                .max()
                .unwrap_or(since)
                .max(since);

            let batch = self.merge_from_peer(peer, delta.entries, cancel).await;
            report.absorb(batch);

            if cancel.is_cancelled() {
                break;
            }
            since = next;
            if let Some(state) = self.peers.lock().get_mut(&peer_key) {
                state.watermark = since;
                state.announced = state.announced.max(delta.latest_sequence);
            }
            if page_len < page || next >= delta.latest_sequence {
                break;
            }
        }

        debug!(
            peer = %peer,
            merged = report.merged,
            rejected = report.rejected,
            conflicts = report.conflicts,
            watermark = since,
            "sync round complete"
        );
        Ok(report)
    }

    /// Resolve one key directly from `peer` and absorb it if it checks out.
    pub async fn request_key(
        &self,
        peer: &PeerAddr,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<MeshHashEntry>> {
        let Some(entry) = self.client.request_key(peer, key).await? else {
            return Ok(None);
        };
        if entry.key != key {
            anyhow::bail!("peer answered for a different key");
        }
        self.merge_from_peer(peer, vec![entry], cancel).await;
        Ok(self.index.get(key))
    }

    pub fn stats(&self) -> SyncStats {
        let counters = self.counters.lock();
        SyncStats {
            entries: self.index.len(),
            peers: self.peers.lock().len(),
            merged: counters.merged,
            rejected_proofs: counters.rejected_proofs,
            conflicts: counters.conflicts,
            latest_sequence: self.index.latest_sequence(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::identity::Keypair;

    /// A remote peer backed by its own index and content.
    struct FakePeer {
        id: PeerId,
        index: Arc<HashIndex>,
        content: HashMap<String, Vec<u8>>,
        chunk_requests: AtomicUsize,
        delta_requests: Mutex<Vec<ReqDelta>>,
        stall_chunks: bool,
    }

    impl FakePeer {
        fn new() -> Self {
            Self {
                id: Keypair::generate().peer_id(),
                index: Arc::new(HashIndex::new()),
                content: HashMap::new(),
                chunk_requests: AtomicUsize::new(0),
                delta_requests: Mutex::new(Vec::new()),
                stall_chunks: false,
            }
        }

        /// Publish `content` honestly.
        fn share(&mut self, key: &str, content: Vec<u8>) -> MeshHashEntry {
            let prefix = &content[..proof_len(content.len() as u64, PROOF_CHUNK_LEN) as usize];
            let entry = self.index.publish(self.id, key, &byte_hash_of(prefix), content.len() as u64, 0);
            self.content.insert(key.to_string(), content);
            entry
        }

        fn addr(&self) -> PeerAddr {
            PeerAddr::new("10.0.0.5:50305", Some(self.id))
        }
    }

    #[async_trait]
    impl SyncRpc for FakePeer {
        async fn hello(&self, _to: &PeerAddr, _hello: Hello) -> Result<Hello> {
            Ok(Hello {
                peer_id: self.id,
                latest_sequence: self.index.latest_sequence(),
            })
        }

        async fn request_delta(&self, _to: &PeerAddr, request: ReqDelta) -> Result<PushDelta> {
            self.delta_requests.lock().push(request.clone());
            Ok(PushDelta {
                entries: self.index.get_delta(request.since_seq, request.max_entries as usize),
                latest_sequence: self.index.latest_sequence(),
            })
        }

        async fn request_key(&self, _to: &PeerAddr, key: &str) -> Result<Option<MeshHashEntry>> {
            Ok(self.index.get(key))
        }
    }

    #[async_trait]
    impl ChunkFetcher for FakePeer {
        async fn request_chunk(
            &self,
            _peer: &PeerAddr,
            key: &str,
            offset: u64,
            length: u64,
        ) -> Result<Option<Vec<u8>>> {
            self.chunk_requests.fetch_add(1, Ordering::SeqCst);
            if self.stall_chunks {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self.content.get(key).map(|c| {
                let start = (offset as usize).min(c.len());
                let end = (offset + length).min(c.len() as u64) as usize;
                c[start..end].to_vec()
            }))
        }
    }

    fn config(policy: ProofPolicy, page: usize) -> SyncConfig {
        SyncConfig {
            max_delta_entries: page,
            proof_policy: policy,
            ..SyncConfig::default()
        }
    }

    fn service(peer: FakePeer, policy: ProofPolicy, page: usize) -> MeshSyncService<FakePeer> {
        MeshSyncService::new(
            Keypair::generate().peer_id(),
            Arc::new(HashIndex::new()),
            Arc::new(peer),
            config(policy, page),
        )
    }

    fn entry(key: &str, hash_byte: u8, timestamp: u64) -> MeshHashEntry {
        MeshHashEntry {
            key: key.to_string(),
            byte_hash: hex::encode([hash_byte; 32]),
            size: 10,
            meta_flags: 0,
            origin_peer: PeerId::from_bytes([1; 32]),
            sequence: 99,
            timestamp,
        }
    }

    #[test]
    fn delta_is_ascending_bounded_and_after_since() {
        let index = HashIndex::new();
        let origin = PeerId::from_bytes([2; 32]);
        for i in 0..10 {
            index.publish(origin, &format!("k{i}"), &hex::encode([i as u8; 32]), 1, 0);
        }
        // Re-publishing k0 moves it to the end.
        index.publish(origin, "k0", &hex::encode([0xAA; 32]), 1, 0);

        let delta = index.get_delta(3, 4);
        assert_eq!(delta.len(), 4);
        assert!(delta.iter().all(|e| e.sequence > 3));
        assert!(delta.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let tail = index.get_delta(9, 100);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.last().map(|e| e.key.as_str()), Some("k0"));
        assert_eq!(index.len(), 10);
        assert_eq!(index.latest_sequence(), 11);
    }

    #[test]
    fn merge_assigns_local_sequence_and_replaces_newer() {
        let index = HashIndex::new();
        assert_eq!(index.merge(entry("song:1", 1, 100)), MergeOutcome::Inserted(1));
        assert_eq!(index.get("song:1").map(|e| e.sequence), Some(1));

        assert_eq!(index.merge(entry("song:1", 2, 200)), MergeOutcome::Updated(2));
        assert_eq!(index.len(), 1);
        let held = index.get("song:1").unwrap();
        assert_eq!(held.byte_hash, hex::encode([2u8; 32]));
        assert_eq!(index.get_delta(0, 10).len(), 1);

        assert_eq!(index.merge(entry("song:1", 3, 150)), MergeOutcome::Stale);
        assert_eq!(index.merge(entry("song:1", 4, 200)), MergeOutcome::Conflict);
        assert_eq!(index.get("song:1").unwrap().byte_hash, hex::encode([2u8; 32]));
        assert_eq!(index.merge(entry("song:1", 2, 200)), MergeOutcome::Stale);
    }

    #[test]
    fn publish_validates_input() {
        let svc = service(FakePeer::new(), ProofPolicy::Disabled, 10);
        assert!(matches!(
            svc.publish_hash("", &hex::encode([0u8; 32]), 1, 0),
            Err(MeshError::InvalidArgument(_))
        ));
        assert!(matches!(
            svc.publish_hash("k", "not-hex", 1, 0),
            Err(MeshError::InvalidArgument(_))
        ));
        let e = svc.publish_hash("k", &hex::encode([0xABu8; 32]).to_uppercase(), 1, 0).unwrap();
        assert_eq!(e.byte_hash, hex::encode([0xABu8; 32]));
        assert_eq!(svc.hello().latest_sequence, 1);
    }

    #[tokio::test]
    async fn song_scenario_accepts_entry_after_proof() {
        let mut a = FakePeer::new();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let published = a.share("song:1", content.clone());
        assert_eq!(published.size, 1000);
        assert_eq!(published.byte_hash, byte_hash_of(&content));
        let addr = a.addr();

        let b = service(a, ProofPolicy::Required, 100);
        let report = b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.rejected, 0);

        let held = b.lookup_key("song:1").unwrap();
        assert_eq!(held.byte_hash, published.byte_hash);
        assert_eq!(held.size, 1000);
        assert_eq!(b.client.chunk_requests.load(Ordering::SeqCst), 1);
        assert_eq!(b.client.delta_requests.lock()[0].since_seq, 0);

        let stats = b.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.merged, 1);
    }

    #[tokio::test]
    async fn poisoned_claim_is_rejected() {
        let mut a = FakePeer::new();
        a.share("real", vec![7u8; 64]);
        // Claims a hash for content it does not hold.
        a.index.publish(a.id, "fake", &hex::encode([0x11; 32]), 5000, 0);
        // Holds content, but announces the wrong hash for it.
        a.content.insert("lie".into(), vec![1u8; 100]);
        a.index.publish(a.id, "lie", &byte_hash_of(&[2u8; 100]), 100, 0);
        let addr = a.addr();

        let b = service(a, ProofPolicy::Required, 100);
        let report = b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.rejected, 2);
        assert!(b.lookup_key("real").is_some());
        assert!(b.lookup_key("fake").is_none());
        assert!(b.lookup_key("lie").is_none());
        assert_eq!(b.stats().rejected_proofs, 2);

        // The watermark moved past the rejected entries.
        let again = b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(again, MergeReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_proof_fetch_times_out() {
        let mut a = FakePeer::new();
        a.share("slow", vec![3u8; 10]);
        a.stall_chunks = true;
        let addr = a.addr();

        let b = service(a, ProofPolicy::Required, 100);
        let report = b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert!(b.lookup_key("slow").is_none());
    }

    #[tokio::test]
    async fn pages_follow_watermark() {
        let mut a = FakePeer::new();
        for i in 0..7 {
            a.share(&format!("k{i}"), vec![i as u8; 8]);
        }
        let addr = a.addr();

        let b = service(a, ProofPolicy::Disabled, 3);
        let report = b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.merged, 7);
        let sinces: Vec<u64> = b.client.delta_requests.lock().iter().map(|r| r.since_seq).collect();
        assert_eq!(sinces, vec![0, 3, 6]);
        assert_eq!(b.client.chunk_requests.load(Ordering::SeqCst), 0);

        // Nothing new: the hello shows the peer has nothing past our watermark.
        b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(b.client.delta_requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn request_key_resolves_single_entry() {
        let mut a = FakePeer::new();
        a.share("one", vec![9u8; 40]);
        a.share("two", vec![8u8; 40]);
        let addr = a.addr();

        let b = service(a, ProofPolicy::Required, 100);
        let got = b.request_key(&addr, "two", &CancellationToken::new()).await.unwrap();
        assert_eq!(got.map(|e| e.key), Some("two".to_string()));
        assert!(b.lookup_key("one").is_none());
        assert_eq!(b.request_key(&addr, "absent", &CancellationToken::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn handle_req_delta_clamps_page_size() {
        let b = service(FakePeer::new(), ProofPolicy::Disabled, 2);
        for i in 0..5u8 {
            b.publish_hash(&format!("k{i}"), &hex::encode([i; 32]), 1, 0).unwrap();
        }
        let push = b.handle_req_delta(&ReqDelta {
            since_seq: 0,
            max_entries: 1000,
        });
        assert_eq!(push.entries.len(), 2);
        assert_eq!(push.latest_sequence, 5);
    }

    #[test]
    fn req_delta_for_zero_entries_returns_empty_page() {
        let b = service(FakePeer::new(), ProofPolicy::Disabled, 10);
        b.publish_hash("k", &hex::encode([1u8; 32]), 1, 0).unwrap();
        let push = b.handle_req_delta(&ReqDelta {
            since_seq: 0,
            max_entries: 0,
        });
        assert!(push.entries.is_empty());
        assert_eq!(push.latest_sequence, 1);
    }

    #[test]
    fn local_publish_over_max_timestamp_does_not_overflow() {
        let index = HashIndex::new();
        index.merge(entry("k", 1, u64::MAX));
        let published = index.publish(PeerId::from_bytes([2; 32]), "k", &hex::encode([5u8; 32]), 1, 0);
        assert_eq!(published.timestamp, u64::MAX);
        assert_eq!(index.get("k").unwrap().byte_hash, hex::encode([5u8; 32]));
    }

    #[tokio::test]
    async fn future_timestamps_from_peer_are_rejected() {
        let a = FakePeer::new();
        let now = now_ms();
        a.index.merge(entry("far", 1, u64::MAX));
        a.index.merge(entry("ahead", 2, now + 60 * 60 * 1000));
        a.index.merge(entry("near", 3, now + 1_000));
        let addr = a.addr();

        let b = service(a, ProofPolicy::Disabled, 100);
        let report = b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.rejected, 2);
        assert!(b.lookup_key("far").is_none());
        assert!(b.lookup_key("ahead").is_none());
        assert!(b.lookup_key("near").is_some());
    }

    #[tokio::test]
    async fn proof_covers_full_prefix_of_large_entry() {
        let mut a = FakePeer::new();
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let published = a.share("big", content.clone());
        assert_eq!(published.byte_hash, byte_hash_of(&content[..PROOF_CHUNK_LEN as usize]));
        let addr = a.addr();

        let b = service(a, ProofPolicy::Required, 100);
        let report = b.sync_with(&addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.rejected, 0);
    }

    #[tokio::test]
    async fn hello_from_other_identity_is_refused() {
        let mut a = FakePeer::new();
        a.share("k", vec![1u8; 16]);
        let impostor = PeerAddr::new("10.0.0.5:50305", Some(PeerId::from_bytes([7; 32])));

        let b = service(a, ProofPolicy::Disabled, 100);
        assert!(b.sync_with(&impostor, &CancellationToken::new()).await.is_err());
        assert!(b.lookup_key("k").is_none());
        assert_eq!(b.stats().peers, 0);
        assert!(b.client.delta_requests.lock().is_empty());
    }
}
