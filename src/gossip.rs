//! # Realm Gossip
//!
//! Best-effort flooding of small typed messages inside one realm.
//!
//! A realm is the trust boundary: a node only delivers and relays messages whose
//! `realm_id` equals its configured realm. Messages with no realm, or a foreign
//! one, are ignored outright.
//!
//! ## Bounds
//!
//! | Bound | Rule |
//! |-------|------|
//! | TTL | expired once `timestamp + ttl_ms < now`; expired messages are dropped |
//! | Hops | each link traversed adds one; relayed only while `hops < max_hops` |
//! | Dedup | ids seen recently (bounded LRU) are not processed twice |
//! | Size | payloads over 64 KiB are refused |
//!
//! Relayed copies go to every known peer except the one that sent the message and
//! its originator. Sends run on their own tasks so a slow peer never stalls the
//! actor.
//!
//! Subscriptions are keyed by `(message_type, realm)` and deliver into caller
//! supplied channels.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::config::GossipConfig;
use crate::descriptor::PeerAddr;
use crate::error::MeshError;
use crate::identity::{PeerId, now_ms};
use crate::messages::new_nonce;
use crate::protocols::GossipTransport;

pub const MSG_TYPE_HEALTH: &str = "health";
pub const MSG_TYPE_INVALIDATION: &str = "invalidation";

pub const MAX_GOSSIP_PAYLOAD: usize = 64 * 1024;

const MAX_MESSAGE_TYPE_LEN: usize = 128;
const MAX_ID_LEN: usize = 64;

/// Relayed peers are bounded so one message cannot fan out unboundedly.
const MAX_GOSSIP_PEERS: usize = 1_000;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: String,
    pub message_type: String,
    pub realm_id: Option<String>,
    pub originator: PeerId,
    /// Milliseconds since the Unix epoch, set by the originator.
    pub timestamp: u64,
    pub ttl_ms: u64,
    pub hops: u32,
    pub max_hops: u32,
    pub payload: Vec<u8>,
}

impl GossipMessage {
    pub fn new(
        message_type: impl Into<String>,
        originator: PeerId,
        payload: Vec<u8>,
        ttl: Duration,
        max_hops: u32,
    ) -> Self {
        Self {
            id: new_nonce(),
            message_type: message_type.into(),
            realm_id: None,
            originator,
            timestamp: now_ms(),
            ttl_ms: ttl.as_millis() as u64,
            hops: 0,
            max_hops,
            payload,
        }
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.timestamp.saturating_add(self.ttl_ms) < now_ms
    }

    pub fn can_forward(&self) -> bool {
        self.can_forward_at(now_ms())
    }

    pub fn can_forward_at(&self, now_ms: u64) -> bool {
        !self.is_expired_at(now_ms) && self.hops < self.max_hops
    }

    /// The copy put on the wire when relaying: one more hop, nothing else changed.
    pub fn create_forwarded_copy(&self) -> Self {
        Self {
            hops: self.hops.saturating_add(1),
            ..self.clone()
        }
    }

    fn is_well_formed(&self) -> bool {
        !self.id.is_empty()
            && self.id.len() <= MAX_ID_LEN
            && !self.message_type.is_empty()
            && self.message_type.len() <= MAX_MESSAGE_TYPE_LEN
            && self.payload.len() <= MAX_GOSSIP_PAYLOAD
    }
}

/// What happened to an incoming message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// Delivered locally and relayed to this many peers.
    Delivered { subscribers: usize, forwarded: usize },
    /// No realm, or not ours.
    ForeignRealm,
    Duplicate,
    Expired,
    Malformed,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

type SubscriptionKey = (String, String);

enum Command {
    Subscribe(SubscriptionKey, mpsc::Sender<GossipMessage>),
    Publish(GossipMessage, oneshot::Sender<usize>),
    HandleIncoming(GossipMessage, Option<PeerId>, oneshot::Sender<IncomingOutcome>),
    AddPeer(PeerAddr),
    RemovePeer(PeerId),
    SetPeers(Vec<PeerAddr>),
    PeerCount(oneshot::Sender<usize>),
    Quit,
}

// ============================================================================
// Handle (cheap to clone)
// ============================================================================

pub struct RealmGossip<N: GossipTransport> {
    cmd_tx: mpsc::Sender<Command>,
    local_id: PeerId,
    realm: Arc<str>,
    default_ttl: Duration,
    default_max_hops: u32,
    _network: std::marker::PhantomData<N>,
}

impl<N: GossipTransport> Clone for RealmGossip<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local_id: self.local_id,
            realm: self.realm.clone(),
            default_ttl: self.default_ttl,
            default_max_hops: self.default_max_hops,
            _network: std::marker::PhantomData,
        }
    }
}

impl<N: GossipTransport> RealmGossip<N> {
    pub fn spawn(network: Arc<N>, local_id: PeerId, realm: &str, config: &GossipConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1000);
        let actor = RealmGossipActor {
            network,
            local_id,
            realm: realm.to_string(),
            subscriptions: HashMap::new(),
            peers: HashMap::new(),
            seen: LruCache::new(
                NonZeroUsize::new(config.seen_cache_size).unwrap_or(NonZeroUsize::MIN),
            ),
            max_ttl_ms: config.default_ttl_secs.saturating_mul(1000),
            max_hops: config.default_max_hops,
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            local_id,
            realm: Arc::from(realm),
            default_ttl: config.default_ttl(),
            default_max_hops: config.default_max_hops,
            _network: std::marker::PhantomData,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// A message originated here with the configured TTL and hop limit.
    pub fn message(&self, message_type: &str, payload: Vec<u8>) -> GossipMessage {
        GossipMessage::new(message_type, self.local_id, payload, self.default_ttl, self.default_max_hops)
    }

    pub async fn subscribe(
        &self,
        message_type: &str,
        handler: mpsc::Sender<GossipMessage>,
    ) -> Result<(), MeshError> {
        let realm = self.realm.clone();
        self.subscribe_for_realm(message_type, &realm, handler).await
    }

    pub async fn subscribe_for_realm(
        &self,
        message_type: &str,
        realm: &str,
        handler: mpsc::Sender<GossipMessage>,
    ) -> Result<(), MeshError> {
        if message_type.is_empty() {
            return Err(MeshError::invalid("message type must not be empty"));
        }
        if realm.is_empty() {
            return Err(MeshError::invalid("realm must not be empty"));
        }
        if handler.is_closed() {
            return Err(MeshError::invalid("handler channel is closed"));
        }
        self.cmd_tx
            .send(Command::Subscribe((message_type.to_string(), realm.to_string()), handler))
            .await
            .map_err(|_| MeshError::fatal("gossip actor closed"))
    }

    /// Publish into our own realm.
    pub async fn publish(&self, message: GossipMessage) -> Result<usize, MeshError> {
        let realm = self.realm.clone();
        self.publish_for_realm(message, &realm).await
    }

    /// Stamp `realm` on the message and dispatch it to local subscribers and peers.
    ///
    /// Returns how many peers it was sent to. A message that can no longer be
    /// forwarded is dropped and reports zero.
    pub async fn publish_for_realm(&self, mut message: GossipMessage, realm: &str) -> Result<usize, MeshError> {
        if realm.is_empty() {
            return Err(MeshError::invalid("realm must not be empty"));
        }
        if message.payload.len() > MAX_GOSSIP_PAYLOAD {
            return Err(MeshError::invalid("gossip payload exceeds 64 KiB"));
        }
        if !message.is_well_formed() {
            return Err(MeshError::invalid("gossip message id or type is malformed"));
        }
        message.realm_id = Some(realm.to_string());
        if !message.can_forward() {
            trace!(id = %message.id, "dropping expired or hop-exhausted message");
            return Ok(0);
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(message, tx))
            .await
            .map_err(|_| MeshError::fatal("gossip actor closed"))?;
        rx.await.map_err(|_| MeshError::fatal("gossip actor closed"))
    }

    /// Process a message received from `from`.
    pub async fn handle_incoming(&self, message: GossipMessage, from: Option<PeerId>) -> IncomingOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::HandleIncoming(message, from, tx))
            .await
            .is_err()
        {
            return IncomingOutcome::Malformed;
        }
        rx.await.unwrap_or(IncomingOutcome::Malformed)
    }

    pub async fn add_peer(&self, peer: PeerAddr) {
        let _ = self.cmd_tx.send(Command::AddPeer(peer)).await;
    }

    pub async fn remove_peer(&self, peer_id: PeerId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(peer_id)).await;
    }

    /// Replace the relay set, e.g. with the currently known DHT peers.
    pub async fn set_peers(&self, peers: Vec<PeerAddr>) {
        let _ = self.cmd_tx.send(Command::SetPeers(peers)).await;
    }

    pub async fn peer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::PeerCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor (owns state)
// ============================================================================

struct RealmGossipActor<N: GossipTransport> {
    network: Arc<N>,
    local_id: PeerId,
    realm: String,
    subscriptions: HashMap<SubscriptionKey, Vec<mpsc::Sender<GossipMessage>>>,
    peers: HashMap<PeerId, PeerAddr>,
    seen: LruCache<String, ()>,
    /// Local ceilings for sender-chosen bounds.
    max_ttl_ms: u64,
    max_hops: u32,
}

impl<N: GossipTransport> RealmGossipActor<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Subscribe(key, handler) => {
                    debug!(message_type = %key.0, realm = %key.1, "gossip subscription added");
                    self.subscriptions.entry(key).or_default().push(handler);
                }
                Command::Publish(message, reply) => {
                    self.seen.put(message.id.clone(), ());
                    self.deliver_local(&message);
                    let sent = self.relay(&message, None);
                    let _ = reply.send(sent);
                }
                Command::HandleIncoming(message, from, reply) => {
                    let _ = reply.send(self.handle_incoming(message, from));
                }
                Command::AddPeer(peer) => self.add_peer(peer),
                Command::RemovePeer(peer_id) => {
                    self.peers.remove(&peer_id);
                }
                Command::SetPeers(peers) => {
                    self.peers.clear();
                    for peer in peers {
                        self.add_peer(peer);
                    }
                }
                Command::PeerCount(reply) => {
                    let _ = reply.send(self.peers.len());
                }
                Command::Quit => {
                    debug!("gossip actor quitting");
                    break;
                }
            }
        }
    }

    fn add_peer(&mut self, peer: PeerAddr) {
        let Some(peer_id) = peer.peer_id else { return };
        if peer_id == self.local_id {
            return;
        }
        if self.peers.len() >= MAX_GOSSIP_PEERS && !self.peers.contains_key(&peer_id) {
            return;
        }
        self.peers.insert(peer_id, peer);
    }

    fn handle_incoming(&mut self, mut message: GossipMessage, from: Option<PeerId>) -> IncomingOutcome {
        match message.realm_id.as_deref() {
            Some(realm) if realm == self.realm => {}
            other => {
                trace!(id = %message.id, realm = ?other, "ignoring gossip outside our realm");
                return IncomingOutcome::ForeignRealm;
            }
        }
        if !message.is_well_formed() {
            return IncomingOutcome::Malformed;
        }
        if self.seen.contains(&message.id) {
            return IncomingOutcome::Duplicate;
        }
        message.ttl_ms = message.ttl_ms.min(self.max_ttl_ms);
        message.max_hops = message.max_hops.min(self.max_hops);
        if message.is_expired_at(now_ms()) {
            trace!(id = %message.id, "dropping expired gossip");
            return IncomingOutcome::Expired;
        }
        self.seen.put(message.id.clone(), ());

        let subscribers = self.deliver_local(&message);
        let forwarded = if message.can_forward() {
            self.relay(&message, from)
        } else {
            0
        };
        IncomingOutcome::Delivered { subscribers, forwarded }
    }

    fn deliver_local(&mut self, message: &GossipMessage) -> usize {
        let Some(realm) = message.realm_id.clone() else {
            return 0;
        };
        let key = (message.message_type.clone(), realm);
        let Some(handlers) = self.subscriptions.get_mut(&key) else {
            return 0;
        };
        handlers.retain(|h| !h.is_closed());
        let mut delivered = 0;
        for handler in handlers.iter() {
            match handler.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(id = %message.id, message_type = %message.message_type, "subscriber lagging; message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Send the next-hop copy to every peer except `from` and the originator.
    fn relay(&self, message: &GossipMessage, from: Option<PeerId>) -> usize {
        let copy = message.create_forwarded_copy();
        let mut sent = 0;
        for (peer_id, addr) in &self.peers {
            if Some(*peer_id) == from || *peer_id == message.originator {
                continue;
            }
            let network = self.network.clone();
            let addr = addr.clone();
            let copy = copy.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(SEND_TIMEOUT, network.send_gossip(&addr, copy)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => trace!(peer = %addr, error = %e, "gossip send failed"),
                    Err(_) => trace!(peer = %addr, "gossip send timed out"),
                }
            });
            sent += 1;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::identity::Keypair;

    struct RecordingTransport {
        sent: mpsc::UnboundedSender<(PeerAddr, GossipMessage)>,
    }

    #[async_trait]
    impl GossipTransport for RecordingTransport {
        async fn send_gossip(&self, to: &PeerAddr, message: GossipMessage) -> Result<()> {
            let _ = self.sent.send((to.clone(), message));
            Ok(())
        }
    }

    struct Harness {
        gossip: RealmGossip<RecordingTransport>,
        sent: Mutex<mpsc::UnboundedReceiver<(PeerAddr, GossipMessage)>>,
    }

    impl Harness {
        fn new(realm: &str) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let gossip = RealmGossip::spawn(
                Arc::new(RecordingTransport { sent: tx }),
                Keypair::generate().peer_id(),
                realm,
                &GossipConfig::default(),
            );
            Self {
                gossip,
                sent: Mutex::new(rx),
            }
        }

        async fn next_sent(&self) -> (PeerAddr, GossipMessage) {
            tokio::time::timeout(Duration::from_secs(5), self.sent.lock().await.recv())
                .await
                .expect("send within timeout")
                .expect("transport alive")
        }
    }

    fn peer(n: u8) -> PeerAddr {
        PeerAddr::new(format!("10.0.0.{n}:50305"), Some(PeerId::from_bytes([n; 32])))
    }

    fn incoming(realm: Option<&str>, originator: PeerId) -> GossipMessage {
        let mut msg = GossipMessage::new(MSG_TYPE_HEALTH, originator, b"ok".to_vec(), Duration::from_secs(60), 3);
        msg.realm_id = realm.map(str::to_string);
        msg
    }

    #[test]
    fn forwarding_bounds() {
        let origin = PeerId::from_bytes([1; 32]);
        let mut msg = GossipMessage::new("t", origin, vec![], Duration::from_secs(10), 2);
        let now = msg.timestamp;
        assert!(msg.can_forward_at(now));

        msg.hops = 2;
        assert!(!msg.can_forward_at(now));

        msg.hops = 0;
        assert!(msg.can_forward_at(now + 10_000));
        assert!(!msg.can_forward_at(now + 10_001));
    }

    #[test]
    fn forwarded_copy_adds_one_hop_only() {
        let mut msg = GossipMessage::new("t", PeerId::from_bytes([1; 32]), vec![1, 2], Duration::from_secs(10), 5);
        msg.realm_id = Some("r".into());
        let copy = msg.create_forwarded_copy();
        assert_eq!(copy.hops, msg.hops + 1);
        assert_eq!(copy.id, msg.id);
        assert_eq!(GossipMessage { hops: msg.hops, ..copy }, msg);
    }

    #[tokio::test]
    async fn subscribe_rejects_bad_arguments() {
        let h = Harness::new("home");
        let (tx, rx) = mpsc::channel(4);
        assert!(matches!(h.gossip.subscribe("", tx.clone()).await, Err(MeshError::InvalidArgument(_))));
        assert!(matches!(
            h.gossip.subscribe_for_realm("t", "", tx.clone()).await,
            Err(MeshError::InvalidArgument(_))
        ));
        drop(rx);
        assert!(matches!(h.gossip.subscribe("t", tx).await, Err(MeshError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn foreign_and_missing_realm_ignored() {
        let h = Harness::new("home");
        h.gossip.add_peer(peer(2)).await;
        let (tx, mut rx) = mpsc::channel(4);
        h.gossip.subscribe(MSG_TYPE_HEALTH, tx).await.unwrap();

        let origin = PeerId::from_bytes([9; 32]);
        assert_eq!(
            h.gossip.handle_incoming(incoming(None, origin), Some(origin)).await,
            IncomingOutcome::ForeignRealm
        );
        assert_eq!(
            h.gossip.handle_incoming(incoming(Some("work"), origin), Some(origin)).await,
            IncomingOutcome::ForeignRealm
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn incoming_is_delivered_and_relayed_except_to_sender_and_origin() {
        let h = Harness::new("home");
        let sender = peer(2);
        let origin = peer(3);
        let other = peer(4);
        h.gossip.set_peers(vec![sender.clone(), origin.clone(), other.clone()]).await;
        let (tx, mut rx) = mpsc::channel(4);
        h.gossip.subscribe(MSG_TYPE_HEALTH, tx).await.unwrap();

        let msg = incoming(Some("home"), origin.peer_id.unwrap());
        let outcome = h.gossip.handle_incoming(msg.clone(), sender.peer_id).await;
        assert_eq!(outcome, IncomingOutcome::Delivered { subscribers: 1, forwarded: 1 });
        assert_eq!(rx.recv().await.unwrap(), msg);

        let (to, relayed) = h.next_sent().await;
        assert_eq!(to, other);
        assert_eq!(relayed, msg.create_forwarded_copy());

        // Same id again is suppressed.
        assert_eq!(
            h.gossip.handle_incoming(msg, sender.peer_id).await,
            IncomingOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn hop_exhausted_message_delivered_but_not_relayed() {
        let h = Harness::new("home");
        h.gossip.add_peer(peer(4)).await;
        let (tx, mut rx) = mpsc::channel(4);
        h.gossip.subscribe(MSG_TYPE_HEALTH, tx).await.unwrap();

        let mut msg = incoming(Some("home"), PeerId::from_bytes([9; 32]));
        msg.hops = msg.max_hops;
        let outcome = h.gossip.handle_incoming(msg, None).await;
        assert_eq!(outcome, IncomingOutcome::Delivered { subscribers: 1, forwarded: 0 });
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn expired_incoming_dropped() {
        let h = Harness::new("home");
        let mut msg = incoming(Some("home"), PeerId::from_bytes([9; 32]));
        msg.timestamp = now_ms() - 120_000;
        assert_eq!(h.gossip.handle_incoming(msg, None).await, IncomingOutcome::Expired);
    }

    #[tokio::test]
    async fn sender_bounds_are_capped_by_local_config() {
        let h = Harness::new("home");
        h.gossip.add_peer(peer(4)).await;
        let defaults = GossipConfig::default();

        let mut wide = incoming(Some("home"), PeerId::from_bytes([9; 32]));
        wide.max_hops = u32::MAX;
        wide.hops = defaults.default_max_hops;
        assert_eq!(
            h.gossip.handle_incoming(wide, None).await,
            IncomingOutcome::Delivered { subscribers: 0, forwarded: 0 }
        );

        let mut immortal = incoming(Some("home"), PeerId::from_bytes([9; 32]));
        immortal.ttl_ms = u64::MAX;
        immortal.timestamp = now_ms() - defaults.default_ttl_secs * 1000 - 60_000;
        assert_eq!(h.gossip.handle_incoming(immortal, None).await, IncomingOutcome::Expired);
    }

    #[tokio::test]
    async fn publish_stamps_realm_and_sends_next_hop() {
        let h = Harness::new("home");
        h.gossip.add_peer(peer(5)).await;
        let (tx, mut rx) = mpsc::channel(4);
        h.gossip.subscribe(MSG_TYPE_INVALIDATION, tx).await.unwrap();

        let msg = h.gossip.message(MSG_TYPE_INVALIDATION, b"song:1".to_vec());
        assert_eq!(h.gossip.publish(msg.clone()).await.unwrap(), 1);

        let local = rx.recv().await.unwrap();
        assert_eq!(local.realm_id.as_deref(), Some("home"));
        let (_, wire) = h.next_sent().await;
        assert_eq!(wire.hops, 1);
        assert_eq!(wire.id, msg.id);
        assert_eq!(wire.realm_id.as_deref(), Some("home"));
    }

    #[tokio::test]
    async fn publish_drops_unforwardable_message() {
        let h = Harness::new("home");
        h.gossip.add_peer(peer(5)).await;

        let mut expired = h.gossip.message("t", vec![]);
        expired.timestamp = 0;
        assert_eq!(h.gossip.publish(expired).await.unwrap(), 0);

        let mut exhausted = h.gossip.message("t", vec![]);
        exhausted.hops = exhausted.max_hops;
        assert_eq!(h.gossip.publish_for_realm(exhausted, "home").await.unwrap(), 0);

        let oversized = h.gossip.message("t", vec![0; MAX_GOSSIP_PAYLOAD + 1]);
        assert!(matches!(h.gossip.publish(oversized).await, Err(MeshError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn publish_for_other_realm_skips_local_subscribers_of_ours() {
        let h = Harness::new("home");
        let (tx, mut rx) = mpsc::channel(4);
        h.gossip.subscribe("t", tx).await.unwrap();
        let (tx_other, mut rx_other) = mpsc::channel(4);
        h.gossip.subscribe_for_realm("t", "work", tx_other).await.unwrap();

        h.gossip.publish_for_realm(h.gossip.message("t", vec![]), "work").await.unwrap();
        assert_eq!(rx_other.recv().await.unwrap().realm_id.as_deref(), Some("work"));
        assert!(rx.try_recv().is_err());
    }
}
