//! Replay cache: `(peer, nonce)` pairs seen within the TTL window.
//!
//! Each peer gets its own bounded LRU. Entries are only ever inserted or
//! refreshed on expiry, never promoted on lookup, so LRU order is insertion
//! order and a full peer cache forgets its oldest nonce first. The number of
//! tracked peers is bounded as well.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_TRACKED_PEERS: usize = 10_000;

pub struct ReplayCache {
    ttl: Duration,
    max_per_peer: NonZeroUsize,
    peers: Mutex<LruCache<String, LruCache<String, Instant>>>,
}

impl ReplayCache {
    pub fn new(ttl: Duration, max_per_peer: usize) -> Self {
        Self {
            ttl,
            max_per_peer: NonZeroUsize::new(max_per_peer).unwrap_or(NonZeroUsize::MIN),
            peers: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// `false` on first sight (and records it), `true` for a repeat before expiry.
    ///
    /// Empty peer or nonce is not a replay.
    pub fn is_replay(&self, peer: &str, nonce: &str) -> bool {
        if peer.is_empty() || nonce.is_empty() {
            return false;
        }

        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut peers = self.peers.lock();
        let max_per_peer = self.max_per_peer;
        let nonces = peers.get_or_insert_mut(peer.to_string(), || LruCache::new(max_per_peer));

        if let Some(&existing) = nonces.peek(nonce)
            && existing > now
        {
            warn!(event = "security", peer = %peer, "replayed nonce rejected");
            return true;
        }

        // New, or expired and seen again: (re)insert with a fresh deadline.
        nonces.put(nonce.to_string(), expires_at);
        false
    }

    /// Drop expired entries and empty peers. Returns the number of nonces removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let mut removed = 0;
        let mut empty_peers = Vec::new();

        for (peer, nonces) in peers.iter_mut() {
            let expired: Vec<String> = nonces
                .iter()
                .filter(|(_, expires_at)| **expires_at <= now)
                .map(|(nonce, _)| nonce.clone())
                .collect();
            for nonce in expired {
                nonces.pop(&nonce);
                removed += 1;
            }
            if nonces.is_empty() {
                empty_peers.push(peer.clone());
            }
        }
        for peer in empty_peers {
            peers.pop(&peer);
        }
        removed
    }

    pub fn tracked_peers(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn tracked_nonces(&self) -> usize {
        self.peers.lock().iter().map(|(_, n)| n.len()).sum()
    }

    /// Periodic [`cleanup`](Self::cleanup) until `cancel` fires.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.cleanup();
                        if removed > 0 {
                            debug!(removed, "replay cache cleanup");
                        }
                    }
                }
            }
        })
    }
}
