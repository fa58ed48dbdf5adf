//! # Admission Control
//!
//! Two independent mechanisms gate every inbound request:
//!
//! - [`Blocklist`]: coarse deny by peer id or remote IP, with optional expiry.
//!   A blocked peer is rejected before any quota math runs.
//! - [`RateLimiter`]: a sliding one-minute window per `(peer, Operation)`.
//!   Operations never share a quota, so a search flood cannot starve sync.
//!
//! [`Admission`] applies them in that order.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SecurityViolation;
use crate::identity::PeerId;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Bound on tracked `(peer, operation)` windows; least recently used are forgotten.
const MAX_TRACKED_WINDOWS: usize = 20_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    MeshSearch,
    SyncRequest,
    ChunkRequest,
    Gossip,
    DhtRequest,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::MeshSearch => "mesh-search",
            Operation::SyncRequest => "sync",
            Operation::ChunkRequest => "chunk",
            Operation::Gossip => "gossip",
            Operation::DhtRequest => "dht",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-minute quotas, one per operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub mesh_search_per_minute: u32,
    pub sync_per_minute: u32,
    pub chunk_per_minute: u32,
    pub gossip_per_minute: u32,
    pub dht_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            mesh_search_per_minute: 30,
            sync_per_minute: 60,
            chunk_per_minute: 120,
            gossip_per_minute: 600,
            dht_per_minute: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn quota(&self, op: Operation) -> u32 {
        match op {
            Operation::MeshSearch => self.mesh_search_per_minute,
            Operation::SyncRequest => self.sync_per_minute,
            Operation::ChunkRequest => self.chunk_per_minute,
            Operation::Gossip => self.gossip_per_minute,
            Operation::DhtRequest => self.dht_per_minute,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub is_allowed: bool,
    pub reason: Option<String>,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self {
            is_allowed: true,
            reason: None,
        }
    }

    fn denied(reason: String) -> Self {
        Self {
            is_allowed: false,
            reason: Some(reason),
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    windows: Mutex<LruCache<(String, Operation), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_window(config, RATE_WINDOW)
    }

    pub fn with_window(config: RateLimitConfig, window: Duration) -> Self {
        Self {
            config,
            window,
            windows: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_WINDOWS).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Count one request against `(peer, op)` if the window has room.
    pub fn check(&self, peer: &str, op: Operation) -> RateLimitDecision {
        let quota = self.config.quota(op) as usize;
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let times = windows.get_or_insert_mut((peer.to_string(), op), VecDeque::new);

        while let Some(front) = times.front() {
            if now.duration_since(*front) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= quota {
            return RateLimitDecision::denied(format!(
                "{op} limit of {quota} requests per {}s exceeded",
                self.window.as_secs()
            ));
        }

        times.push_back(now);
        RateLimitDecision::allowed()
    }

    pub fn check_mesh_search_request(&self, peer: &str) -> RateLimitDecision {
        self.check(peer, Operation::MeshSearch)
    }

    pub fn check_sync_request(&self, peer: &str) -> RateLimitDecision {
        self.check(peer, Operation::SyncRequest)
    }

    pub fn check_chunk_request(&self, peer: &str) -> RateLimitDecision {
        self.check(peer, Operation::ChunkRequest)
    }

    pub fn check_gossip(&self, peer: &str) -> RateLimitDecision {
        self.check(peer, Operation::Gossip)
    }

    pub fn check_dht_request(&self, peer: &str) -> RateLimitDecision {
        self.check(peer, Operation::DhtRequest)
    }
}

// ============================================================================
// Blocklist
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKey {
    Peer(PeerId),
    Endpoint(IpAddr),
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockKey::Peer(id) => write!(f, "peer {}", id.short()),
            BlockKey::Endpoint(ip) => write!(f, "endpoint {ip}"),
        }
    }
}

#[derive(Clone, Debug)]
struct BlockEntry {
    reason: String,
    until: Option<Instant>,
}

#[derive(Default)]
pub struct Blocklist {
    entries: RwLock<HashMap<BlockKey, BlockEntry>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// `duration = None` blocks until [`unblock`](Self::unblock).
    pub fn block(&self, key: BlockKey, reason: impl Into<String>, duration: Option<Duration>) {
        let reason = reason.into();
        info!(key = %key, reason = %reason, "blocklisted");
        self.entries.write().insert(
            key,
            BlockEntry {
                reason,
                until: duration.map(|d| Instant::now() + d),
            },
        );
    }

    pub fn unblock(&self, key: &BlockKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// The block reason, if `key` is currently blocked. Expired entries are removed.
    pub fn is_blocked(&self, key: &BlockKey) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.until.is_none_or(|until| until > now) => {
                    return Some(entry.reason.clone());
                }
                Some(_) => {}
            }
        }
        self.entries.write().remove(key);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ============================================================================
// Admission
// ============================================================================

pub struct Admission {
    blocklist: Blocklist,
    limiter: RateLimiter,
}

impl Admission {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            blocklist: Blocklist::new(),
            limiter: RateLimiter::new(config),
        }
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Connection-level gate on the remote IP, before TLS completes.
    pub fn admit_endpoint(&self, ip: IpAddr) -> Result<(), SecurityViolation> {
        if let Some(reason) = self.blocklist.is_blocked(&BlockKey::Endpoint(ip)) {
            warn!(event = "security", endpoint = %ip, "rejected blocklisted endpoint");
            return Err(SecurityViolation::Blocklisted { reason });
        }
        Ok(())
    }

    pub fn admit_peer(&self, peer: &PeerId) -> Result<(), SecurityViolation> {
        if let Some(reason) = self.blocklist.is_blocked(&BlockKey::Peer(*peer)) {
            warn!(event = "security", peer = %peer.short(), "rejected blocklisted peer");
            return Err(SecurityViolation::Blocklisted { reason });
        }
        Ok(())
    }

    /// Blocklist first, then the per-operation quota.
    pub fn admit(&self, peer: &PeerId, op: Operation) -> Result<(), SecurityViolation> {
        self.admit_peer(peer)?;
        let decision = self.limiter.check(&peer.to_hex(), op);
        if !decision.is_allowed {
            let reason = decision.reason.unwrap_or_else(|| format!("{op} rate limited"));
            warn!(event = "security", peer = %peer.short(), op = %op, "rate limit exceeded");
            return Err(SecurityViolation::RateLimited { reason });
        }
        Ok(())
    }
}
